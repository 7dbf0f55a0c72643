use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot};

use crate::error::{RenderQueueError, Result};
use crate::estimator::{BatchEta, JobEstimate};
use crate::scheduler::engine::{
    Advance, BatchSummary, Completion, Dispatch, Scheduler, SchedulerStatus,
};
use crate::scheduler::job::{Job, JobId, JobStatus};
use crate::scheduler::queue::MoveDirection;
use crate::store::LifetimeStats;
use crate::worker::{JobExecutor, ProcessRunner, RunOutcome};

const COMMAND_CHANNEL_CAPACITY: usize = 64;
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Notifications published while the queue runs.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SchedulerEvent {
    JobStarted {
        job_id: JobId,
        path: PathBuf,
        attempt: u32,
    },
    JobOutput {
        job_id: JobId,
        line: String,
    },
    JobFinished {
        job_id: JobId,
        status: JobStatus,
        attempts: u32,
        duration: Duration,
    },
    BatchCompleted {
        summary: BatchSummary,
    },
    BatchHalted {
        summary: BatchSummary,
    },
}

/// Requests handled by the scheduler task.
#[derive(Debug)]
pub enum SchedulerCommand {
    AddJob {
        path: PathBuf,
        response_tx: oneshot::Sender<Result<Job>>,
    },
    RemoveJob {
        job_id: JobId,
        response_tx: oneshot::Sender<Result<Job>>,
    },
    RemoveJobs {
        job_ids: Vec<JobId>,
        response_tx: oneshot::Sender<Result<Vec<Job>>>,
    },
    RemoveAll {
        response_tx: oneshot::Sender<usize>,
    },
    MoveJob {
        job_id: JobId,
        direction: MoveDirection,
        response_tx: oneshot::Sender<Result<()>>,
    },
    ResetJob {
        job_id: JobId,
        response_tx: oneshot::Sender<Result<Job>>,
    },
    ResetAll {
        response_tx: oneshot::Sender<usize>,
    },
    ClearDone {
        response_tx: oneshot::Sender<usize>,
    },
    Reload {
        response_tx: oneshot::Sender<Result<usize>>,
    },
    StartBatch {
        response_tx: oneshot::Sender<Result<Option<JobId>>>,
    },
    Cancel {
        response_tx: oneshot::Sender<bool>,
    },
    SetAutoRetry {
        enabled: bool,
        response_tx: oneshot::Sender<()>,
    },
    SetSingleFrame {
        enabled: bool,
        response_tx: oneshot::Sender<()>,
    },
    ListJobs {
        response_tx: oneshot::Sender<Vec<Job>>,
    },
    GetJob {
        job_id: JobId,
        response_tx: oneshot::Sender<Result<Job>>,
    },
    Resolve {
        reference: String,
        response_tx: oneshot::Sender<Result<JobId>>,
    },
    Estimate {
        job_id: JobId,
        response_tx: oneshot::Sender<Result<JobEstimate>>,
    },
    Eta {
        response_tx: oneshot::Sender<BatchEta>,
    },
    Stats {
        response_tx: oneshot::Sender<LifetimeStats>,
    },
    Status {
        response_tx: oneshot::Sender<SchedulerStatus>,
    },
}

/// Message from the worker task back to the scheduler.
#[derive(Debug)]
enum WorkerEvent {
    Finished { job_id: JobId, outcome: RunOutcome },
}

/// Cloneable front door to the scheduler task.
#[derive(Debug, Clone)]
pub struct SchedulerHandle {
    command_tx: mpsc::Sender<SchedulerCommand>,
    events_tx: broadcast::Sender<SchedulerEvent>,
}

impl SchedulerHandle {
    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.events_tx.subscribe()
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> SchedulerCommand,
    ) -> Result<T> {
        let (response_tx, response_rx) = oneshot::channel();
        self.command_tx
            .send(build(response_tx))
            .await
            .map_err(|_| RenderQueueError::SchedulerUnavailable)?;
        response_rx
            .await
            .map_err(|_| RenderQueueError::SchedulerUnavailable)
    }

    pub async fn add_job(&self, path: impl Into<PathBuf>) -> Result<Job> {
        let path = path.into();
        self.request(|response_tx| SchedulerCommand::AddJob { path, response_tx })
            .await?
    }

    pub async fn remove_job(&self, job_id: JobId) -> Result<Job> {
        self.request(|response_tx| SchedulerCommand::RemoveJob { job_id, response_tx })
            .await?
    }

    pub async fn remove_jobs(&self, job_ids: Vec<JobId>) -> Result<Vec<Job>> {
        self.request(|response_tx| SchedulerCommand::RemoveJobs {
            job_ids,
            response_tx,
        })
        .await?
    }

    pub async fn remove_all(&self) -> Result<usize> {
        self.request(|response_tx| SchedulerCommand::RemoveAll { response_tx })
            .await
    }

    pub async fn move_job(&self, job_id: JobId, direction: MoveDirection) -> Result<()> {
        self.request(|response_tx| SchedulerCommand::MoveJob {
            job_id,
            direction,
            response_tx,
        })
        .await?
    }

    pub async fn reset_job(&self, job_id: JobId) -> Result<Job> {
        self.request(|response_tx| SchedulerCommand::ResetJob { job_id, response_tx })
            .await?
    }

    pub async fn reset_all(&self) -> Result<usize> {
        self.request(|response_tx| SchedulerCommand::ResetAll { response_tx })
            .await
    }

    pub async fn clear_done(&self) -> Result<usize> {
        self.request(|response_tx| SchedulerCommand::ClearDone { response_tx })
            .await
    }

    pub async fn reload(&self) -> Result<usize> {
        self.request(|response_tx| SchedulerCommand::Reload { response_tx })
            .await?
    }

    /// Start a batch. Returns the id of the first dispatched job, or `None`
    /// when nothing was eligible.
    pub async fn start_batch(&self) -> Result<Option<JobId>> {
        self.request(|response_tx| SchedulerCommand::StartBatch { response_tx })
            .await?
    }

    /// Cancel the rendering job. Returns false when nothing was rendering.
    pub async fn cancel(&self) -> Result<bool> {
        self.request(|response_tx| SchedulerCommand::Cancel { response_tx })
            .await
    }

    pub async fn set_auto_retry(&self, enabled: bool) -> Result<()> {
        self.request(|response_tx| SchedulerCommand::SetAutoRetry {
            enabled,
            response_tx,
        })
        .await
    }

    pub async fn set_single_frame(&self, enabled: bool) -> Result<()> {
        self.request(|response_tx| SchedulerCommand::SetSingleFrame {
            enabled,
            response_tx,
        })
        .await
    }

    pub async fn jobs(&self) -> Result<Vec<Job>> {
        self.request(|response_tx| SchedulerCommand::ListJobs { response_tx })
            .await
    }

    pub async fn job(&self, job_id: JobId) -> Result<Job> {
        self.request(|response_tx| SchedulerCommand::GetJob { job_id, response_tx })
            .await?
    }

    /// Look a job up by id or by target path.
    pub async fn resolve(&self, reference: impl Into<String>) -> Result<JobId> {
        let reference = reference.into();
        self.request(|response_tx| SchedulerCommand::Resolve {
            reference,
            response_tx,
        })
        .await?
    }

    pub async fn estimate(&self, job_id: JobId) -> Result<JobEstimate> {
        self.request(|response_tx| SchedulerCommand::Estimate { job_id, response_tx })
            .await?
    }

    pub async fn eta(&self) -> Result<BatchEta> {
        self.request(|response_tx| SchedulerCommand::Eta { response_tx })
            .await
    }

    pub async fn stats(&self) -> Result<LifetimeStats> {
        self.request(|response_tx| SchedulerCommand::Stats { response_tx })
            .await
    }

    pub async fn status(&self) -> Result<SchedulerStatus> {
        self.request(|response_tx| SchedulerCommand::Status { response_tx })
            .await
    }
}

/// Single owner of the [`Scheduler`].
///
/// User commands and worker completions arrive on channels and are applied
/// one at a time, so the queue never sees concurrent mutation. Execution
/// happens on a separate worker task fed through a channel of capacity 1.
pub struct SchedulerService {
    scheduler: Scheduler,
    order_tx: mpsc::Sender<Dispatch>,
    events_tx: broadcast::Sender<SchedulerEvent>,
}

impl SchedulerService {
    /// Spawn the scheduler and worker tasks and return a handle to them.
    /// Must be called from within a Tokio runtime.
    pub fn spawn(scheduler: Scheduler, runner: Arc<dyn ProcessRunner>) -> SchedulerHandle {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (order_tx, order_rx) = mpsc::channel(1);
        let (finished_tx, finished_rx) = mpsc::channel(1);
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        tokio::spawn(worker_loop(
            JobExecutor::new(runner),
            order_rx,
            finished_tx,
            events_tx.clone(),
        ));

        let service = Self {
            scheduler,
            order_tx,
            events_tx: events_tx.clone(),
        };
        tokio::spawn(service.run(command_rx, finished_rx));

        SchedulerHandle {
            command_tx,
            events_tx,
        }
    }

    async fn run(
        mut self,
        mut command_rx: mpsc::Receiver<SchedulerCommand>,
        mut finished_rx: mpsc::Receiver<WorkerEvent>,
    ) {
        loop {
            tokio::select! {
                command = command_rx.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                Some(WorkerEvent::Finished { job_id, outcome }) = finished_rx.recv() => {
                    self.handle_finished(job_id, outcome).await;
                }
            }
        }

        if self.scheduler.cancel() {
            tracing::info!("All scheduler handles dropped, cancelled the rendering job");
        }
        tracing::debug!("Scheduler task stopped");
    }

    async fn handle_command(&mut self, command: SchedulerCommand) {
        let scheduler = &mut self.scheduler;
        match command {
            SchedulerCommand::AddJob { path, response_tx } => {
                let _ = response_tx.send(scheduler.add_job(&path));
            }
            SchedulerCommand::RemoveJob {
                job_id,
                response_tx,
            } => {
                let _ = response_tx.send(scheduler.remove_job(&job_id));
            }
            SchedulerCommand::RemoveJobs {
                job_ids,
                response_tx,
            } => {
                let _ = response_tx.send(scheduler.remove_jobs(&job_ids));
            }
            SchedulerCommand::RemoveAll { response_tx } => {
                let _ = response_tx.send(scheduler.remove_all());
            }
            SchedulerCommand::MoveJob {
                job_id,
                direction,
                response_tx,
            } => {
                let _ = response_tx.send(scheduler.move_job(&job_id, direction));
            }
            SchedulerCommand::ResetJob {
                job_id,
                response_tx,
            } => {
                let _ = response_tx.send(scheduler.reset_job(&job_id));
            }
            SchedulerCommand::ResetAll { response_tx } => {
                let _ = response_tx.send(scheduler.reset_all());
            }
            SchedulerCommand::ClearDone { response_tx } => {
                let _ = response_tx.send(scheduler.clear_done());
            }
            SchedulerCommand::Reload { response_tx } => {
                let _ = response_tx.send(scheduler.reload());
            }
            SchedulerCommand::StartBatch { response_tx } => match scheduler.start_batch() {
                Ok(advance) => {
                    let _ = response_tx.send(Ok(advance.dispatched_job()));
                    self.drive(advance).await;
                }
                Err(e) => {
                    let _ = response_tx.send(Err(e));
                }
            },
            SchedulerCommand::Cancel { response_tx } => {
                let _ = response_tx.send(scheduler.cancel());
            }
            SchedulerCommand::SetAutoRetry {
                enabled,
                response_tx,
            } => {
                scheduler.set_auto_retry(enabled);
                let _ = response_tx.send(());
            }
            SchedulerCommand::SetSingleFrame {
                enabled,
                response_tx,
            } => {
                scheduler.set_single_frame(enabled);
                let _ = response_tx.send(());
            }
            SchedulerCommand::ListJobs { response_tx } => {
                let _ = response_tx.send(scheduler.jobs());
            }
            SchedulerCommand::GetJob {
                job_id,
                response_tx,
            } => {
                let _ = response_tx.send(scheduler.job(&job_id).cloned());
            }
            SchedulerCommand::Resolve {
                reference,
                response_tx,
            } => {
                let _ = response_tx.send(scheduler.resolve(&reference));
            }
            SchedulerCommand::Estimate {
                job_id,
                response_tx,
            } => {
                let _ = response_tx.send(scheduler.estimate(&job_id));
            }
            SchedulerCommand::Eta { response_tx } => {
                let _ = response_tx.send(scheduler.eta());
            }
            SchedulerCommand::Stats { response_tx } => {
                let _ = response_tx.send(scheduler.stats());
            }
            SchedulerCommand::Status { response_tx } => {
                let _ = response_tx.send(scheduler.status());
            }
        }
    }

    async fn handle_finished(&mut self, job_id: JobId, outcome: RunOutcome) {
        match self.scheduler.complete(&job_id, outcome) {
            Ok(completion) => {
                self.publish_finished(&completion);
                self.drive(completion.next).await;
            }
            Err(e) => {
                tracing::error!(job_id = %job_id, error = %e, "Worker reported an unexpected job");
            }
        }
    }

    /// Hand dispatched jobs to the worker and publish batch transitions.
    async fn drive(&mut self, mut advance: Advance) {
        loop {
            match advance {
                Advance::Dispatched(dispatch) => {
                    self.publish(SchedulerEvent::JobStarted {
                        job_id: dispatch.job_id,
                        path: dispatch.path.clone(),
                        attempt: dispatch.attempt,
                    });
                    let job_id = dispatch.job_id;
                    if self.order_tx.send(dispatch).await.is_ok() {
                        return;
                    }

                    tracing::error!(job_id = %job_id, "Worker task is gone, abandoning job");
                    let abandoned = RunOutcome::Cancelled {
                        duration: Duration::ZERO,
                    };
                    match self.scheduler.complete(&job_id, abandoned) {
                        Ok(completion) => {
                            self.publish_finished(&completion);
                            advance = completion.next;
                        }
                        Err(e) => {
                            tracing::error!(job_id = %job_id, error = %e, "Failed to abandon job");
                            return;
                        }
                    }
                }
                Advance::Drained(summary) => {
                    self.publish(SchedulerEvent::BatchCompleted { summary });
                    return;
                }
                Advance::Halted(summary) => {
                    self.publish(SchedulerEvent::BatchHalted { summary });
                    return;
                }
                Advance::Idle => return,
            }
        }
    }

    fn publish_finished(&self, completion: &Completion) {
        self.publish(SchedulerEvent::JobFinished {
            job_id: completion.job.id,
            status: completion.job.status,
            attempts: completion.job.attempts,
            duration: completion.outcome.duration(),
        });
    }

    fn publish(&self, event: SchedulerEvent) {
        // No subscribers is fine.
        let _ = self.events_tx.send(event);
    }
}

/// Executes dispatched jobs one at a time and reports each outcome back.
async fn worker_loop(
    executor: JobExecutor,
    mut order_rx: mpsc::Receiver<Dispatch>,
    finished_tx: mpsc::Sender<WorkerEvent>,
    events_tx: broadcast::Sender<SchedulerEvent>,
) {
    while let Some(dispatch) = order_rx.recv().await {
        let job_id = dispatch.job_id;
        let outcome = executor
            .execute(
                job_id,
                &dispatch.path,
                &dispatch.mode,
                &dispatch.cancel,
                |line| {
                    let _ = events_tx.send(SchedulerEvent::JobOutput { job_id, line });
                },
            )
            .await;

        if finished_tx
            .send(WorkerEvent::Finished { job_id, outcome })
            .await
            .is_err()
        {
            tracing::warn!(job_id = %job_id, "Scheduler task is gone, worker stopping");
            break;
        }
    }
}
