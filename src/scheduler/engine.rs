use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::config::SchedulerConfig;
use crate::error::{RenderQueueError, Result};
use crate::estimator::{self, BatchEta, JobEstimate};
use crate::scheduler::job::{job_id_for, Job, JobId, JobStatus};
use crate::scheduler::queue::{JobQueue, MoveDirection};
use crate::store::{LifetimeStats, RunOutcomeKind, Stores};
use crate::worker::{RenderMode, RunOutcome};

/// A job handed to the worker.
#[derive(Debug, Clone)]
pub struct Dispatch {
    pub job_id: JobId,
    pub path: PathBuf,
    /// Attempt number, starting at 1
    pub attempt: u32,
    pub mode: RenderMode,
    pub cancel: CancellationToken,
}

/// Totals for one batch, from its first dispatch to drain or cancellation.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchSummary {
    pub dispatched: u32,
    pub succeeded: u32,
    pub failed: u32,
    pub canceled: u32,
    pub elapsed: Duration,
}

/// What the scheduler did after a batch start or a completed attempt.
#[derive(Debug, Clone)]
pub enum Advance {
    /// The next job is ready to be executed
    Dispatched(Dispatch),
    /// Nothing eligible is left; the batch is over
    Drained(BatchSummary),
    /// The batch was interrupted by a cancellation and waits for a restart
    Halted(BatchSummary),
    /// No batch is running
    Idle,
}

impl Advance {
    pub fn dispatched_job(&self) -> Option<JobId> {
        match self {
            Advance::Dispatched(dispatch) => Some(dispatch.job_id),
            _ => None,
        }
    }
}

/// The outcome of one attempt as applied to the queue.
#[derive(Debug, Clone)]
pub struct Completion {
    pub job: Job,
    pub outcome: RunOutcome,
    pub next: Advance,
}

/// Snapshot of scheduler state for status displays.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SchedulerStatus {
    pub rendering: Option<JobId>,
    pub rendering_attempt: Option<u32>,
    pub rendering_elapsed: Option<Duration>,
    pub batch_active: bool,
    pub auto_retry: bool,
    pub render_mode: RenderMode,
    pub total_jobs: usize,
    pub ready: usize,
    pub done: usize,
    pub error: usize,
    pub canceled: usize,
}

#[derive(Debug)]
struct ActiveRender {
    job_id: JobId,
    attempt: u32,
    started_at: Instant,
    cancel: CancellationToken,
}

#[derive(Debug)]
struct BatchState {
    started_at: Instant,
    summary: BatchSummary,
    /// Jobs that failed during this batch. Without auto-retry they are not
    /// picked up again until the next explicit start.
    failed: HashSet<JobId>,
}

impl BatchState {
    fn new() -> Self {
        Self {
            started_at: Instant::now(),
            summary: BatchSummary::default(),
            failed: HashSet::new(),
        }
    }

    fn finish(mut self) -> BatchSummary {
        self.summary.elapsed = self.started_at.elapsed();
        self.summary
    }
}

/// Owns the render queue and its lifecycle rules.
///
/// This is plain synchronous state; [`SchedulerService`](super::SchedulerService)
/// wraps it in a single task so every mutation is serialised. Persisted state
/// is written after every change, and a failed write is logged without
/// undoing the in-memory change.
#[derive(Debug)]
pub struct Scheduler {
    config: SchedulerConfig,
    queue: JobQueue,
    stores: Stores,
    active: Option<ActiveRender>,
    batch: Option<BatchState>,
    stop_requested: bool,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig, stores: Stores) -> Self {
        let queue = JobQueue::from_jobs(stores.jobs.load());
        tracing::info!(
            jobs = queue.len(),
            auto_retry = config.auto_retry,
            mode = ?config.render_mode(),
            "Scheduler initialised"
        );
        Self {
            config,
            queue,
            stores,
            active: None,
            batch: None,
            stop_requested: false,
        }
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    pub fn jobs(&self) -> Vec<Job> {
        self.queue.all_jobs().to_vec()
    }

    pub fn job(&self, id: &JobId) -> Result<&Job> {
        self.queue
            .get_job(id)
            .ok_or_else(|| RenderQueueError::JobNotFound(id.to_string()))
    }

    pub fn auto_retry(&self) -> bool {
        self.config.auto_retry
    }

    pub fn set_auto_retry(&mut self, enabled: bool) {
        self.config.auto_retry = enabled;
        tracing::info!(enabled, "Auto-retry toggled");
    }

    /// Switch between full-animation and single-frame renders. Takes effect
    /// from the next dispatch and is saved as the default for later sessions.
    pub fn set_single_frame(&mut self, enabled: bool) {
        self.config.single_frame = enabled;
        tracing::info!(enabled, "Single-frame mode toggled");

        let mut settings = self.stores.settings.load();
        settings.single_frame_mode = enabled;
        if let Err(e) = self.stores.settings.save(&settings) {
            tracing::warn!(error = %e, "Failed to save settings");
        }
    }

    pub fn is_rendering(&self) -> bool {
        self.active.is_some()
    }

    // ------------------------------------------------------------------
    // Queue management
    // ------------------------------------------------------------------

    /// Queue a render target. The file must exist and have an accepted
    /// extension; its canonical path becomes the job identity.
    pub fn add_job(&mut self, path: &Path) -> Result<Job> {
        if !self.config.accepts(path) {
            return Err(RenderQueueError::UnsupportedTarget(path.to_path_buf()));
        }
        let path = std::fs::canonicalize(path)
            .map_err(|_| RenderQueueError::TargetMissing(path.to_path_buf()))?;
        if !path.is_file() {
            return Err(RenderQueueError::TargetMissing(path));
        }

        let job = Job::new(path);
        self.queue.add_job(job.clone())?;
        tracing::info!(job_id = %job.id, path = %job.path.display(), "Job added");
        self.persist_queue();
        Ok(job)
    }

    pub fn remove_job(&mut self, id: &JobId) -> Result<Job> {
        let job = self.queue.remove_job(id)?;
        tracing::info!(job_id = %id, "Job removed");
        self.persist_queue();
        Ok(job)
    }

    /// Remove several jobs. Stops at the first rejected id; jobs removed
    /// before it stay removed.
    pub fn remove_jobs(&mut self, ids: &[JobId]) -> Result<Vec<Job>> {
        let mut removed = Vec::with_capacity(ids.len());
        let mut rejected = None;
        for id in ids {
            match self.queue.remove_job(id) {
                Ok(job) => removed.push(job),
                Err(e) => {
                    rejected = Some(e);
                    break;
                }
            }
        }
        if !removed.is_empty() {
            tracing::info!(count = removed.len(), "Jobs removed");
            self.persist_queue();
        }
        match rejected {
            Some(e) => Err(e),
            None => Ok(removed),
        }
    }

    /// Remove every job that is not rendering.
    pub fn remove_all(&mut self) -> usize {
        let removed = self.queue.remove_all();
        tracing::info!(removed, "Queue cleared");
        self.persist_queue();
        removed
    }

    pub fn move_job(&mut self, id: &JobId, direction: MoveDirection) -> Result<()> {
        self.queue.move_job(id, direction)?;
        self.persist_queue();
        Ok(())
    }

    pub fn reset_job(&mut self, id: &JobId) -> Result<Job> {
        let job = self.queue.reset_job(id)?.clone();
        tracing::info!(job_id = %id, "Job reset");
        self.persist_queue();
        Ok(job)
    }

    pub fn reset_all(&mut self) -> usize {
        let changed = self.queue.reset_all();
        tracing::info!(changed, "All idle jobs reset");
        self.persist_queue();
        changed
    }

    pub fn clear_done(&mut self) -> usize {
        let changed = self.queue.clear_done();
        tracing::info!(changed, "Finished jobs cleared");
        self.persist_queue();
        changed
    }

    /// Re-read the queue from storage, discarding in-memory state.
    pub fn reload(&mut self) -> Result<usize> {
        if let Some(active) = &self.active {
            return Err(RenderQueueError::InvariantViolation(format!(
                "cannot reload the queue while job {} is rendering",
                active.job_id
            )));
        }
        self.queue = JobQueue::from_jobs(self.stores.jobs.load());
        tracing::info!(jobs = self.queue.len(), "Queue reloaded");
        Ok(self.queue.len())
    }

    // ------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------

    /// Start a batch: clear any stale stop request and dispatch the first
    /// eligible job.
    pub fn start_batch(&mut self) -> Result<Advance> {
        if let Some(active) = &self.active {
            return Err(RenderQueueError::InvariantViolation(format!(
                "job {} is already rendering",
                active.job_id
            )));
        }
        self.stop_requested = false;
        self.batch = Some(BatchState::new());
        tracing::info!("Batch started");
        self.advance()
    }

    /// Dispatch the next eligible job of the running batch, or close the
    /// batch when none is left.
    pub fn advance(&mut self) -> Result<Advance> {
        if let Some(active) = &self.active {
            return Err(RenderQueueError::InvariantViolation(format!(
                "job {} is already rendering",
                active.job_id
            )));
        }
        let Some(batch) = &self.batch else {
            return Ok(Advance::Idle);
        };

        let exclude = if self.config.auto_retry {
            HashSet::new()
        } else {
            batch.failed.clone()
        };

        match self.queue.next_eligible(self.config.auto_retry, &exclude) {
            Some(id) => self.dispatch(id).map(Advance::Dispatched),
            None => {
                let summary = self.finish_batch();
                tracing::info!(
                    dispatched = summary.dispatched,
                    succeeded = summary.succeeded,
                    failed = summary.failed,
                    elapsed_secs = summary.elapsed.as_secs_f64(),
                    "Batch complete"
                );
                Ok(Advance::Drained(summary))
            }
        }
    }

    fn dispatch(&mut self, id: JobId) -> Result<Dispatch> {
        let job = self.queue.transition(&id, JobStatus::Rendering)?;
        job.attempts += 1;
        let dispatch = Dispatch {
            job_id: id,
            path: job.path.clone(),
            attempt: job.attempts,
            mode: self.config.render_mode(),
            cancel: CancellationToken::new(),
        };

        self.active = Some(ActiveRender {
            job_id: id,
            attempt: dispatch.attempt,
            started_at: Instant::now(),
            cancel: dispatch.cancel.clone(),
        });
        if let Some(batch) = &mut self.batch {
            batch.summary.dispatched += 1;
        }

        tracing::info!(
            job_id = %id,
            path = %dispatch.path.display(),
            attempt = dispatch.attempt,
            "Job dispatched"
        );
        self.persist_queue();
        Ok(dispatch)
    }

    /// Ask the rendering job to stop. Returns false when nothing is
    /// rendering.
    pub fn cancel(&mut self) -> bool {
        match &self.active {
            Some(active) => {
                self.stop_requested = true;
                active.cancel.cancel();
                tracing::info!(job_id = %active.job_id, "Cancellation requested");
                true
            }
            None => false,
        }
    }

    /// Apply the outcome of the rendering job, record it, and move the batch
    /// along unless a cancellation interrupted it.
    pub fn complete(&mut self, id: &JobId, outcome: RunOutcome) -> Result<Completion> {
        let active = match self.active.take() {
            Some(active) if active.job_id == *id => active,
            other => {
                let rendering = other.as_ref().map(|a| a.job_id.to_string());
                self.active = other;
                return Err(RenderQueueError::InvariantViolation(format!(
                    "job {} is not the rendering job ({})",
                    id,
                    rendering.as_deref().unwrap_or("none")
                )));
            }
        };

        let (status, kind) = match outcome {
            RunOutcome::Success { .. } => (JobStatus::Done, RunOutcomeKind::Success),
            RunOutcome::Failure { .. } => (JobStatus::Error, RunOutcomeKind::Error),
            RunOutcome::Cancelled { .. } => (JobStatus::Canceled, RunOutcomeKind::Canceled),
        };
        let duration = outcome.duration();

        let job = self.queue.transition(id, status)?;
        if status == JobStatus::Done {
            job.attempts = 0;
            job.last_duration = Some(duration);
        }
        let name = job.display_name();

        if status == JobStatus::Error && self.config.auto_retry {
            self.queue.move_to_tail(id)?;
        }

        if let Some(batch) = &mut self.batch {
            match kind {
                RunOutcomeKind::Success => batch.summary.succeeded += 1,
                RunOutcomeKind::Error => {
                    batch.summary.failed += 1;
                    batch.failed.insert(*id);
                }
                RunOutcomeKind::Canceled => batch.summary.canceled += 1,
            }
        }

        match outcome {
            RunOutcome::Failure { exit_code, .. } => tracing::warn!(
                job_id = %id,
                attempt = active.attempt,
                exit_code,
                "Render failed"
            ),
            _ => tracing::info!(
                job_id = %id,
                status = %status,
                attempt = active.attempt,
                elapsed_secs = duration.as_secs_f64(),
                "Render finished"
            ),
        }

        self.record_outcome(&name, kind, active.attempt, duration);
        self.persist_queue();

        let job = self.job(id)?.clone();
        let halted = std::mem::take(&mut self.stop_requested) || kind == RunOutcomeKind::Canceled;
        let next = if halted && self.batch.is_some() {
            let summary = self.finish_batch();
            tracing::info!(job_id = %id, "Batch halted by cancellation");
            Advance::Halted(summary)
        } else if halted {
            Advance::Idle
        } else {
            self.advance()?
        };

        Ok(Completion { job, outcome, next })
    }

    fn finish_batch(&mut self) -> BatchSummary {
        self.batch.take().map(BatchState::finish).unwrap_or_default()
    }

    fn record_outcome(
        &mut self,
        name: &str,
        kind: RunOutcomeKind,
        attempt: u32,
        duration: Duration,
    ) {
        if kind == RunOutcomeKind::Success {
            self.stores.history.record(name, duration.as_secs_f64());
            if let Err(e) = self.stores.history.save() {
                tracing::warn!(error = %e, "Failed to persist render history");
            }
        }
        self.stores.stats.record(name, kind, attempt, duration);
        if let Err(e) = self.stores.stats.save() {
            tracing::warn!(error = %e, "Failed to persist lifetime stats");
        }
    }

    fn persist_queue(&mut self) {
        if let Err(e) = self.stores.jobs.save(self.queue.all_jobs()) {
            tracing::warn!(error = %e, "Failed to persist job queue");
        }
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub fn estimate(&self, id: &JobId) -> Result<JobEstimate> {
        let name = self.job(id)?.display_name();
        let samples = self.stores.history.samples(&name);
        Ok(JobEstimate::from_samples(name, samples))
    }

    pub fn eta(&self) -> BatchEta {
        let elapsed = self.active.as_ref().map(|a| a.started_at.elapsed());
        estimator::batch_eta(self.queue.all_jobs(), self.stores.history.entries(), elapsed)
    }

    pub fn stats(&self) -> LifetimeStats {
        self.stores.stats.stats().clone()
    }

    pub fn status(&self) -> SchedulerStatus {
        SchedulerStatus {
            rendering: self.active.as_ref().map(|a| a.job_id),
            rendering_attempt: self.active.as_ref().map(|a| a.attempt),
            rendering_elapsed: self.active.as_ref().map(|a| a.started_at.elapsed()),
            batch_active: self.batch.is_some(),
            auto_retry: self.config.auto_retry,
            render_mode: self.config.render_mode(),
            total_jobs: self.queue.len(),
            ready: self.queue.count_with_status(JobStatus::Ready),
            done: self.queue.count_with_status(JobStatus::Done),
            error: self.queue.count_with_status(JobStatus::Error),
            canceled: self.queue.count_with_status(JobStatus::Canceled),
        }
    }

    /// Resolve a user-supplied reference (job id or target path) to a job id.
    pub fn resolve(&self, reference: &str) -> Result<JobId> {
        if let Ok(id) = reference.parse::<JobId>() {
            if self.queue.get_job(&id).is_some() {
                return Ok(id);
            }
        }
        let path = Path::new(reference);
        let candidates = [
            std::fs::canonicalize(path).ok(),
            Some(path.to_path_buf()),
        ];
        candidates
            .into_iter()
            .flatten()
            .map(|p| job_id_for(&p))
            .find(|id| self.queue.get_job(id).is_some())
            .ok_or_else(|| RenderQueueError::JobNotFound(reference.to_string()))
    }
}
