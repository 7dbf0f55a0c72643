use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;

use crate::api::{run_api, ApiState};
use crate::config::AppConfig;
use crate::error::{RenderQueueError, Result};
use crate::scheduler::{BatchSummary, Scheduler, SchedulerEvent, SchedulerHandle, SchedulerService};
use crate::store::Stores;
use crate::worker::{EngineRunner, ProcessRunner};

/// How a headless batch run ended.
#[derive(Debug, Clone, PartialEq)]
pub enum BatchOutcome {
    /// Every eligible job was processed
    Completed(BatchSummary),
    /// A cancellation stopped the batch
    Halted(BatchSummary),
}

/// Wires the stores, scheduler, worker and render engine together.
pub struct Runtime {
    pub config: AppConfig,
    pub handle: SchedulerHandle,
}

impl Runtime {
    /// Start with the real render engine. Must be called from within a
    /// Tokio runtime.
    pub fn start(config: AppConfig) -> Self {
        let runner = Arc::new(EngineRunner::new(config.engine.clone()));
        Self::start_with_runner(config, runner)
    }

    pub fn start_with_runner(config: AppConfig, runner: Arc<dyn ProcessRunner>) -> Self {
        let stores = Stores::open(&config.storage);
        let scheduler = Scheduler::new(config.scheduler.clone(), stores);
        let handle = SchedulerService::spawn(scheduler, runner);

        tracing::info!(
            engine = %config.engine.executable.display(),
            data_dir = ?config.storage.data_dir,
            "Render queue started"
        );

        Self { config, handle }
    }

    /// Run one batch to completion, forwarding every event to `on_event`.
    ///
    /// When `shutdown` fires the rendering job is cancelled and the call
    /// returns once the scheduler reports the halted batch.
    pub async fn run_batch<F>(
        &self,
        shutdown: CancellationToken,
        mut on_event: F,
    ) -> Result<BatchOutcome>
    where
        F: FnMut(&SchedulerEvent),
    {
        let mut events = self.handle.subscribe();
        self.handle.start_batch().await?;

        let mut cancel_sent = false;
        loop {
            tokio::select! {
                _ = shutdown.cancelled(), if !cancel_sent => {
                    cancel_sent = true;
                    if !self.handle.cancel().await? {
                        tracing::debug!("Shutdown requested between jobs");
                    }
                }
                event = events.recv() => match event {
                    Ok(event) => {
                        on_event(&event);
                        match event {
                            SchedulerEvent::BatchCompleted { summary } => {
                                return Ok(BatchOutcome::Completed(summary));
                            }
                            SchedulerEvent::BatchHalted { summary } => {
                                return Ok(BatchOutcome::Halted(summary));
                            }
                            _ => {}
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Event consumer lagging, events dropped");
                    }
                    Err(RecvError::Closed) => return Err(RenderQueueError::SchedulerUnavailable),
                },
            }
        }
    }

    /// Serve the HTTP control API until `shutdown` fires, then cancel any
    /// rendering job.
    pub async fn serve(&self, addr: SocketAddr, shutdown: CancellationToken) -> Result<()> {
        let state = ApiState {
            scheduler: self.handle.clone(),
        };
        run_api(addr, state, shutdown).await?;

        if self.handle.cancel().await? {
            tracing::info!("Cancelled the rendering job on shutdown");
        }
        Ok(())
    }
}
