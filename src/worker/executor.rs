use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::scheduler::JobId;
use crate::worker::runner::{ProcessRunner, RenderMode};

/// Exit code reported when the engine could not be started at all.
pub const SPAWN_FAILURE_EXIT_CODE: i32 = -1;

/// Result of one render attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunOutcome {
    Success { duration: Duration },
    Failure { exit_code: i32, duration: Duration },
    Cancelled { duration: Duration },
}

impl RunOutcome {
    pub fn duration(&self) -> Duration {
        match self {
            RunOutcome::Success { duration }
            | RunOutcome::Failure { duration, .. }
            | RunOutcome::Cancelled { duration } => *duration,
        }
    }

    fn from_exit_code(exit_code: i32, duration: Duration) -> Self {
        if exit_code == 0 {
            RunOutcome::Success { duration }
        } else {
            RunOutcome::Failure {
                exit_code,
                duration,
            }
        }
    }
}

/// Drives a single render invocation to an outcome.
///
/// Output is streamed line by line; the cancellation token is checked
/// between lines and while waiting for exit, and a cancelled render is
/// killed immediately.
#[derive(Clone)]
pub struct JobExecutor {
    runner: Arc<dyn ProcessRunner>,
}

impl JobExecutor {
    pub fn new(runner: Arc<dyn ProcessRunner>) -> Self {
        Self { runner }
    }

    pub async fn execute<F>(
        &self,
        job_id: JobId,
        target: &Path,
        mode: &RenderMode,
        cancel: &CancellationToken,
        mut on_line: F,
    ) -> RunOutcome
    where
        F: FnMut(String) + Send,
    {
        let started = Instant::now();
        tracing::info!(job_id = %job_id, target = %target.display(), mode = ?mode, "Executing job");

        if cancel.is_cancelled() {
            tracing::info!(job_id = %job_id, "Job cancelled before start");
            return RunOutcome::Cancelled {
                duration: started.elapsed(),
            };
        }

        let mut process = match self.runner.start(target, mode).await {
            Ok(process) => process,
            Err(e) => {
                tracing::error!(job_id = %job_id, error = %e, "Render engine failed to start");
                return RunOutcome::Failure {
                    exit_code: SPAWN_FAILURE_EXIT_CODE,
                    duration: started.elapsed(),
                };
            }
        };

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    if let Err(e) = process.kill().await {
                        tracing::warn!(
                            job_id = %job_id,
                            error = %e,
                            "Failed to kill render engine"
                        );
                    }
                    tracing::info!(job_id = %job_id, "Job cancelled");
                    return RunOutcome::Cancelled { duration: started.elapsed() };
                }
                line = process.next_line() => match line {
                    Some(line) => {
                        tracing::trace!(job_id = %job_id, line = %line, "Engine output");
                        on_line(line);
                    }
                    None => break,
                },
            }
        }

        let exit = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                if let Err(e) = process.kill().await {
                    tracing::warn!(job_id = %job_id, error = %e, "Failed to kill render engine");
                }
                tracing::info!(job_id = %job_id, "Job cancelled");
                return RunOutcome::Cancelled { duration: started.elapsed() };
            }
            exit = process.wait() => exit,
        };

        let duration = started.elapsed();
        let outcome = match exit {
            Ok(code) => RunOutcome::from_exit_code(code, duration),
            Err(e) => {
                tracing::error!(
                    job_id = %job_id,
                    error = %e,
                    "Failed to collect render engine exit status"
                );
                RunOutcome::Failure {
                    exit_code: SPAWN_FAILURE_EXIT_CODE,
                    duration,
                }
            }
        };

        tracing::info!(
            job_id = %job_id,
            outcome = ?outcome,
            elapsed_ms = duration.as_millis(),
            "Job completed"
        );
        outcome
    }
}
