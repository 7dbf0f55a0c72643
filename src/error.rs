use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum RenderQueueError {
    #[error("Job not found: {0}")]
    JobNotFound(String),

    /// A caller asked for something the job lifecycle forbids (dispatching
    /// while another job renders, touching a rendering job, ...). Nothing was
    /// changed.
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    #[error("Already in queue: {}", .0.display())]
    DuplicateJob(PathBuf),

    #[error("Unsupported render target: {}", .0.display())]
    UnsupportedTarget(PathBuf),

    #[error("Render target not found: {}", .0.display())]
    TargetMissing(PathBuf),

    #[error("Failed to start render engine: {0}")]
    Spawn(String),

    #[error("Scheduler is not running")]
    SchedulerUnavailable,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, RenderQueueError>;
