use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type JobId = Uuid;

/// Derive the stable identity of a render target from its path.
///
/// The same path always maps to the same id, so selections and persisted
/// references survive a restart.
pub fn job_id_for(path: &Path) -> JobId {
    Uuid::new_v5(&Uuid::NAMESPACE_URL, path.to_string_lossy().as_bytes())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobStatus {
    Ready,
    Rendering,
    Done,
    Error,
    Canceled,
}

impl JobStatus {
    /// Whether a job in this state may be picked by the dispatcher.
    ///
    /// Canceled jobs are only picked in manual mode; with auto-retry on they
    /// must be re-armed explicitly.
    pub fn is_dispatchable(self, auto_retry: bool) -> bool {
        match self {
            JobStatus::Ready | JobStatus::Error => true,
            JobStatus::Canceled => !auto_retry,
            JobStatus::Rendering | JobStatus::Done => false,
        }
    }

    /// Lifecycle transition table.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Ready | Error | Canceled, Rendering)
                | (Rendering, Done | Error | Canceled)
                | (Done | Error | Canceled, Ready)
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            JobStatus::Ready => "ready",
            JobStatus::Rendering => "rendering",
            JobStatus::Done => "done",
            JobStatus::Error => "error",
            JobStatus::Canceled => "canceled",
        };
        f.pad(label)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub id: JobId,
    pub path: PathBuf,
    pub status: JobStatus,
    /// Dispatches issued since the last success or reset. Incremented when
    /// the job is handed to the engine, so a rendering job shows the number
    /// of the attempt in progress.
    pub attempts: u32,
    pub last_duration: Option<Duration>,
}

impl Job {
    pub fn new(path: PathBuf) -> Self {
        Self {
            id: job_id_for(&path),
            path,
            status: JobStatus::Ready,
            attempts: 0,
            last_duration: None,
        }
    }

    /// File name of the target, used as the key into render history.
    pub fn display_name(&self) -> String {
        self.path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.path.to_string_lossy().into_owned())
    }

    /// Human-readable attempt counter: "attempt N" while rendering,
    /// "N attempts" otherwise.
    pub fn attempt_label(&self) -> Option<String> {
        match (self.status, self.attempts) {
            (_, 0) => None,
            (JobStatus::Rendering, n) => Some(format!("attempt {}", n)),
            (_, 1) => Some("1 attempt".to_string()),
            (_, n) => Some(format!("{} attempts", n)),
        }
    }

    pub(crate) fn reset(&mut self) {
        self.status = JobStatus::Ready;
        self.attempts = 0;
        self.last_duration = None;
    }
}
