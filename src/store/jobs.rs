use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::scheduler::job::{Job, JobStatus};
use crate::store::{atomic_write_json, load_json_or_default};

/// One entry of the persisted queue snapshot. The job id is not stored; it
/// is derived from the path on load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub path: PathBuf,
    #[serde(default = "default_status")]
    pub status: JobStatus,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, with = "duration_secs")]
    pub last_duration: Option<Duration>,
}

/// Durations are stored as fractional seconds.
mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        value.map(|d| d.as_secs_f64()).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = Option::<f64>::deserialize(deserializer)?;
        Ok(secs
            .filter(|s| s.is_finite() && *s >= 0.0)
            .map(Duration::from_secs_f64))
    }
}

fn default_status() -> JobStatus {
    JobStatus::Ready
}

impl From<&Job> for JobRecord {
    fn from(job: &Job) -> Self {
        Self {
            path: job.path.clone(),
            status: job.status,
            attempts: job.attempts,
            last_duration: job.last_duration,
        }
    }
}

impl Job {
    /// Rebuild a job from a snapshot entry.
    ///
    /// Nothing is rendering right after a load, so a job persisted as
    /// `Rendering` (the process died mid-render) comes back as `Canceled`.
    pub fn from_record(record: &JobRecord) -> Self {
        let mut job = Job::new(record.path.clone());
        job.attempts = record.attempts;
        job.last_duration = record.last_duration;
        job.status = match record.status {
            JobStatus::Rendering => {
                tracing::warn!(
                    path = %record.path.display(),
                    "Job was rendering when the queue was last saved, marking canceled"
                );
                JobStatus::Canceled
            }
            status => status,
        };
        job
    }
}

#[derive(Debug)]
enum Backend {
    File(PathBuf),
    Memory(Vec<JobRecord>),
}

/// Persists the ordered job queue as a full snapshot.
#[derive(Debug)]
pub struct JobStore {
    backend: Backend,
}

impl JobStore {
    pub fn new(path: Option<PathBuf>) -> Self {
        match path {
            Some(path) => Self {
                backend: Backend::File(path),
            },
            None => Self::ephemeral(),
        }
    }

    pub fn ephemeral() -> Self {
        Self {
            backend: Backend::Memory(Vec::new()),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        match &self.backend {
            Backend::File(path) => Some(path),
            Backend::Memory(_) => None,
        }
    }

    /// Load the queue. Missing or unreadable storage yields an empty queue.
    pub fn load(&self) -> Vec<Job> {
        let records: Vec<JobRecord> = match &self.backend {
            Backend::File(path) => load_json_or_default(path),
            Backend::Memory(records) => records.clone(),
        };
        records.iter().map(Job::from_record).collect()
    }

    /// Replace the stored snapshot with `jobs`.
    pub fn save(&mut self, jobs: &[Job]) -> Result<()> {
        let records: Vec<JobRecord> = jobs.iter().map(JobRecord::from).collect();
        match &mut self.backend {
            Backend::File(path) => atomic_write_json(path, &records),
            Backend::Memory(stored) => {
                *stored = records;
                Ok(())
            }
        }
    }
}
