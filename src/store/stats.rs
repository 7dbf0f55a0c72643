use std::collections::VecDeque;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::store::{atomic_write_json, load_json_or_default};

/// Number of entries kept in the recent-run log.
pub const LOG_CAPACITY: usize = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunOutcomeKind {
    Success,
    Error,
    Canceled,
}

impl std::fmt::Display for RunOutcomeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(match self {
            RunOutcomeKind::Success => "success",
            RunOutcomeKind::Error => "error",
            RunOutcomeKind::Canceled => "canceled",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunLogEntry {
    pub timestamp: DateTime<Utc>,
    pub name: String,
    pub outcome: RunOutcomeKind,
    pub attempt_number: u32,
    pub duration_seconds: f64,
}

/// Counters accumulated over the lifetime of the installation, independent
/// of what is currently queued.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LifetimeStats {
    pub success_count: u64,
    pub error_count: u64,
    /// Every completed dispatch, including canceled ones.
    pub attempt_count: u64,
    pub total_seconds: f64,
    pub recent_log: VecDeque<RunLogEntry>,
}

impl LifetimeStats {
    pub fn record(
        &mut self,
        name: &str,
        outcome: RunOutcomeKind,
        attempt_number: u32,
        duration: Duration,
    ) {
        self.attempt_count += 1;
        match outcome {
            RunOutcomeKind::Success => self.success_count += 1,
            RunOutcomeKind::Error => self.error_count += 1,
            RunOutcomeKind::Canceled => {}
        }
        self.total_seconds += duration.as_secs_f64();

        self.recent_log.push_back(RunLogEntry {
            timestamp: Utc::now(),
            name: name.to_string(),
            outcome,
            attempt_number,
            duration_seconds: duration.as_secs_f64(),
        });
        while self.recent_log.len() > LOG_CAPACITY {
            self.recent_log.pop_front();
        }
    }

    /// Share of finished (non-canceled) attempts that succeeded.
    pub fn success_rate(&self) -> Option<f64> {
        let finished = self.success_count + self.error_count;
        (finished > 0).then(|| self.success_count as f64 / finished as f64)
    }
}

#[derive(Debug, Default)]
pub struct StatsStore {
    path: Option<PathBuf>,
    stats: LifetimeStats,
}

impl StatsStore {
    pub fn load(path: Option<PathBuf>) -> Self {
        let mut stats: LifetimeStats = path
            .as_deref()
            .map(load_json_or_default)
            .unwrap_or_default();
        while stats.recent_log.len() > LOG_CAPACITY {
            stats.recent_log.pop_front();
        }
        Self { path, stats }
    }

    pub fn ephemeral() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> &LifetimeStats {
        &self.stats
    }

    pub fn record(
        &mut self,
        name: &str,
        outcome: RunOutcomeKind,
        attempt_number: u32,
        duration: Duration,
    ) {
        self.stats.record(name, outcome, attempt_number, duration);
    }

    pub fn save(&self) -> Result<()> {
        match &self.path {
            Some(path) => atomic_write_json(path, &self.stats),
            None => Ok(()),
        }
    }
}
