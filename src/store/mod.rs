//! Durable JSON state: the job queue snapshot, render history, lifetime
//! statistics and application settings.
//!
//! Every store follows the same rules:
//! - loading never fails; a missing or corrupt file yields the default value
//! - saving replaces the whole file (temp file in the same directory, fsync,
//!   rename), so readers never see a half-written snapshot
//! - a store built without a path is ephemeral and keeps state in memory only

pub mod history;
pub mod jobs;
pub mod settings;
pub mod stats;

pub use history::HistoryStore;
pub use jobs::{JobRecord, JobStore};
pub use settings::{Settings, SettingsStore};
pub use stats::{LifetimeStats, RunLogEntry, RunOutcomeKind, StatsStore};

use std::io::Write;
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::config::StorageConfig;
use crate::error::Result;

/// The stores the scheduler writes to after every completed attempt, plus
/// the settings it updates when a toggle changes.
#[derive(Debug)]
pub struct Stores {
    pub jobs: JobStore,
    pub history: HistoryStore,
    pub stats: StatsStore,
    pub settings: SettingsStore,
}

impl Stores {
    pub fn open(config: &StorageConfig) -> Self {
        Self {
            jobs: JobStore::new(config.jobs_path()),
            history: HistoryStore::load(config.history_path()),
            stats: StatsStore::load(config.stats_path()),
            settings: SettingsStore::new(config.settings_path()),
        }
    }

    pub fn ephemeral() -> Self {
        Self {
            jobs: JobStore::ephemeral(),
            history: HistoryStore::ephemeral(),
            stats: StatsStore::ephemeral(),
            settings: SettingsStore::new(None),
        }
    }
}

pub(crate) fn atomic_write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let content = serde_json::to_string_pretty(value)?;

    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent)?;

    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("state.json");
    let temp_path = parent.join(format!(".{}.{}.tmp", file_name, uuid::Uuid::new_v4()));

    let mut temp_file = std::fs::File::create(&temp_path)?;
    temp_file.write_all(content.as_bytes())?;
    temp_file.sync_all()?;
    drop(temp_file);

    if let Err(e) = std::fs::rename(&temp_path, path) {
        let _ = std::fs::remove_file(&temp_path);
        return Err(e.into());
    }

    tracing::debug!(path = %path.display(), bytes = content.len(), "State persisted");
    Ok(())
}

pub(crate) fn load_json_or_default<T: DeserializeOwned + Default>(path: &Path) -> T {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(path = %path.display(), "No persisted state, using defaults");
            return T::default();
        }
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "Failed to read state, using defaults"
            );
            return T::default();
        }
    };

    match serde_json::from_str(&content) {
        Ok(value) => value,
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "Corrupt state file, using defaults"
            );
            T::default()
        }
    }
}
