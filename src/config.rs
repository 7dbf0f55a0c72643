use std::path::{Path, PathBuf};

use crate::store::Settings;
use crate::worker::RenderMode;

pub const DEFAULT_ENGINE_EXECUTABLE: &str = "blender";

pub const JOBS_FILE: &str = "jobs.json";
pub const HISTORY_FILE: &str = "history.json";
pub const STATS_FILE: &str = "stats.json";
pub const SETTINGS_FILE: &str = "settings.json";

/// Configuration for the external render engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Engine executable, resolved through `PATH` when not absolute
    pub executable: PathBuf,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            executable: PathBuf::from(DEFAULT_ENGINE_EXECUTABLE),
        }
    }
}

/// Where persisted state lives.
///
/// With no data directory every store is ephemeral, which is what tests and
/// one-off headless runs want.
#[derive(Debug, Clone, Default)]
pub struct StorageConfig {
    pub data_dir: Option<PathBuf>,
}

impl StorageConfig {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: Some(data_dir.into()),
        }
    }

    pub fn ephemeral() -> Self {
        Self { data_dir: None }
    }

    fn file(&self, name: &str) -> Option<PathBuf> {
        self.data_dir.as_deref().map(|dir: &Path| dir.join(name))
    }

    pub fn jobs_path(&self) -> Option<PathBuf> {
        self.file(JOBS_FILE)
    }

    pub fn history_path(&self) -> Option<PathBuf> {
        self.file(HISTORY_FILE)
    }

    pub fn stats_path(&self) -> Option<PathBuf> {
        self.file(STATS_FILE)
    }

    pub fn settings_path(&self) -> Option<PathBuf> {
        self.file(SETTINGS_FILE)
    }
}

/// Dispatch policy.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Re-queue failed jobs at the tail and keep going
    pub auto_retry: bool,
    /// Render a single representative frame instead of the whole animation
    pub single_frame: bool,
    /// Output directory for single-frame renders
    pub output_dir: Option<PathBuf>,
    /// File extensions accepted as render targets (lowercase, no dot).
    /// Empty accepts anything.
    pub accepted_extensions: Vec<String>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            auto_retry: false,
            single_frame: false,
            output_dir: None,
            accepted_extensions: vec!["blend".to_string()],
        }
    }
}

impl SchedulerConfig {
    pub fn render_mode(&self) -> RenderMode {
        if self.single_frame {
            RenderMode::SingleFrame {
                output_dir: self.output_dir.clone(),
            }
        } else {
            RenderMode::Animation
        }
    }

    pub fn accepts(&self, path: &Path) -> bool {
        if self.accepted_extensions.is_empty() {
            return true;
        }
        path.extension()
            .map(|ext| ext.to_string_lossy().to_lowercase())
            .is_some_and(|ext| self.accepted_extensions.iter().any(|a| *a == ext))
    }
}

#[derive(Debug, Clone, Default)]
pub struct AppConfig {
    pub engine: EngineConfig,
    pub storage: StorageConfig,
    pub scheduler: SchedulerConfig,
}

impl AppConfig {
    pub fn new(storage: StorageConfig) -> Self {
        Self {
            storage,
            ..Default::default()
        }
    }

    /// Fold persisted settings into the configuration.
    pub fn with_settings(mut self, settings: &Settings) -> Self {
        self.engine.executable = settings.executable_path.clone();
        self.scheduler.single_frame = settings.single_frame_mode;
        self.scheduler.output_dir = settings.output_dir.clone();
        self
    }

    pub fn with_auto_retry(mut self, auto_retry: bool) -> Self {
        self.scheduler.auto_retry = auto_retry;
        self
    }
}
