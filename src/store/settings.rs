use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::config::DEFAULT_ENGINE_EXECUTABLE;
use crate::error::Result;
use crate::store::{atomic_write_json, load_json_or_default};

/// User-facing settings persisted between sessions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Render engine executable
    pub executable_path: PathBuf,
    /// Render only the first frame instead of the full animation
    pub single_frame_mode: bool,
    /// Where single-frame renders are written; the engine default when unset
    pub output_dir: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            executable_path: PathBuf::from(DEFAULT_ENGINE_EXECUTABLE),
            single_frame_mode: false,
            output_dir: None,
        }
    }
}

#[derive(Debug)]
pub struct SettingsStore {
    path: Option<PathBuf>,
}

impl SettingsStore {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self { path }
    }

    pub fn load(&self) -> Settings {
        self.path
            .as_deref()
            .map(load_json_or_default)
            .unwrap_or_default()
    }

    pub fn save(&self, settings: &Settings) -> Result<()> {
        match &self.path {
            Some(path) => atomic_write_json(path, settings),
            None => Ok(()),
        }
    }
}
