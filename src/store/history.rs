use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::error::Result;
use crate::estimator::median;
use crate::store::{atomic_write_json, load_json_or_default};

/// Maximum number of samples kept per job name.
pub const MAX_SAMPLES: usize = 10;
/// Samples kept after a rebase.
pub const REBASE_KEEP: usize = 5;
/// A new sample further than this factor from the current median means the
/// workload changed.
pub const REBASE_DEVIATION: f64 = 3.0;

/// Successful render durations (seconds) per job display name.
#[derive(Debug, Default)]
pub struct HistoryStore {
    path: Option<PathBuf>,
    entries: BTreeMap<String, Vec<f64>>,
}

impl HistoryStore {
    pub fn load(path: Option<PathBuf>) -> Self {
        let entries = path
            .as_deref()
            .map(load_json_or_default::<BTreeMap<String, Vec<f64>>>)
            .unwrap_or_default()
            .into_iter()
            .map(|(name, mut samples)| {
                samples.retain(|s| s.is_finite() && *s >= 0.0);
                let excess = samples.len().saturating_sub(MAX_SAMPLES);
                samples.drain(..excess);
                (name, samples)
            })
            .filter(|(_, samples)| !samples.is_empty())
            .collect();
        Self { path, entries }
    }

    pub fn ephemeral() -> Self {
        Self::default()
    }

    pub fn samples(&self, name: &str) -> &[f64] {
        self.entries.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn entries(&self) -> &BTreeMap<String, Vec<f64>> {
        &self.entries
    }

    /// Append a successful duration. Returns true when the sample triggered a
    /// rebase to the most recent samples.
    pub fn record(&mut self, name: &str, seconds: f64) -> bool {
        if !seconds.is_finite() || seconds < 0.0 {
            tracing::warn!(name, seconds, "Ignoring invalid duration sample");
            return false;
        }

        let samples = self.entries.entry(name.to_string()).or_default();
        let shifted = match median(samples) {
            Some(m) if m > 0.0 => seconds > m * REBASE_DEVIATION || seconds < m / REBASE_DEVIATION,
            _ => false,
        };

        samples.push(seconds);
        let keep = if shifted { REBASE_KEEP } else { MAX_SAMPLES };
        let excess = samples.len().saturating_sub(keep);
        samples.drain(..excess);

        if shifted {
            tracing::info!(
                name,
                seconds,
                kept = samples.len(),
                "Render time shifted, history rebased"
            );
        }
        shifted
    }

    pub fn save(&self) -> Result<()> {
        match &self.path {
            Some(path) => atomic_write_json(path, &self.entries),
            None => Ok(()),
        }
    }
}
