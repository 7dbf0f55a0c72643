//! Completion-time estimates from historical render durations.
//!
//! All functions here are pure: they take samples (seconds) and return
//! seconds. Render times are noisy (a cold cache, a machine busy with
//! something else), so the point estimate drops far outliers and the
//! conservative estimate used for countdowns is inflated until enough
//! evidence has accumulated.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Serialize;

use crate::scheduler::job::{Job, JobStatus};

/// Samples outside `[median / OUTLIER_BAND, median * OUTLIER_BAND]` are
/// ignored by the point estimate.
pub const OUTLIER_BAND: f64 = 2.5;
/// Minimum sample count before outlier filtering applies.
pub const OUTLIER_MIN_SAMPLES: usize = 3;
/// Inflation applied to the cross-job fallback estimate.
pub const INFERRED_INFLATION: f64 = 1.1;

pub fn median(samples: &[f64]) -> Option<f64> {
    if samples.is_empty() {
        return None;
    }
    let sorted = sorted(samples);
    let mid = sorted.len() / 2;
    Some(if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    })
}

/// Percentile with linear interpolation between closest ranks.
pub fn percentile(samples: &[f64], pct: f64) -> Option<f64> {
    if samples.is_empty() {
        return None;
    }
    let sorted = sorted(samples);
    let rank = (pct / 100.0).clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    let weight = rank - lower as f64;
    Some(sorted[lower] + (sorted[upper] - sorted[lower]) * weight)
}

fn sorted(samples: &[f64]) -> Vec<f64> {
    let mut sorted = samples.to_vec();
    sorted.sort_by(f64::total_cmp);
    sorted
}

/// Best-guess duration from a job's own history.
pub fn point_estimate(samples: &[f64]) -> Option<f64> {
    let raw = median(samples)?;
    if samples.len() < OUTLIER_MIN_SAMPLES {
        return Some(raw);
    }
    let (low, high) = (raw / OUTLIER_BAND, raw * OUTLIER_BAND);
    let filtered: Vec<f64> = samples
        .iter()
        .copied()
        .filter(|s| (low..=high).contains(s))
        .collect();
    median(&filtered).or(Some(raw))
}

/// Safety factor for the conservative estimate; shrinks as samples accumulate.
pub fn safety_factor(sample_count: usize) -> f64 {
    match sample_count {
        0..=1 => 1.6,
        2..=3 => 1.4,
        4..=6 => 1.25,
        _ => 1.15,
    }
}

/// Inflated estimate for countdown display, always at least the point
/// estimate.
pub fn conservative_estimate(samples: &[f64]) -> Option<f64> {
    let point = point_estimate(samples)?;
    let p75 = percentile(samples, 75.0).unwrap_or(point);
    Some(point.max(p75) * safety_factor(samples.len()))
}

/// Lowest value a running job's remaining time may show.
pub fn remaining_floor(estimate: f64) -> f64 {
    let minimum = if estimate >= 60.0 { 15.0 } else { 5.0 };
    (estimate * 0.15).max(minimum)
}

/// Remaining time for a job that has been rendering for `elapsed`.
pub fn running_remaining(estimate: f64, elapsed: Duration) -> f64 {
    (estimate - elapsed.as_secs_f64()).max(remaining_floor(estimate))
}

/// Estimates for a single job.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobEstimate {
    pub name: String,
    pub samples: usize,
    pub point_seconds: Option<f64>,
    pub conservative_seconds: Option<f64>,
}

impl JobEstimate {
    pub fn from_samples(name: String, samples: &[f64]) -> Self {
        Self {
            name,
            samples: samples.len(),
            point_seconds: point_estimate(samples),
            conservative_seconds: conservative_estimate(samples),
        }
    }
}

/// Time left for everything still queued.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchEta {
    pub total_seconds: f64,
    /// Pending jobs estimated from their own history
    pub estimated_jobs: usize,
    /// Pending jobs without history, estimated from other jobs
    pub inferred_jobs: usize,
    /// Pending jobs nothing could be said about
    pub unknown_jobs: usize,
    /// Per-job figure used for inferred jobs
    pub fallback_seconds: Option<f64>,
}

impl BatchEta {
    pub fn pending_jobs(&self) -> usize {
        self.estimated_jobs + self.inferred_jobs + self.unknown_jobs
    }

    pub fn is_complete(&self) -> bool {
        self.inferred_jobs == 0 && self.unknown_jobs == 0
    }
}

/// Sum the conservative estimates of every job not yet `Done`.
///
/// The rendering job counts only its remaining time. Jobs with no history
/// of their own share a fallback: the median of finished durations in this
/// queue and every known sample, inflated by 10%.
pub fn batch_eta(
    jobs: &[Job],
    history: &BTreeMap<String, Vec<f64>>,
    running_elapsed: Option<Duration>,
) -> BatchEta {
    let fallback = {
        let pool: Vec<f64> = jobs
            .iter()
            .filter(|j| j.status == JobStatus::Done)
            .filter_map(|j| j.last_duration.map(|d| d.as_secs_f64()))
            .chain(history.values().flatten().copied())
            .collect();
        median(&pool).map(|m| m * INFERRED_INFLATION)
    };

    let mut eta = BatchEta {
        fallback_seconds: fallback,
        ..BatchEta::default()
    };

    for job in jobs.iter().filter(|j| j.status != JobStatus::Done) {
        let own = history
            .get(&job.display_name())
            .and_then(|samples| conservative_estimate(samples));
        let estimate = match (own, fallback) {
            (Some(estimate), _) => {
                eta.estimated_jobs += 1;
                estimate
            }
            (None, Some(fallback)) => {
                eta.inferred_jobs += 1;
                fallback
            }
            (None, None) => {
                eta.unknown_jobs += 1;
                continue;
            }
        };

        eta.total_seconds += match (job.status, running_elapsed) {
            (JobStatus::Rendering, Some(elapsed)) => running_remaining(estimate, elapsed),
            _ => estimate,
        };
    }

    eta
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    fn job(name: &str, status: JobStatus) -> Job {
        let mut job = Job::new(PathBuf::from(format!("/scenes/{}", name)));
        job.status = status;
        job
    }

    #[test]
    fn median_handles_odd_even_and_empty() {
        assert_eq!(median(&[]), None);
        assert_eq!(median(&[7.0]), Some(7.0));
        assert_eq!(median(&[3.0, 1.0, 2.0]), Some(2.0));
        assert_eq!(median(&[10.0, 11.0, 9.0, 100.0]), Some(10.5));
    }

    #[test]
    fn percentile_interpolates() {
        assert_eq!(percentile(&[1.0, 2.0, 3.0, 4.0, 5.0], 75.0), Some(4.0));
        assert_eq!(percentile(&[10.0, 20.0], 75.0), Some(17.5));
        assert_eq!(percentile(&[42.0], 75.0), Some(42.0));
    }

    #[test]
    fn point_estimate_filters_outliers() {
        assert_eq!(point_estimate(&[10.0, 11.0, 9.0, 100.0]), Some(10.0));
    }

    #[test]
    fn point_estimate_without_enough_samples_uses_raw_median() {
        assert_eq!(point_estimate(&[]), None);
        assert_eq!(point_estimate(&[30.0]), Some(30.0));
        assert_eq!(point_estimate(&[10.0, 100.0]), Some(55.0));
    }

    #[test]
    fn safety_factor_shrinks_with_evidence() {
        assert_eq!(safety_factor(1), 1.6);
        assert_eq!(safety_factor(3), 1.4);
        assert_eq!(safety_factor(6), 1.25);
        assert_eq!(safety_factor(7), 1.15);
    }

    #[test]
    fn conservative_uses_p75_baseline() {
        // single sample: 100 * 1.6
        assert!(approx(conservative_estimate(&[100.0]).unwrap(), 160.0));
        // point 10, p75 of [9,10,11,100] = 33.25, four samples -> 1.25
        let c = conservative_estimate(&[10.0, 11.0, 9.0, 100.0]).unwrap();
        assert!(approx(c, 33.25 * 1.25));
    }

    #[test]
    fn conservative_never_below_point() {
        let sets: [&[f64]; 5] = [
            &[5.0],
            &[5.0, 500.0],
            &[1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 90.0],
            &[100.0, 10.0, 10.0, 10.0],
            &[60.0, 61.0, 59.5, 62.0, 58.0, 60.5, 61.5, 59.0, 60.0, 60.2],
        ];
        for samples in sets {
            let point = point_estimate(samples).unwrap();
            let conservative = conservative_estimate(samples).unwrap();
            assert!(conservative >= point, "{:?}", samples);
        }
    }

    #[test]
    fn running_remaining_has_floor() {
        // long job: floor is max(15% of 200, 15) = 30
        assert!(approx(running_remaining(200.0, Duration::from_secs(50)), 150.0));
        assert!(approx(running_remaining(200.0, Duration::from_secs(190)), 30.0));
        // short job: floor is max(15% of 20, 5) = 5
        assert!(approx(running_remaining(20.0, Duration::from_secs(30)), 5.0));
        // just over a minute: 15s floor wins over 15%
        assert!(approx(remaining_floor(60.0), 15.0));
    }

    #[test]
    fn batch_eta_skips_done_and_shrinks_running() {
        let mut history = BTreeMap::new();
        history.insert("a.blend".to_string(), vec![100.0]);
        history.insert("b.blend".to_string(), vec![50.0]);
        history.insert("c.blend".to_string(), vec![10.0]);

        let jobs = vec![
            job("a.blend", JobStatus::Rendering),
            job("b.blend", JobStatus::Ready),
            job("c.blend", JobStatus::Done),
        ];
        let eta = batch_eta(&jobs, &history, Some(Duration::from_secs(60)));

        // a: 160 - 60 = 100, b: 80
        assert!(approx(eta.total_seconds, 180.0));
        assert_eq!(eta.estimated_jobs, 2);
        assert_eq!(eta.inferred_jobs, 0);
        assert!(eta.is_complete());
    }

    #[test]
    fn batch_eta_infers_jobs_without_history() {
        let mut history = BTreeMap::new();
        history.insert("old.blend".to_string(), vec![20.0, 40.0]);

        let mut done = job("done.blend", JobStatus::Done);
        done.last_duration = Some(Duration::from_secs(30));
        let jobs = vec![
            done,
            job("new1.blend", JobStatus::Ready),
            job("new2.blend", JobStatus::Error),
        ];
        let eta = batch_eta(&jobs, &history, None);

        // pool [30, 20, 40] -> median 30 -> 33 each
        assert_eq!(eta.inferred_jobs, 2);
        assert!(approx(eta.fallback_seconds.unwrap(), 33.0));
        assert!(approx(eta.total_seconds, 66.0));
        assert!(!eta.is_complete());
    }

    #[test]
    fn batch_eta_without_any_data_reports_unknown() {
        let jobs = vec![job("a.blend", JobStatus::Ready)];
        let eta = batch_eta(&jobs, &BTreeMap::new(), None);
        assert_eq!(eta.total_seconds, 0.0);
        assert_eq!(eta.unknown_jobs, 1);
        assert_eq!(eta.pending_jobs(), 1);
    }
}
