//! Best-effort progress reporting for a running job.
//!
//! Updates are written with a status guard (`processing`), so a report that
//! arrives after the worker has already failed or completed the job is
//! dropped by the store. Reports never move progress backwards.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::jobs::{JobStatus, JobUpdate, Phase};
use crate::store::Backend;

/// Range of overall progress covered by engine-reported percentages.
const ENGINE_START: f64 = 40.0;
const ENGINE_END: f64 = 70.0;

/// Range covered while stems are moved into place.
const SAVE_START: f64 = 70.0;
const SAVE_END: f64 = 90.0;

/// Writes progress updates for one job.
pub struct ProgressReporter {
    store: Option<Arc<dyn Backend>>,
    job_id: String,
    /// Highest progress reported so far, as `f64` bits.
    ///
    /// Non-negative floats order the same as their bit patterns.
    high_water: AtomicU64,
}

impl ProgressReporter {
    pub fn new(store: Arc<dyn Backend>, job_id: impl Into<String>) -> Self {
        Self {
            store: Some(store),
            job_id: job_id.into(),
            high_water: AtomicU64::new(0f64.to_bits()),
        }
    }

    /// A reporter that only logs.
    pub fn detached(job_id: impl Into<String>) -> Self {
        Self {
            store: None,
            job_id: job_id.into(),
            high_water: AtomicU64::new(0f64.to_bits()),
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Highest progress reported so far.
    pub fn current(&self) -> f64 {
        f64::from_bits(self.high_water.load(Ordering::SeqCst))
    }

    /// Reports the start of a processing phase.
    pub async fn phase(&self, phase: Phase, message: &str) {
        self.report(phase.progress(), message).await;
    }

    /// Maps an engine percentage (0 to 100) into the separation range.
    pub async fn engine_percent(&self, percent: f64) {
        let fraction = (percent / 100.0).clamp(0.0, 1.0);
        let progress = ENGINE_START + fraction * (ENGINE_END - ENGINE_START);
        self.report(progress, &format!("Separating stems... {:.0}%", percent))
            .await;
    }

    /// Reports that stem `index` of `total` has been saved.
    pub async fn stem_saved(&self, index: usize, total: usize, stem: &str) {
        if total == 0 {
            return;
        }
        let fraction = (index + 1) as f64 / total as f64;
        let progress = SAVE_START + fraction * (SAVE_END - SAVE_START);
        self.report(progress, &format!("Saved {} stem", stem)).await;
    }

    /// Writes `progress` and `message` if it does not go backwards.
    pub async fn report(&self, progress: f64, message: &str) {
        let progress = progress.clamp(0.0, 100.0);
        let previous = f64::from_bits(
            self.high_water
                .fetch_max(progress.to_bits(), Ordering::SeqCst),
        );
        if progress < previous {
            return;
        }

        debug!(job_id = %self.job_id, progress, message, "Progress");

        let Some(store) = self.store.as_ref() else {
            return;
        };

        let update = JobUpdate::new().progress(progress).message(message);
        match store
            .transition(&self.job_id, JobStatus::Processing, &update)
            .await
        {
            Ok(true) => {}
            Ok(false) => debug!(
                job_id = %self.job_id,
                "Dropped progress update for job no longer processing"
            ),
            Err(e) => warn!(
                job_id = %self.job_id,
                error = %e,
                "Failed to write progress update"
            ),
        }
    }
}
