//! High-level recording interface over the raw Prometheus metrics.
//!
//! Every method is a no-op when `init_metrics()` has not been called, so
//! library users and tests can run workers without a registry.

use std::time::Duration;

use super::prometheus::{
    ACTIVE_WORKERS, DEAD_LETTERS_TOTAL, JOBS_IN_PROGRESS, JOBS_TOTAL, JOB_DURATION,
    JOB_RETRIES_TOTAL, QUEUE_DEPTH, STORE_RECONNECTS_TOTAL,
};
use crate::store::QueueStats;

/// Metrics collector for recording worker and queue metrics.
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    pub fn new() -> Self {
        Self
    }

    /// Record a finalized job.
    ///
    /// # Arguments
    ///
    /// * `outcome` - `"completed"` or `"failed"`
    /// * `kind` - failure kind, or `"none"` for completed jobs
    /// * `duration` - time from claim to finalization
    pub fn record_job(&self, outcome: &str, kind: &str, duration: Duration) {
        if let Some(jobs_total) = JOBS_TOTAL.get() {
            jobs_total.with_label_values(&[outcome, kind]).inc();
        }

        if let Some(job_duration) = JOB_DURATION.get() {
            job_duration
                .with_label_values(&[outcome])
                .observe(duration.as_secs_f64());
        }

        tracing::trace!(
            outcome = outcome,
            kind = kind,
            duration_secs = duration.as_secs_f64(),
            "Recorded job metric"
        );
    }

    pub fn record_retry(&self) {
        if let Some(retries) = JOB_RETRIES_TOTAL.get() {
            retries.inc();
        }
    }

    pub fn record_dead_letter(&self) {
        if let Some(dead_letters) = DEAD_LETTERS_TOTAL.get() {
            dead_letters.inc();
        }
    }

    pub fn record_store_reconnect(&self) {
        if let Some(reconnects) = STORE_RECONNECTS_TOTAL.get() {
            reconnects.inc();
        }
    }

    /// Update the queue depth for a specific queue.
    pub fn update_queue_depth(&self, queue_name: &str, depth: usize) {
        if let Some(queue_depth) = QUEUE_DEPTH.get() {
            queue_depth
                .with_label_values(&[queue_name])
                .set(depth as f64);
        }

        tracing::trace!(
            queue_name = queue_name,
            depth = depth,
            "Updated queue depth metric"
        );
    }

    /// Update pending and dead-letter depths from queue statistics.
    pub fn update_queue_stats(&self, stats: &QueueStats) {
        self.update_queue_depth(&stats.queue_name, stats.pending_jobs);
        self.update_queue_depth(
            &format!("{}:dead_letter", stats.queue_name),
            stats.dead_letter_jobs,
        );
    }

    pub fn inc_workers(&self) {
        if let Some(active_workers) = ACTIVE_WORKERS.get() {
            active_workers.inc();
        }
    }

    pub fn dec_workers(&self) {
        if let Some(active_workers) = ACTIVE_WORKERS.get() {
            active_workers.dec();
        }
    }

    pub fn inc_jobs_in_progress(&self) {
        if let Some(jobs_in_progress) = JOBS_IN_PROGRESS.get() {
            jobs_in_progress.inc();
        }
    }

    pub fn dec_jobs_in_progress(&self) {
        if let Some(jobs_in_progress) = JOBS_IN_PROGRESS.get() {
            jobs_in_progress.dec();
        }
    }
}
