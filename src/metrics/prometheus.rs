//! Prometheus metrics registration and export.
//!
//! This module defines all Prometheus metrics used by stem-forge and provides
//! functions for initializing, registering, and exporting metrics.

use prometheus::{
    Counter, CounterVec, Encoder, Gauge, GaugeVec, HistogramVec, Opts, Registry, TextEncoder,
};
use std::sync::OnceLock;

/// Global Prometheus registry for all stem-forge metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Jobs finalized by a worker, labeled by outcome and failure kind.
pub static JOBS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Job processing duration in seconds, labeled by outcome.
pub static JOB_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Jobs requeued by the retry policy.
pub static JOB_RETRIES_TOTAL: OnceLock<Counter> = OnceLock::new();

/// Jobs moved to the dead-letter list.
pub static DEAD_LETTERS_TOTAL: OnceLock<Counter> = OnceLock::new();

/// Number of jobs in queue, labeled by queue name.
pub static QUEUE_DEPTH: OnceLock<GaugeVec> = OnceLock::new();

/// Number of jobs currently being processed.
pub static JOBS_IN_PROGRESS: OnceLock<Gauge> = OnceLock::new();

/// Number of running worker loops.
pub static ACTIVE_WORKERS: OnceLock<Gauge> = OnceLock::new();

/// Times a worker lost the job store and waited for it to come back.
pub static STORE_RECONNECTS_TOTAL: OnceLock<Counter> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// Call once at startup. Later calls build a fresh registry but leave the
/// first one in place.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails, typically due to
/// duplicate metric names or invalid metric configurations.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let registry = Registry::new();

    // Job metrics
    let jobs_total = CounterVec::new(
        Opts::new("stem_forge_jobs_total", "Jobs finalized by workers"),
        &["outcome", "kind"],
    )?;

    let job_duration = HistogramVec::new(
        prometheus::HistogramOpts::new(
            "stem_forge_job_duration_seconds",
            "Job processing duration in seconds",
        )
        .buckets(vec![5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0]),
        &["outcome"],
    )?;

    let job_retries_total = Counter::new(
        "stem_forge_job_retries_total",
        "Jobs requeued by the retry policy",
    )?;

    let dead_letters_total = Counter::new(
        "stem_forge_dead_letters_total",
        "Jobs moved to the dead letter queue",
    )?;

    // Queue metrics
    let queue_depth = GaugeVec::new(
        Opts::new("stem_forge_queue_depth", "Number of jobs in queue"),
        &["queue_name"],
    )?;

    let jobs_in_progress = Gauge::new(
        "stem_forge_jobs_in_progress",
        "Number of jobs currently being processed",
    )?;

    // Worker metrics
    let active_workers = Gauge::new("stem_forge_active_workers", "Number of active workers")?;

    let store_reconnects_total = Counter::new(
        "stem_forge_store_reconnects_total",
        "Times a worker waited for the job store to come back",
    )?;

    registry.register(Box::new(jobs_total.clone()))?;
    registry.register(Box::new(job_duration.clone()))?;
    registry.register(Box::new(job_retries_total.clone()))?;
    registry.register(Box::new(dead_letters_total.clone()))?;
    registry.register(Box::new(queue_depth.clone()))?;
    registry.register(Box::new(jobs_in_progress.clone()))?;
    registry.register(Box::new(active_workers.clone()))?;
    registry.register(Box::new(store_reconnects_total.clone()))?;

    // If any of these fail, metrics were already initialized
    let _ = REGISTRY.set(registry);
    let _ = JOBS_TOTAL.set(jobs_total);
    let _ = JOB_DURATION.set(job_duration);
    let _ = JOB_RETRIES_TOTAL.set(job_retries_total);
    let _ = DEAD_LETTERS_TOTAL.set(dead_letters_total);
    let _ = QUEUE_DEPTH.set(queue_depth);
    let _ = JOBS_IN_PROGRESS.set(jobs_in_progress);
    let _ = ACTIVE_WORKERS.set(active_workers);
    let _ = STORE_RECONNECTS_TOTAL.set(store_reconnects_total);

    tracing::info!("Prometheus metrics initialized successfully");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// Returns a comment line instead if the registry has not been initialized
/// or encoding fails.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}
