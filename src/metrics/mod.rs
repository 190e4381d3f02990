//! Metrics module for Prometheus-based monitoring.
//!
//! Covers job outcomes and durations, retries and dead letters, queue depth
//! and in-flight work.
//!
//! # Example
//!
//! ```ignore
//! use stem_forge::metrics::{init_metrics, export_metrics, MetricsCollector};
//!
//! init_metrics().expect("Failed to initialize metrics");
//!
//! let collector = MetricsCollector::new();
//! collector.record_job("completed", "none", std::time::Duration::from_secs(90));
//!
//! let metrics_text = export_metrics();
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::MetricsCollector;
pub use prometheus::{export_metrics, init_metrics};

pub use prometheus::{
    ACTIVE_WORKERS, DEAD_LETTERS_TOTAL, JOBS_IN_PROGRESS, JOBS_TOTAL, JOB_DURATION,
    JOB_RETRIES_TOTAL, QUEUE_DEPTH, REGISTRY, STORE_RECONNECTS_TOTAL,
};
