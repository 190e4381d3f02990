//! stem-forge: job lifecycle manager for audio stem separation.
//!
//! Clients submit audio files through [`service::JobService`]; workers in
//! [`scheduler`] pull job ids from a shared queue, run a separation engine
//! through [`processing::ProcessingAdapter`] and record progress, stems and
//! failures in the job store.

pub mod cli;
pub mod config;
pub mod error;
pub mod jobs;
pub mod metrics;
pub mod processing;
pub mod scheduler;
pub mod service;
pub mod store;

// Re-export commonly used types
pub use config::{ConfigError, StemConfig};
pub use error::{EngineError, ProcessingError, ServiceError, StoreError};
pub use jobs::{Job, JobParams, JobStatus, JobView, SeparationModel};
pub use service::JobService;
