//! Error types for stem-forge operations.
//!
//! Defines the error taxonomy for each subsystem:
//! - Job store and queue access (Redis or in-memory)
//! - Job parameter validation
//! - State machine transitions
//! - Separation engine invocation and the processing adapter
//! - The job service surfaces (submit, status, download, delete)

use std::time::Duration;

use thiserror::Error;

use crate::jobs::FailureKind;

/// Errors that can occur while talking to the job store or queue.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backing service could not be reached.
    #[error("Job store unavailable: {0}")]
    Unavailable(String),

    /// Redis operation failed.
    #[error("Redis operation failed: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Job {0} not found")]
    NotFound(String),

    #[error("Job {0} already exists")]
    DuplicateJob(String),

    /// A record exists for the id but cannot be interpreted as a job.
    #[error("Invalid job data for {id}: {reason}")]
    CorruptJobData { id: String, reason: String },

    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    /// Returns whether the error means the store itself is unreachable, as
    /// opposed to a problem with a single job.
    pub fn is_unavailable(&self) -> bool {
        match self {
            StoreError::Unavailable(_) => true,
            StoreError::Redis(e) => {
                e.is_io_error()
                    || e.is_connection_dropped()
                    || e.is_connection_refusal()
                    || e.is_timeout()
            }
            _ => false,
        }
    }
}

/// Errors raised when validating job parameters at submission time.
#[derive(Debug, Error, PartialEq)]
pub enum ParamsError {
    #[error("Unknown model '{0}': expected htdemucs, htdemucs_ft, htdemucs_6s or mdx_extra")]
    UnknownModel(String),

    #[error("Invalid shifts {0}: must be between 0 and 10")]
    InvalidShifts(u32),

    #[error("Invalid overlap {0}: must be between 0.1 and 0.9")]
    InvalidOverlap(f64),
}

/// An event that is not legal in the job's current state.
#[derive(Debug, Error, PartialEq)]
#[error("Invalid state transition from '{from}' on '{event}': {reason}")]
pub struct TransitionError {
    pub from: String,
    pub event: String,
    pub reason: String,
}

/// Errors reported by a separation engine backend.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Failed to spawn '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Engine exited with code {code}: {stderr}")]
    NonZeroExit { code: i32, stderr: String },

    #[error("Engine produced no stems in {0}")]
    NoOutput(String),

    #[error("Engine reported an invalid stem name '{0}'")]
    InvalidStemName(String),

    #[error("Model '{model}' is not supported by the {engine} engine")]
    UnsupportedModel { model: String, engine: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors produced while processing a single job.
///
/// Each variant maps to a [`FailureKind`], which decides whether the
/// failure is eligible for a retry.
#[derive(Debug, Error)]
pub enum ProcessingError {
    #[error("Input file not found for job {0}")]
    InputMissing(String),

    #[error("Error processing job: {0}")]
    Engine(#[from] EngineError),

    #[error("Audio normalization failed: {0}")]
    Audio(String),

    #[error("Processing task panicked: {0}")]
    Panicked(String),

    #[error("Job timeout after {} seconds", .0.as_secs_f64())]
    Timeout(Duration),

    #[error("Worker shutdown during processing")]
    Interrupted,

    #[error("Audio normalization cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProcessingError {
    /// Classifies the error for the state machine and retry policy.
    pub fn kind(&self) -> FailureKind {
        match self {
            ProcessingError::InputMissing(_) => FailureKind::InputMissing,
            ProcessingError::Timeout(_) => FailureKind::Timeout,
            ProcessingError::Interrupted | ProcessingError::Cancelled => FailureKind::Interrupted,
            ProcessingError::Engine(_)
            | ProcessingError::Audio(_)
            | ProcessingError::Panicked(_)
            | ProcessingError::Io(_) => FailureKind::EngineFailure,
        }
    }
}

/// Errors surfaced by the job service to callers.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Job not found")]
    JobNotFound(String),

    #[error("Job not completed yet (status: {status})")]
    NotCompleted { id: String, status: String },

    #[error("Stem file not found")]
    StemNotFound { id: String, stem: String },

    #[error("Invalid file format. Supported: mp3, wav, flac, m4a, ogg")]
    UnsupportedFormat(String),

    #[error("Invalid stem name '{0}'")]
    InvalidStemName(String),

    #[error("Invalid parameters: {0}")]
    InvalidParams(#[from] ParamsError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ServiceError {
    /// HTTP-style status class for the error.
    pub fn status_code(&self) -> u16 {
        match self {
            ServiceError::JobNotFound(_) | ServiceError::StemNotFound { .. } => 404,
            ServiceError::NotCompleted { .. }
            | ServiceError::UnsupportedFormat(_)
            | ServiceError::InvalidStemName(_)
            | ServiceError::InvalidParams(_) => 400,
            ServiceError::Store(e) if e.is_unavailable() => 503,
            ServiceError::Store(_) | ServiceError::Io(_) => 500,
        }
    }
}
