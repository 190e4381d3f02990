//! Job lifecycle state machine.
//!
//! ```text
//!   queued ──claim──▶ processing ──complete──▶ completed
//!     ▲                   │
//!     │                  fail
//!     │                   ▼
//!     └──────retry────── failed ──dead-letter──▶ dead-lettered
//! ```
//!
//! This module is pure: [`next`] validates an event against the current
//! state and returns the [`Transition`] to persist. Persisting it is the
//! job store's business, guarded by a compare-and-set on the stored status.

use std::fmt;

use crate::error::TransitionError;

use super::job::{Job, JobStatus, JobUpdate};

/// Progress recorded when a worker claims a job.
pub const CLAIM_PROGRESS: f64 = 5.0;

/// Message recorded when a worker claims a job.
pub const CLAIM_MESSAGE: &str = "Starting stem separation...";

/// Message recorded when a job completes.
pub const COMPLETE_MESSAGE: &str = "Stem separation completed!";

/// Logical lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobState {
    Queued,
    Processing,
    Completed,
    Failed,
    DeadLettered,
}

impl JobState {
    /// Derives the logical state of a stored job.
    pub fn of(job: &Job) -> Self {
        match job.status {
            JobStatus::Queued => JobState::Queued,
            JobStatus::Processing => JobState::Processing,
            JobStatus::Completed => JobState::Completed,
            JobStatus::Failed if job.dead_lettered => JobState::DeadLettered,
            JobStatus::Failed => JobState::Failed,
        }
    }

    /// The status value persisted for this state.
    pub fn stored_status(&self) -> JobStatus {
        match self {
            JobState::Queued => JobStatus::Queued,
            JobState::Processing => JobStatus::Processing,
            JobState::Completed => JobStatus::Completed,
            JobState::Failed | JobState::DeadLettered => JobStatus::Failed,
        }
    }

    /// Terminal states are only left by deleting the job.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::DeadLettered)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Processing => "processing",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::DeadLettered => "dead-lettered",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a job moved to `failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// The separation engine (or the work around it) raised an error.
    EngineFailure,
    /// No input artifact exists for the job.
    InputMissing,
    /// Processing exceeded the job deadline.
    Timeout,
    /// The worker was asked to shut down mid-job.
    Interrupted,
    /// The job was found in-flight after a worker crash.
    Crashed,
    /// The stored record could not be interpreted.
    CorruptJobData,
}

impl FailureKind {
    /// Whether the retry policy may requeue a job that failed this way.
    ///
    /// Timeouts are assumed to recur, and missing input or corrupt records
    /// cannot be fixed by running again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, FailureKind::EngineFailure | FailureKind::Crashed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::EngineFailure => "engine_failure",
            FailureKind::InputMissing => "input_missing",
            FailureKind::Timeout => "timeout",
            FailureKind::Interrupted => "interrupted",
            FailureKind::Crashed => "crashed",
            FailureKind::CorruptJobData => "corrupt_job_data",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Informational sub-phases of `processing`. They never gate transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    LocateInput,
    LoadModel,
    Decode,
    Separate,
    Save,
}

impl Phase {
    /// Progress reached when the phase starts.
    pub fn progress(&self) -> f64 {
        match self {
            Phase::LocateInput => 10.0,
            Phase::LoadModel => 20.0,
            Phase::Decode => 30.0,
            Phase::Separate => 40.0,
            Phase::Save => 70.0,
        }
    }
}

/// Something that happened to a job.
#[derive(Debug, Clone, PartialEq)]
pub enum JobEvent {
    /// A worker popped the job from the queue.
    Claim,
    /// All stems were written.
    Complete { stems: Vec<String> },
    /// Processing failed.
    Fail { kind: FailureKind, message: String },
    /// The retry policy requeues the job.
    Retry {
        retry_count: u32,
        max_retries: u32,
        message: String,
    },
    /// The retry budget is exhausted.
    DeadLetter {
        retry_count: u32,
        max_retries: u32,
        message: String,
    },
}

impl JobEvent {
    fn name(&self) -> &'static str {
        match self {
            JobEvent::Claim => "claim",
            JobEvent::Complete { .. } => "complete",
            JobEvent::Fail { .. } => "fail",
            JobEvent::Retry { .. } => "retry",
            JobEvent::DeadLetter { .. } => "dead_letter",
        }
    }
}

/// A validated state change and the fields it writes.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub from: JobState,
    pub to: JobState,
    pub update: JobUpdate,
}

impl Transition {
    /// The stored status the write must find in place.
    pub fn expected_status(&self) -> JobStatus {
        self.from.stored_status()
    }
}

/// Validates `event` against `state` and returns the transition to apply.
pub fn next(state: JobState, event: JobEvent) -> Result<Transition, TransitionError> {
    let event_name = event.name();
    let reject = |reason: &str| TransitionError {
        from: state.to_string(),
        event: event_name.to_string(),
        reason: reason.to_string(),
    };

    let (to, update) = match (state, event) {
        (JobState::Queued, JobEvent::Claim) => (
            JobState::Processing,
            JobUpdate::new()
                .status(JobStatus::Processing)
                .progress(CLAIM_PROGRESS)
                .message(CLAIM_MESSAGE),
        ),
        (JobState::Processing, JobEvent::Complete { stems }) => {
            if stems.is_empty() {
                return Err(reject("a completed job must have at least one stem"));
            }
            (
                JobState::Completed,
                JobUpdate::new()
                    .status(JobStatus::Completed)
                    .progress(100.0)
                    .message(COMPLETE_MESSAGE)
                    .stems(stems),
            )
        }
        (JobState::Processing, JobEvent::Fail { message, .. }) => (
            JobState::Failed,
            JobUpdate::new()
                .status(JobStatus::Failed)
                .progress(0.0)
                .message(message),
        ),
        (
            JobState::Failed,
            JobEvent::Retry {
                retry_count,
                max_retries,
                message,
            },
        ) => {
            if retry_count >= max_retries {
                return Err(reject("retry budget exhausted"));
            }
            (
                JobState::Queued,
                JobUpdate::new()
                    .status(JobStatus::Queued)
                    .progress(0.0)
                    .message(message)
                    .retry_count(retry_count + 1),
            )
        }
        (
            JobState::Failed,
            JobEvent::DeadLetter {
                retry_count,
                max_retries,
                message,
            },
        ) => {
            if retry_count < max_retries {
                return Err(reject("retry budget not exhausted"));
            }
            (
                JobState::DeadLettered,
                JobUpdate::new().progress(0.0).message(message),
            )
        }
        _ => return Err(reject("not allowed in this state")),
    };

    Ok(Transition {
        from: state,
        to,
        update,
    })
}
