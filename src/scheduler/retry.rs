//! Retry and dead-letter policy for failed jobs.
//!
//! The decision rule lives here; backends apply it atomically together with
//! the queue push (see [`WorkQueue::requeue_failed`]). The backend only acts
//! on a job whose stored status is `failed` and which has not been
//! dead-lettered yet, so invoking the policy twice for one failure does not
//! retry twice.
//!
//! [`WorkQueue::requeue_failed`]: crate::store::WorkQueue::requeue_failed

use tracing::{error, info, warn};

use crate::error::StoreError;
use crate::store::Backend;

/// Default maximum number of retries per job.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// What the policy wants done with a failed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Requeue; `retry_count` becomes `next_retry`.
    Retry { next_retry: u32 },
    /// Give up and dead-letter the job.
    DeadLetter,
}

/// What the backend actually did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOutcome {
    Requeued { retry_count: u32 },
    DeadLettered { retry_count: u32 },
    /// The job was missing, not `failed`, or already dead-lettered.
    Skipped,
}

/// Bounded retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RETRIES)
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self { max_retries }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Decides based on how many retries the job has already used.
    pub fn decide(&self, retry_count: u32) -> RetryDecision {
        if retry_count < self.max_retries {
            RetryDecision::Retry {
                next_retry: retry_count + 1,
            }
        } else {
            RetryDecision::DeadLetter
        }
    }

    /// Message stored on a requeued job.
    pub fn requeue_message(&self, cause: &str) -> String {
        format!("Queued for retry after error: {}", cause)
    }

    /// Message stored on a dead-lettered job.
    pub fn dead_letter_message(&self, cause: &str) -> String {
        format!("Max retries ({}) exceeded: {}", self.max_retries, cause)
    }

    /// Applies the policy to a job that has just been marked `failed`.
    pub async fn on_failure(
        &self,
        backend: &dyn Backend,
        job_id: &str,
        cause: &str,
    ) -> Result<RetryOutcome, StoreError> {
        let outcome = backend.requeue_failed(job_id, self, cause).await?;

        match outcome {
            RetryOutcome::Requeued { retry_count } => info!(
                job_id = %job_id,
                retry = retry_count,
                max_retries = self.max_retries,
                "Job queued for retry"
            ),
            RetryOutcome::DeadLettered { retry_count } => error!(
                job_id = %job_id,
                retries = retry_count,
                "Job moved to dead letter queue after exhausting retries"
            ),
            RetryOutcome::Skipped => warn!(
                job_id = %job_id,
                "Retry policy skipped job that is no longer awaiting a retry decision"
            ),
        }

        Ok(outcome)
    }
}
