//! Job store and work queue.
//!
//! Two traits describe the shared state every worker coordinates through:
//!
//! - [`JobStore`]: job records with atomic per-field writes
//! - [`WorkQueue`]: the pending list, per-worker in-flight lists and the
//!   dead-letter list
//!
//! # Backends
//!
//! - [`RedisBackend`]: production backend. Records are hashes (`job:{id}`),
//!   queues are lists, and every conditional write runs as a server-side
//!   script so no read-modify-write crosses the network.
//! - [`MemoryBackend`]: single-process backend with identical semantics,
//!   used for local runs and tests.
//!
//! # Queue Structure
//!
//! ```text
//!  enqueue ──LPUSH──▶ [ job_queue ] ──BRPOPLPUSH──▶ [ job_queue:processing:{worker} ]
//!                                                        │ ack (LREM)
//!  retry policy ──▶ LPUSH job_queue | LPUSH job_dead_letter
//! ```

pub mod memory;
pub mod redis;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::StoreError;
use crate::jobs::{Job, JobParams, JobStatus, JobUpdate};
use crate::scheduler::retry::{RetryOutcome, RetryPolicy};

pub use self::memory::MemoryBackend;
pub use self::redis::RedisBackend;

/// Default name of the pending-work list.
pub const DEFAULT_QUEUE_NAME: &str = "job_queue";

/// Default name of the dead-letter list.
pub const DEFAULT_DEAD_LETTER_NAME: &str = "job_dead_letter";

/// Durable job records.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Creates a queued job. Fails with [`StoreError::DuplicateJob`] if the
    /// id is already taken.
    async fn create(&self, id: &str, filename: &str, params: &JobParams)
        -> Result<Job, StoreError>;

    /// Loads a job. A record that exists but cannot be parsed yields
    /// [`StoreError::CorruptJobData`].
    async fn get(&self, id: &str) -> Result<Option<Job>, StoreError>;

    /// Writes the fields set in `update`, leaving the others untouched.
    /// Never recreates a deleted record.
    async fn update(&self, id: &str, update: &JobUpdate) -> Result<(), StoreError>;

    /// Writes `update` only if the stored status equals `expected`.
    ///
    /// Returns `Ok(false)` when the status did not match.
    async fn transition(
        &self,
        id: &str,
        expected: JobStatus,
        update: &JobUpdate,
    ) -> Result<bool, StoreError>;

    /// Removes the record and any pending-queue entries for it. Returns
    /// whether a record existed.
    async fn delete(&self, id: &str) -> Result<bool, StoreError>;

    /// Checks that the backing service answers.
    async fn ping(&self) -> Result<(), StoreError>;
}

/// Queue statistics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueStats {
    pub queue_name: String,
    pub pending_jobs: usize,
    pub dead_letter_jobs: usize,
}

impl QueueStats {
    pub fn total_jobs(&self) -> usize {
        self.pending_jobs + self.dead_letter_jobs
    }
}

/// Pending work, claims and dead letters.
#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Appends a job id to the tail of the pending list.
    async fn enqueue(&self, id: &str) -> Result<(), StoreError>;

    /// Waits up to `timeout` for a job id. The id is moved atomically into
    /// the worker's in-flight list, so no two callers receive the same id.
    async fn dequeue(&self, worker_id: &str, timeout: Duration)
        -> Result<Option<String>, StoreError>;

    /// Drops a finalized job from the worker's in-flight list.
    async fn ack(&self, worker_id: &str, id: &str) -> Result<(), StoreError>;

    /// Moves an unclaimed id from the worker's in-flight list back to the
    /// head of the pending list.
    async fn release(&self, worker_id: &str, id: &str) -> Result<(), StoreError>;

    /// Ids left in the worker's in-flight list, e.g. by a crashed run.
    async fn in_flight(&self, worker_id: &str) -> Result<Vec<String>, StoreError>;

    /// Appends a job id to the dead-letter list.
    async fn dead_letter(&self, id: &str) -> Result<(), StoreError>;

    /// Most recent dead-lettered ids, newest first.
    async fn dead_letters(&self, limit: usize) -> Result<Vec<String>, StoreError>;

    /// Applies `policy` to a `failed` job in one atomic step: either bump
    /// `retry_count`, mark it queued and enqueue it, or dead-letter it.
    async fn requeue_failed(
        &self,
        id: &str,
        policy: &RetryPolicy,
        cause: &str,
    ) -> Result<RetryOutcome, StoreError>;

    async fn stats(&self) -> Result<QueueStats, StoreError>;
}

/// Everything a worker needs from shared state.
pub trait Backend: JobStore + WorkQueue {}

impl<T: JobStore + WorkQueue> Backend for T {}

/// Key of the hash holding a job record.
pub fn job_key(id: &str) -> String {
    format!("job:{}", id)
}

/// Name of a worker's in-flight list.
pub fn in_flight_key(queue_name: &str, worker_id: &str) -> String {
    format!("{}:processing:{}", queue_name, worker_id)
}
