//! Job scheduling: worker loops, retry policy and shutdown.
//!
//! ```text
//!                      ┌──────────────┐
//!                      │  JobService  │
//!                      │ (submit/CLI) │
//!                      └──────┬───────┘
//!                             │ create + enqueue
//!                      ┌──────▼───────┐
//!                      │  Job store   │
//!                      │  and queue   │
//!                      └──────┬───────┘
//!                             │ dequeue (atomic move to in-flight)
//!         ┌───────────────────┼───────────────────┐
//!         ▼                   ▼                   ▼
//!    ┌─────────┐         ┌─────────┐         ┌─────────┐
//!    │ Worker 1│         │ Worker 2│         │ Worker N│
//!    └─────────┘         └─────────┘         └─────────┘
//! ```
//!
//! # Reliability Features
//!
//! - **Atomic dequeue**: an id is moved into the worker's in-flight list as it
//!   is popped, so no two workers see the same id
//! - **Crash recovery**: on startup a worker fails and retries the jobs left in
//!   its in-flight list by a previous run
//! - **Bounded retries**: engine failures are requeued up to `max_retries`
//!   times, then dead-lettered
//! - **Graceful shutdown**: SIGTERM/SIGINT mark the running job failed and stop
//!   the loop without waiting for the engine

pub mod retry;
pub mod shutdown;
pub mod worker;
pub mod worker_pool;

pub use retry::{RetryDecision, RetryOutcome, RetryPolicy, DEFAULT_MAX_RETRIES};
pub use shutdown::{ShutdownCoordinator, ShutdownSignal};
pub use worker::{JobOutcome, Worker, WorkerConfig, CRASH_RECOVERY_MESSAGE};
pub use worker_pool::{PoolError, PoolStats, WorkerPool, WorkerPoolConfig};
