//! Pool of worker loops inside one process.
//!
//! Running `N` workers in a pool is equivalent to running `N` worker
//! processes: each worker has its own id (and so its own in-flight list) and
//! its own backend handle, and they coordinate only through the store.
//!
//! # Features
//!
//! - Configurable number of workers
//! - Graceful shutdown through the shared [`ShutdownCoordinator`]
//! - Pool statistics tracking

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::error::StoreError;
use crate::processing::ProcessingAdapter;
use crate::store::Backend;

use super::retry::{RetryOutcome, RetryPolicy};
use super::shutdown::ShutdownCoordinator;
use super::worker::{Worker, WorkerConfig};

/// Errors that can occur in the worker pool.
#[derive(Debug, Error)]
pub enum PoolError {
    /// Worker initialization failed.
    #[error("Worker initialization failed: {0}")]
    WorkerInitFailed(String),

    /// Pool is already running.
    #[error("Pool is already running")]
    AlreadyRunning,

    /// Pool is not running.
    #[error("Pool is not running")]
    NotRunning,

    /// Shutdown timed out.
    #[error("Shutdown timed out after {0:?}")]
    ShutdownTimeout(Duration),

    /// A worker stopped because the store stayed unreachable.
    #[error("Worker {worker_id} stopped: {source}")]
    WorkerFailed {
        worker_id: String,
        #[source]
        source: StoreError,
    },

    /// A worker task panicked.
    #[error("Worker task panicked: {0}")]
    WorkerPanicked(String),
}

/// Configuration for the worker pool.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Number of worker tasks to spawn.
    pub num_workers: usize,
    /// Settings shared by every worker; ids are derived from `worker_id`.
    pub worker: WorkerConfig,
    /// Timeout for graceful shutdown.
    pub shutdown_timeout: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            num_workers: 1,
            worker: WorkerConfig::default(),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl WorkerPoolConfig {
    /// Creates a new configuration with the specified number of workers.
    pub fn new(num_workers: usize) -> Self {
        Self {
            num_workers,
            ..Default::default()
        }
    }

    /// Sets the per-worker settings.
    pub fn with_worker(mut self, worker: WorkerConfig) -> Self {
        self.worker = worker;
        self
    }

    /// Sets the shutdown timeout.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Id of worker `index`.
    ///
    /// A single-worker pool uses the configured id unchanged so its
    /// in-flight list survives switching between pool and standalone runs.
    pub fn worker_id(&self, index: usize) -> String {
        if self.num_workers <= 1 {
            self.worker.worker_id.clone()
        } else {
            format!("{}-{}", self.worker.worker_id, index)
        }
    }
}

/// Counters for the jobs this pool's workers have handled.
///
/// Each processing attempt counts once, so a job that failed twice and then
/// completed shows up as two failures, two retries and one completion.
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    pub num_workers: usize,
    /// Workers with a job on the engine right now.
    pub busy_workers: usize,
    pub completed: u64,
    pub failed: u64,
    /// Failures the retry policy sent back to the queue.
    pub retried: u64,
    pub dead_lettered: u64,
    /// Mean wall time of an attempt, successful or not.
    pub mean_attempt_time: Duration,
}

impl PoolStats {
    pub fn attempts(&self) -> u64 {
        self.completed + self.failed
    }

    /// Percentage of attempts that produced stems.
    pub fn completion_rate(&self) -> f64 {
        match self.attempts() {
            0 => 0.0,
            n => self.completed as f64 * 100.0 / n as f64,
        }
    }
}

/// Counters shared by the workers of one pool.
#[derive(Default)]
pub(crate) struct SharedPoolStats {
    completed: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
    dead_lettered: AtomicU64,
    attempt_time_ms: AtomicU64,
    busy: AtomicU64,
}

impl SharedPoolStats {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_completion(&self, elapsed: Duration) {
        self.completed.fetch_add(1, Ordering::Relaxed);
        self.add_time(elapsed);
    }

    pub(crate) fn record_failure(&self, elapsed: Duration) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        self.add_time(elapsed);
    }

    pub(crate) fn record_retry(&self, outcome: RetryOutcome) {
        match outcome {
            RetryOutcome::Requeued { .. } => self.retried.fetch_add(1, Ordering::Relaxed),
            RetryOutcome::DeadLettered { .. } => self.dead_lettered.fetch_add(1, Ordering::Relaxed),
            RetryOutcome::Skipped => return,
        };
    }

    pub(crate) fn job_started(&self) {
        self.busy.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn job_finished(&self) {
        self.busy.fetch_sub(1, Ordering::Relaxed);
    }

    fn add_time(&self, elapsed: Duration) {
        self.attempt_time_ms
            .fetch_add(elapsed.as_millis() as u64, Ordering::Relaxed);
    }

    fn snapshot(&self, num_workers: usize) -> PoolStats {
        let mut stats = PoolStats {
            num_workers,
            busy_workers: self.busy.load(Ordering::Relaxed) as usize,
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            mean_attempt_time: Duration::ZERO,
        };
        if let Some(ms) = self
            .attempt_time_ms
            .load(Ordering::Relaxed)
            .checked_div(stats.attempts())
        {
            stats.mean_attempt_time = Duration::from_millis(ms);
        }
        stats
    }
}

/// Worker pool that manages multiple workers processing jobs from a queue.
pub struct WorkerPool {
    config: WorkerPoolConfig,
    adapter: Arc<ProcessingAdapter>,
    policy: RetryPolicy,
    shutdown: ShutdownCoordinator,
    worker_handles: Vec<(String, JoinHandle<Result<(), StoreError>>)>,
    stats: Arc<SharedPoolStats>,
    is_running: AtomicBool,
}

impl WorkerPool {
    /// Creates a new worker pool.
    ///
    /// Workers stop when `shutdown` is triggered, either by [`shutdown`]
    /// or by the coordinator's signal listener.
    ///
    /// [`shutdown`]: WorkerPool::shutdown
    pub fn new(
        config: WorkerPoolConfig,
        adapter: Arc<ProcessingAdapter>,
        policy: RetryPolicy,
        shutdown: ShutdownCoordinator,
    ) -> Self {
        Self {
            config,
            adapter,
            policy,
            shutdown,
            worker_handles: Vec::new(),
            stats: Arc::new(SharedPoolStats::new()),
            is_running: AtomicBool::new(false),
        }
    }

    /// Starts one worker per backend handle.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::AlreadyRunning` if the pool is already running,
    /// or `PoolError::WorkerInitFailed` if the number of backends does not
    /// match the configured worker count.
    pub fn start(&mut self, backends: Vec<Arc<dyn Backend>>) -> Result<(), PoolError> {
        if self.is_running.load(Ordering::SeqCst) {
            return Err(PoolError::AlreadyRunning);
        }
        if self.config.num_workers == 0 {
            return Err(PoolError::WorkerInitFailed(
                "num_workers must be greater than 0".to_string(),
            ));
        }
        if backends.len() != self.config.num_workers {
            return Err(PoolError::WorkerInitFailed(format!(
                "expected {} backend handles, got {}",
                self.config.num_workers,
                backends.len()
            )));
        }

        for (i, backend) in backends.into_iter().enumerate() {
            let worker_id = self.config.worker_id(i);
            let worker = Worker::new(
                self.config.worker.clone().with_worker_id(worker_id.clone()),
                backend,
                Arc::clone(&self.adapter),
                self.policy,
                self.shutdown.signal(),
            )
            .with_stats(Arc::clone(&self.stats));

            let handle = tokio::spawn(worker.run());
            self.worker_handles.push((worker_id, handle));
        }

        self.is_running.store(true, Ordering::SeqCst);
        info!(num_workers = self.config.num_workers, "Worker pool started");

        Ok(())
    }

    /// Waits for every worker to stop on its own, e.g. after a termination
    /// signal. Returns the first worker failure.
    pub async fn join(&mut self) -> Result<(), PoolError> {
        let mut first_error = None;

        // Workers are observed in exit order, not spawn order
        let mut exits: FuturesUnordered<_> = self
            .worker_handles
            .drain(..)
            .map(|(worker_id, handle)| async move { (worker_id, handle.await) })
            .collect();

        while let Some((worker_id, joined)) = exits.next().await {
            let err = match joined {
                Ok(Ok(())) => continue,
                Ok(Err(source)) => PoolError::WorkerFailed { worker_id, source },
                Err(e) => PoolError::WorkerPanicked(e.to_string()),
            };
            error!(error = %err, "Worker exited with error");
            // One dead worker means the store is gone for all of them
            self.shutdown.trigger();
            first_error.get_or_insert(err);
        }

        self.is_running.store(false, Ordering::SeqCst);
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Gracefully shuts down all workers.
    ///
    /// Triggers the shutdown signal and waits for the workers to return.
    /// A worker in the middle of a job marks it failed and stops without
    /// waiting for the engine.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::ShutdownTimeout` if workers don't stop within
    /// the configured timeout.
    pub async fn shutdown(&mut self) -> Result<(), PoolError> {
        if !self.is_running.load(Ordering::SeqCst) {
            return Err(PoolError::NotRunning);
        }

        info!("Initiating worker pool shutdown");
        self.shutdown.trigger();

        let timeout = self.config.shutdown_timeout;
        match tokio::time::timeout(timeout, self.join()).await {
            Ok(result) => {
                info!("Worker pool shutdown complete");
                result
            }
            Err(_) => {
                self.is_running.store(false, Ordering::SeqCst);
                Err(PoolError::ShutdownTimeout(timeout))
            }
        }
    }

    /// Returns current pool statistics.
    pub fn stats(&self) -> PoolStats {
        self.stats.snapshot(self.config.num_workers)
    }

    /// Returns whether the pool is currently running.
    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    /// Returns the number of workers in the pool.
    pub fn num_workers(&self) -> usize {
        self.config.num_workers
    }

    pub fn config(&self) -> &WorkerPoolConfig {
        &self.config
    }
}
