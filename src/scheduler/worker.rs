//! The per-worker control loop.
//!
//! A [`Worker`] pulls job ids from the shared queue, drives each job through
//! the state machine and hands the actual separation to the
//! [`ProcessingAdapter`] on a spawned task. The task is raced against the job
//! deadline and the shutdown signal:
//!
//! - deadline: the task is aborted, partial output discarded, the job fails
//!   with [`FailureKind::Timeout`] and is not retried
//! - shutdown: the task is abandoned, the job fails with
//!   [`FailureKind::Interrupted`] and the loop exits
//!
//! A single job's failure never terminates the loop. Only an unreachable
//! store that does not come back within the reconnect budget does.

use std::any::Any;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinError;
use tracing::{debug, error, info, warn};

use crate::config::StemConfig;
use crate::error::{ProcessingError, StoreError};
use crate::jobs::{next, FailureKind, Job, JobEvent, JobState, JobStatus, JobUpdate};
use crate::metrics::MetricsCollector;
use crate::processing::{ProcessingAdapter, ProgressReporter, StemOutput};
use crate::store::Backend;

use super::retry::{RetryOutcome, RetryPolicy};
use super::shutdown::ShutdownSignal;
use super::worker_pool::SharedPoolStats;

/// Pause after an unexpected store error before polling again.
const ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Message stored on jobs found in-flight when a worker starts.
pub const CRASH_RECOVERY_MESSAGE: &str = "Worker crashed during processing";

/// Message stored on a job left in-flight by a lost store connection.
const CONNECTION_LOST_MESSAGE: &str = "Store connection lost during processing";

/// Settings for a single worker loop.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Stable identity; names the worker's in-flight list.
    pub worker_id: String,
    pub job_timeout: Duration,
    pub dequeue_timeout: Duration,
    pub reconnect_delay: Duration,
    pub reconnect_attempts: u32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self::from_config(&StemConfig::default())
    }
}

impl WorkerConfig {
    pub fn from_config(config: &StemConfig) -> Self {
        Self {
            worker_id: config.worker_id.clone(),
            job_timeout: config.job_timeout,
            dequeue_timeout: config.dequeue_timeout,
            reconnect_delay: config.reconnect_delay,
            reconnect_attempts: config.reconnect_attempts,
        }
    }

    pub fn with_worker_id(mut self, id: impl Into<String>) -> Self {
        self.worker_id = id.into();
        self
    }

    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = timeout;
        self
    }

    pub fn with_dequeue_timeout(mut self, timeout: Duration) -> Self {
        self.dequeue_timeout = timeout;
        self
    }

    pub fn with_reconnect(mut self, delay: Duration, attempts: u32) -> Self {
        self.reconnect_delay = delay;
        self.reconnect_attempts = attempts;
        self
    }
}

/// What happened to one dequeued job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Completed {
        stems: Vec<String>,
    },
    /// The job ended up `failed`; `retry` is set when the retry policy ran.
    Failed {
        kind: FailureKind,
        retry: Option<RetryOutcome>,
    },
    /// Missing, stale or concurrently modified job; nothing was done.
    Skipped,
    /// Shutdown was requested before the claim; the id went back to the queue.
    Released,
    /// Shutdown interrupted processing; the job was marked failed.
    Interrupted,
}

impl JobOutcome {
    /// Whether the loop should stop after this outcome.
    pub fn stops_worker(&self) -> bool {
        matches!(self, JobOutcome::Released | JobOutcome::Interrupted)
    }
}

/// How a finished attempt should be recorded.
#[derive(Debug, Clone)]
enum Verdict {
    Completed { stems: Vec<String> },
    Failed { kind: FailureKind, message: String },
}

/// An attempt whose result has not been written to the store yet.
#[derive(Debug, Clone)]
struct Unsettled {
    job_id: String,
    verdict: Verdict,
    elapsed: Duration,
}

/// A single worker processing jobs from the queue.
pub struct Worker {
    config: WorkerConfig,
    backend: Arc<dyn Backend>,
    adapter: Arc<ProcessingAdapter>,
    policy: RetryPolicy,
    shutdown: ShutdownSignal,
    metrics: MetricsCollector,
    stats: Arc<SharedPoolStats>,
    /// Result of the last attempt until it is recorded and acked.
    unsettled: Option<Unsettled>,
}

impl Worker {
    pub fn new(
        config: WorkerConfig,
        backend: Arc<dyn Backend>,
        adapter: Arc<ProcessingAdapter>,
        policy: RetryPolicy,
        shutdown: ShutdownSignal,
    ) -> Self {
        Self {
            config,
            backend,
            adapter,
            policy,
            shutdown,
            metrics: MetricsCollector::new(),
            stats: Arc::new(SharedPoolStats::new()),
            unsettled: None,
        }
    }

    pub(crate) fn with_stats(mut self, stats: Arc<SharedPoolStats>) -> Self {
        self.stats = stats;
        self
    }

    /// Returns the worker's ID.
    pub fn id(&self) -> &str {
        &self.config.worker_id
    }

    /// Main worker loop.
    ///
    /// Recovers jobs left in-flight by a previous run, then processes jobs
    /// until shutdown is requested.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Unavailable` if the store stays unreachable for
    /// the whole reconnect budget.
    pub async fn run(mut self) -> Result<(), StoreError> {
        info!(
            worker_id = %self.config.worker_id,
            engine = self.adapter.engine_name(),
            max_retries = self.policy.max_retries(),
            job_timeout_secs = self.config.job_timeout.as_secs_f64(),
            "Worker started"
        );
        self.metrics.inc_workers();

        let result = self.run_loop().await;

        self.metrics.dec_workers();
        match &result {
            Ok(()) => info!(worker_id = %self.config.worker_id, "Worker stopped"),
            Err(e) => error!(worker_id = %self.config.worker_id, error = %e, "Worker stopped"),
        }
        result
    }

    async fn run_loop(&mut self) -> Result<(), StoreError> {
        self.recover_until_reachable(CRASH_RECOVERY_MESSAGE).await?;

        while !self.shutdown.is_requested() {
            match self.run_once().await {
                Ok(Some(outcome)) if outcome.stops_worker() => break,
                Ok(Some(_)) => {}
                Ok(None) => self.refresh_queue_metrics().await,
                Err(e) if e.is_unavailable() => {
                    error!(
                        worker_id = %self.config.worker_id,
                        error = %e,
                        "Lost connection to job store"
                    );
                    self.reconnect().await?;
                }
                Err(e) => {
                    error!(
                        worker_id = %self.config.worker_id,
                        error = %e,
                        "Worker loop error"
                    );
                    self.unsettled = None;
                    tokio::time::sleep(ERROR_BACKOFF).await;
                }
            }
        }

        info!(worker_id = %self.config.worker_id, "Worker received shutdown signal");
        Ok(())
    }

    /// Waits for one job id and processes it.
    ///
    /// Returns `Ok(None)` when the dequeue timed out or shutdown was
    /// requested while waiting.
    pub async fn run_once(&mut self) -> Result<Option<JobOutcome>, StoreError> {
        let mut shutdown = self.shutdown.clone();
        // An id popped by a dequeue cancelled here stays in the in-flight
        // list and is released by the next startup recovery.
        let dequeued = tokio::select! {
            result = self.backend.dequeue(&self.config.worker_id, self.config.dequeue_timeout) => result?,
            _ = shutdown.requested() => return Ok(None),
        };

        match dequeued {
            Some(job_id) => self.process(&job_id).await.map(Some),
            None => {
                debug!(worker_id = %self.config.worker_id, "No jobs available");
                Ok(None)
            }
        }
    }

    /// Processes a dequeued job id and acks it.
    async fn process(&mut self, job_id: &str) -> Result<JobOutcome, StoreError> {
        let job = match self.backend.get(job_id).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                warn!(
                    worker_id = %self.config.worker_id,
                    job_id = %job_id,
                    "Job not found in store, dropping queue entry"
                );
                self.backend.ack(&self.config.worker_id, job_id).await?;
                return Ok(JobOutcome::Skipped);
            }
            Err(StoreError::CorruptJobData { reason, .. }) => {
                error!(
                    worker_id = %self.config.worker_id,
                    job_id = %job_id,
                    reason = %reason,
                    "Invalid job data"
                );
                let update = JobUpdate::new()
                    .status(JobStatus::Failed)
                    .progress(0.0)
                    .message(format!("Invalid job data: {}", reason));
                self.backend.update(job_id, &update).await?;
                self.backend.ack(&self.config.worker_id, job_id).await?;
                self.record_failure(FailureKind::CorruptJobData, Duration::ZERO);
                return Ok(JobOutcome::Failed {
                    kind: FailureKind::CorruptJobData,
                    retry: None,
                });
            }
            Err(e) => return Err(e),
        };

        let state = JobState::of(&job);
        if state != JobState::Queued {
            warn!(
                worker_id = %self.config.worker_id,
                job_id = %job_id,
                state = %state,
                "Skipping stale queue entry"
            );
            self.backend.ack(&self.config.worker_id, job_id).await?;
            return Ok(JobOutcome::Skipped);
        }

        if self.shutdown.is_requested() {
            self.backend.release(&self.config.worker_id, job_id).await?;
            return Ok(JobOutcome::Released);
        }

        if !self.apply(job_id, state, JobEvent::Claim).await? {
            debug!(job_id = %job_id, "Job claimed or removed concurrently");
            self.backend.ack(&self.config.worker_id, job_id).await?;
            return Ok(JobOutcome::Skipped);
        }

        info!(
            worker_id = %self.config.worker_id,
            job_id = %job_id,
            filename = %job.filename,
            model = %job.params.model,
            attempt = job.retry_count + 1,
            "Processing job"
        );

        let started = Instant::now();
        self.stats.job_started();
        self.metrics.inc_jobs_in_progress();

        let result = self.execute(&job).await;

        self.metrics.dec_jobs_in_progress();
        self.stats.job_finished();

        self.unsettled = Some(Unsettled {
            job_id: job.id.clone(),
            verdict: self.judge(&job, result),
            elapsed: started.elapsed(),
        });
        match self.settle_pending().await? {
            Some(outcome) => Ok(outcome),
            None => Ok(JobOutcome::Skipped),
        }
    }

    /// Runs the adapter on its own task, bounded by the deadline and the
    /// shutdown signal.
    async fn execute(&self, job: &Job) -> Result<Vec<StemOutput>, ProcessingError> {
        let adapter = Arc::clone(&self.adapter);
        let reporter = ProgressReporter::new(Arc::clone(&self.backend), job.id.clone());
        let task_job = job.clone();
        let mut handle = tokio::spawn(async move { adapter.run(&task_job, &reporter).await });

        let mut shutdown = self.shutdown.clone();
        tokio::select! {
            joined = &mut handle => match joined {
                Ok(result) => result,
                Err(e) => {
                    self.adapter.discard(&job.id).await;
                    Err(join_error(e))
                }
            },
            _ = tokio::time::sleep(self.config.job_timeout) => {
                handle.abort();
                // Let the engine child be dropped (and killed) before cleanup
                let _ = handle.await;
                self.adapter.discard(&job.id).await;
                Err(ProcessingError::Timeout(self.config.job_timeout))
            }
            // The adapter task is left running. Runtime teardown drops it,
            // which also cancels a normalization on a blocking thread.
            _ = shutdown.requested() => Err(ProcessingError::Interrupted),
        }
    }

    fn judge(&self, job: &Job, result: Result<Vec<StemOutput>, ProcessingError>) -> Verdict {
        match result {
            Ok(stems) => Verdict::Completed {
                stems: stems.into_iter().map(|s| s.name).collect(),
            },
            Err(e) => {
                let kind = e.kind();
                let message = e.to_string();
                error!(
                    worker_id = %self.config.worker_id,
                    job_id = %job.id,
                    kind = %kind,
                    error = %message,
                    "Job failed"
                );
                Verdict::Failed { kind, message }
            }
        }
    }

    /// Records the pending attempt, acks its queue entry and clears it.
    ///
    /// On a store error the attempt stays pending so the same verdict can be
    /// applied once the store is back. Returns `Ok(None)` if nothing was
    /// pending.
    async fn settle_pending(&mut self) -> Result<Option<JobOutcome>, StoreError> {
        let Some(pending) = self.unsettled.clone() else {
            return Ok(None);
        };

        let outcome = self.settle(&pending.job_id, &pending.verdict).await?;
        self.backend.ack(&self.config.worker_id, &pending.job_id).await?;
        self.unsettled = None;

        match &outcome {
            JobOutcome::Completed { stems } => {
                info!(
                    worker_id = %self.config.worker_id,
                    job_id = %pending.job_id,
                    stems = ?stems,
                    duration_ms = pending.elapsed.as_millis() as u64,
                    "Job completed successfully"
                );
                self.metrics.record_job("completed", "none", pending.elapsed);
                self.stats.record_completion(pending.elapsed);
            }
            JobOutcome::Failed { kind, .. } => self.record_failure(*kind, pending.elapsed),
            JobOutcome::Interrupted => {
                self.record_failure(FailureKind::Interrupted, pending.elapsed)
            }
            JobOutcome::Skipped | JobOutcome::Released => {}
        }
        Ok(Some(outcome))
    }

    /// Writes `verdict` for a job this worker was processing.
    ///
    /// Safe to repeat: a write that landed before a lost connection is
    /// recognized instead of being rejected.
    async fn settle(&self, job_id: &str, verdict: &Verdict) -> Result<JobOutcome, StoreError> {
        match verdict {
            Verdict::Completed { stems } => {
                let event = JobEvent::Complete {
                    stems: stems.clone(),
                };
                if !self.apply(job_id, JobState::Processing, event).await?
                    && !self.has_status(job_id, JobStatus::Completed).await?
                {
                    warn!(
                        worker_id = %self.config.worker_id,
                        job_id = %job_id,
                        "Job changed while processing, discarding its stems"
                    );
                    self.adapter.discard(job_id).await;
                    return Ok(JobOutcome::Skipped);
                }
                Ok(JobOutcome::Completed {
                    stems: stems.clone(),
                })
            }
            Verdict::Failed { kind, message } => {
                let retry = self.fail(job_id, *kind, message).await?;
                if *kind == FailureKind::Interrupted {
                    return Ok(JobOutcome::Interrupted);
                }
                Ok(JobOutcome::Failed { kind: *kind, retry })
            }
        }
    }

    async fn has_status(&self, job_id: &str, status: JobStatus) -> Result<bool, StoreError> {
        Ok(matches!(self.backend.get(job_id).await?, Some(job) if job.status == status))
    }

    /// Moves a `processing` job to `failed` and, for retryable kinds, applies
    /// the retry policy.
    async fn fail(
        &self,
        job_id: &str,
        kind: FailureKind,
        message: &str,
    ) -> Result<Option<RetryOutcome>, StoreError> {
        let event = JobEvent::Fail {
            kind,
            message: message.to_string(),
        };
        if !self.apply(job_id, JobState::Processing, event).await? {
            // The write may have landed before the connection dropped
            let landed = matches!(
                self.backend.get(job_id).await?,
                Some(job) if job.status == JobStatus::Failed && !job.dead_lettered
            );
            if !landed {
                warn!(
                    job_id = %job_id,
                    "Job is no longer processing, not recording failure"
                );
                return Ok(None);
            }
        }

        if !kind.is_retryable() {
            return Ok(None);
        }

        let outcome = self
            .policy
            .on_failure(self.backend.as_ref(), job_id, message)
            .await?;
        match outcome {
            RetryOutcome::Requeued { .. } => self.metrics.record_retry(),
            RetryOutcome::DeadLettered { .. } => self.metrics.record_dead_letter(),
            RetryOutcome::Skipped => {}
        }
        self.stats.record_retry(outcome);
        Ok(Some(outcome))
    }

    /// Validates `event` and writes it guarded by the state's stored status.
    ///
    /// Returns `Ok(false)` if the event is illegal or the stored status moved.
    async fn apply(&self, job_id: &str, state: JobState, event: JobEvent) -> Result<bool, StoreError> {
        let transition = match next(state, event) {
            Ok(transition) => transition,
            Err(e) => {
                error!(job_id = %job_id, error = %e, "Rejected state transition");
                return Ok(false);
            }
        };
        self.backend
            .transition(job_id, transition.expected_status(), &transition.update)
            .await
    }

    /// Handles ids left in this worker's in-flight list.
    ///
    /// `processing` jobs are failed with `reason` and routed through the
    /// retry policy; `queued` ones go back to the pending list; anything
    /// else is dropped.
    pub async fn recover(&self, reason: &str) -> Result<usize, StoreError> {
        let worker_id = &self.config.worker_id;
        let ids = self.backend.in_flight(worker_id).await?;

        for id in &ids {
            match self.backend.get(id).await {
                Ok(Some(job)) if job.status == JobStatus::Processing => {
                    warn!(
                        worker_id = %worker_id,
                        job_id = %id,
                        "Recovering job interrupted by a previous run"
                    );
                    self.adapter.discard(id).await;
                    self.record_failure(FailureKind::Crashed, Duration::ZERO);
                    self.fail(id, FailureKind::Crashed, reason).await?;
                    self.backend.ack(worker_id, id).await?;
                }
                Ok(Some(job)) if job.status == JobStatus::Queued => {
                    debug!(worker_id = %worker_id, job_id = %id, "Releasing unclaimed job");
                    self.backend.release(worker_id, id).await?;
                }
                Ok(_) | Err(StoreError::CorruptJobData { .. }) => {
                    self.backend.ack(worker_id, id).await?;
                }
                Err(e) => return Err(e),
            }
        }

        if !ids.is_empty() {
            info!(
                worker_id = %worker_id,
                recovered = ids.len(),
                "Recovered jobs from in-flight list"
            );
        }
        Ok(ids.len())
    }

    /// Waits for the store, records the attempt that was cut off by the
    /// outage, then recovers whatever else is left in flight.
    async fn reconnect(&mut self) -> Result<(), StoreError> {
        loop {
            self.wait_for_store().await?;
            match self.settle_pending().await {
                Ok(_) => break,
                Err(e) if e.is_unavailable() && !self.shutdown.is_requested() => {}
                Err(e) => {
                    warn!(
                        worker_id = %self.config.worker_id,
                        error = %e,
                        "Could not record the interrupted attempt, leaving it to recovery"
                    );
                    self.unsettled = None;
                    break;
                }
            }
        }
        self.recover_until_reachable(CONNECTION_LOST_MESSAGE).await
    }

    async fn recover_until_reachable(&self, reason: &str) -> Result<(), StoreError> {
        loop {
            match self.recover(reason).await {
                Ok(_) => return Ok(()),
                Err(e) if e.is_unavailable() => self.wait_for_store().await?,
                Err(e) => {
                    warn!(
                        worker_id = %self.config.worker_id,
                        error = %e,
                        "Failed to recover in-flight jobs"
                    );
                    return Ok(());
                }
            }
            if self.shutdown.is_requested() {
                return Ok(());
            }
        }
    }

    /// Probes the store until it answers or the reconnect budget runs out.
    async fn wait_for_store(&self) -> Result<(), StoreError> {
        let mut shutdown = self.shutdown.clone();
        let attempts = self.config.reconnect_attempts;

        for attempt in 1..=attempts {
            warn!(
                worker_id = %self.config.worker_id,
                attempt,
                max_attempts = attempts,
                delay_secs = self.config.reconnect_delay.as_secs_f64(),
                "Job store unavailable, waiting to reconnect"
            );
            tokio::select! {
                _ = tokio::time::sleep(self.config.reconnect_delay) => {}
                _ = shutdown.requested() => return Ok(()),
            }

            self.metrics.record_store_reconnect();
            match self.backend.ping().await {
                Ok(()) => {
                    info!(worker_id = %self.config.worker_id, "Job store reachable again");
                    return Ok(());
                }
                Err(e) => debug!(error = %e, "Reconnect probe failed"),
            }
        }

        Err(StoreError::Unavailable(format!(
            "no response after {} reconnect attempts",
            attempts
        )))
    }

    async fn refresh_queue_metrics(&self) {
        match self.backend.stats().await {
            Ok(stats) => self.metrics.update_queue_stats(&stats),
            Err(e) => debug!(error = %e, "Failed to read queue stats"),
        }
    }

    fn record_failure(&self, kind: FailureKind, duration: Duration) {
        self.metrics.record_job("failed", kind.as_str(), duration);
        self.stats.record_failure(duration);
    }
}

fn join_error(e: JoinError) -> ProcessingError {
    if e.is_panic() {
        ProcessingError::Panicked(panic_message(e.into_panic()))
    } else {
        ProcessingError::Panicked(e.to_string())
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;
    use crate::jobs::JobParams;
    use crate::processing::{EngineStem, SeparationEngine, SeparationRequest};
    use crate::scheduler::shutdown::ShutdownCoordinator;
    use crate::store::{JobStore, MemoryBackend, WorkQueue};
    use async_trait::async_trait;

    /// Writes a single stem, or fails when the input file says so.
    struct FileDrivenEngine;

    #[async_trait]
    impl SeparationEngine for FileDrivenEngine {
        fn name(&self) -> &str {
            "file-driven"
        }

        async fn separate(
            &self,
            request: &SeparationRequest,
            _progress: &ProgressReporter,
        ) -> Result<Vec<EngineStem>, EngineError> {
            let content = tokio::fs::read(&request.input).await?;
            if content == b"fail" {
                return Err(EngineError::NonZeroExit {
                    code: 1,
                    stderr: "bad audio".into(),
                });
            }
            if content == b"panic" {
                panic!("engine panicked");
            }
            tokio::fs::create_dir_all(&request.output_dir).await?;
            let path = request.output_dir.join("vocals.wav");
            tokio::fs::write(&path, b"RIFF").await?;
            Ok(vec![EngineStem {
                name: "vocals".into(),
                path,
            }])
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        backend: MemoryBackend,
        adapter: Arc<ProcessingAdapter>,
        coordinator: ShutdownCoordinator,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let adapter = Arc::new(ProcessingAdapter::new(
                Arc::new(FileDrivenEngine),
                dir.path().join("uploads"),
                dir.path().join("outputs"),
            ));
            std::fs::create_dir_all(adapter.upload_dir()).unwrap();
            Self {
                _dir: dir,
                backend: MemoryBackend::new(),
                adapter,
                coordinator: ShutdownCoordinator::new(),
            }
        }

        fn worker(&self, max_retries: u32) -> Worker {
            let config = WorkerConfig::default()
                .with_worker_id("w1")
                .with_dequeue_timeout(Duration::from_millis(50));
            Worker::new(
                config,
                Arc::new(self.backend.clone()),
                Arc::clone(&self.adapter),
                RetryPolicy::new(max_retries),
                self.coordinator.signal(),
            )
        }

        async fn submit(&self, id: &str, content: &[u8]) {
            let path = self.adapter.upload_dir().join(format!("{}_song.wav", id));
            tokio::fs::write(path, content).await.unwrap();
            self.backend
                .create(id, "song.wav", &JobParams::default())
                .await
                .unwrap();
            self.backend.enqueue(id).await.unwrap();
        }

        async fn job(&self, id: &str) -> Job {
            self.backend.get(id).await.unwrap().unwrap()
        }
    }

    fn upload(adapter: &ProcessingAdapter, id: &str) -> std::path::PathBuf {
        adapter.upload_dir().join(format!("{}_song.wav", id))
    }

    #[tokio::test]
    async fn test_run_once_completes_job() {
        let fx = Fixture::new();
        fx.submit("j1", b"audio").await;
        let mut worker = fx.worker(3);

        let outcome = worker.run_once().await.unwrap();
        assert_eq!(
            outcome,
            Some(JobOutcome::Completed {
                stems: vec!["vocals".into()]
            })
        );

        let job = fx.job("j1").await;
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.progress, 100.0);
        assert_eq!(job.stems, vec!["vocals".to_string()]);
        assert!(fx.adapter.job_output_dir("j1").join("vocals.wav").is_file());
        assert!(!upload(&fx.adapter, "j1").exists());
        assert!(fx.backend.in_flight("w1").await.unwrap().is_empty());
    }

    async fn claim(fx: &Fixture, id: &str) {
        let popped = fx.backend.dequeue("w1", Duration::from_millis(10)).await.unwrap();
        assert_eq!(popped.as_deref(), Some(id));
        let update = JobUpdate::new().status(JobStatus::Processing).progress(5.0);
        assert!(fx
            .backend
            .transition(id, JobStatus::Queued, &update)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_pending_timeout_is_recorded_without_retry() {
        let fx = Fixture::new();
        fx.submit("j1", b"audio").await;
        claim(&fx, "j1").await;
        let mut worker = fx.worker(3);
        worker.unsettled = Some(Unsettled {
            job_id: "j1".into(),
            verdict: Verdict::Failed {
                kind: FailureKind::Timeout,
                message: "Job timeout after 0.3 seconds".into(),
            },
            elapsed: Duration::from_millis(300),
        });

        fx.backend.set_available(false);
        assert!(worker.settle_pending().await.unwrap_err().is_unavailable());
        assert!(worker.unsettled.is_some());

        fx.backend.set_available(true);
        let outcome = worker.settle_pending().await.unwrap();
        assert_eq!(
            outcome,
            Some(JobOutcome::Failed {
                kind: FailureKind::Timeout,
                retry: None,
            })
        );
        assert!(worker.unsettled.is_none());

        let job = fx.job("j1").await;
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.retry_count, 0);
        assert_eq!(job.message, "Job timeout after 0.3 seconds");
        assert!(fx.backend.pending().await.is_empty());
        assert!(fx.backend.in_flight("w1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_pending_failure_already_written_still_retries() {
        let fx = Fixture::new();
        fx.submit("j1", b"audio").await;
        claim(&fx, "j1").await;
        // The failed write landed, then the connection dropped
        let failed = JobUpdate::new()
            .status(JobStatus::Failed)
            .progress(0.0)
            .message("Error processing job: bad audio");
        fx.backend
            .transition("j1", JobStatus::Processing, &failed)
            .await
            .unwrap();

        let mut worker = fx.worker(3);
        worker.unsettled = Some(Unsettled {
            job_id: "j1".into(),
            verdict: Verdict::Failed {
                kind: FailureKind::EngineFailure,
                message: "Error processing job: bad audio".into(),
            },
            elapsed: Duration::from_millis(10),
        });

        let outcome = worker.settle_pending().await.unwrap();
        assert_eq!(
            outcome,
            Some(JobOutcome::Failed {
                kind: FailureKind::EngineFailure,
                retry: Some(RetryOutcome::Requeued { retry_count: 1 }),
            })
        );
        let job = fx.job("j1").await;
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.retry_count, 1);
        assert_eq!(fx.backend.pending().await, vec!["j1".to_string()]);
        assert!(fx.backend.in_flight("w1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_pending_completion_already_written_is_kept() {
        let fx = Fixture::new();
        fx.submit("j1", b"audio").await;
        claim(&fx, "j1").await;
        let done = JobUpdate::new()
            .status(JobStatus::Completed)
            .progress(100.0)
            .stems(vec!["vocals".into()]);
        fx.backend
            .transition("j1", JobStatus::Processing, &done)
            .await
            .unwrap();

        let mut worker = fx.worker(3);
        worker.unsettled = Some(Unsettled {
            job_id: "j1".into(),
            verdict: Verdict::Completed {
                stems: vec!["vocals".into()],
            },
            elapsed: Duration::from_millis(10),
        });

        let outcome = worker.settle_pending().await.unwrap();
        assert_eq!(
            outcome,
            Some(JobOutcome::Completed {
                stems: vec!["vocals".into()]
            })
        );
        assert_eq!(fx.job("j1").await.status, JobStatus::Completed);
        assert!(fx.backend.in_flight("w1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_engine_failure_is_requeued() {
        let fx = Fixture::new();
        fx.submit("j1", b"fail").await;
        let mut worker = fx.worker(3);

        let outcome = worker.run_once().await.unwrap();
        assert_eq!(
            outcome,
            Some(JobOutcome::Failed {
                kind: FailureKind::EngineFailure,
                retry: Some(RetryOutcome::Requeued { retry_count: 1 }),
            })
        );

        let job = fx.job("j1").await;
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.retry_count, 1);
        assert!(job.message.contains("bad audio"));
        assert!(upload(&fx.adapter, "j1").exists());
        assert_eq!(fx.backend.pending().await, vec!["j1".to_string()]);
    }

    #[tokio::test]
    async fn test_panicking_engine_fails_job() {
        let fx = Fixture::new();
        fx.submit("j1", b"panic").await;
        let mut worker = fx.worker(0);

        let outcome = worker.run_once().await.unwrap();
        assert_eq!(
            outcome,
            Some(JobOutcome::Failed {
                kind: FailureKind::EngineFailure,
                retry: Some(RetryOutcome::DeadLettered { retry_count: 0 }),
            })
        );
        let job = fx.job("j1").await;
        assert!(job.dead_lettered);
        assert!(job.message.contains("engine panicked"));
    }

    #[tokio::test]
    async fn test_missing_input_is_not_retried() {
        let fx = Fixture::new();
        fx.backend
            .create("j1", "song.wav", &JobParams::default())
            .await
            .unwrap();
        fx.backend.enqueue("j1").await.unwrap();
        let mut worker = fx.worker(3);

        let outcome = worker.run_once().await.unwrap();
        assert_eq!(
            outcome,
            Some(JobOutcome::Failed {
                kind: FailureKind::InputMissing,
                retry: None,
            })
        );
        let job = fx.job("j1").await;
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.retry_count, 0);
        assert!(fx.backend.pending().await.is_empty());
    }

    #[tokio::test]
    async fn test_missing_and_stale_entries_are_skipped() {
        let fx = Fixture::new();
        fx.backend.enqueue("ghost").await.unwrap();
        fx.submit("done", b"audio").await;
        fx.backend
            .update("done", &JobUpdate::new().status(JobStatus::Completed))
            .await
            .unwrap();
        let mut worker = fx.worker(3);

        assert_eq!(worker.run_once().await.unwrap(), Some(JobOutcome::Skipped));
        assert_eq!(worker.run_once().await.unwrap(), Some(JobOutcome::Skipped));
        assert_eq!(fx.job("done").await.status, JobStatus::Completed);
        assert!(fx.backend.in_flight("w1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_record_is_failed_without_retry() {
        let fx = Fixture::new();
        let mut fields = std::collections::HashMap::new();
        fields.insert("status".to_string(), "queued".to_string());
        fields.insert("progress".to_string(), "lots".to_string());
        fx.backend.insert_raw("bad", fields).await;
        fx.backend.enqueue("bad").await.unwrap();
        let mut worker = fx.worker(3);

        let outcome = worker.run_once().await.unwrap();
        assert_eq!(
            outcome,
            Some(JobOutcome::Failed {
                kind: FailureKind::CorruptJobData,
                retry: None,
            })
        );
        assert!(fx.backend.pending().await.is_empty());
        assert!(fx.backend.in_flight("w1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_empty_queue_returns_none() {
        let fx = Fixture::new();
        let mut worker = fx.worker(3);
        assert_eq!(worker.run_once().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_recover_fails_processing_and_releases_queued() {
        let fx = Fixture::new();
        fx.submit("crashed", b"audio").await;
        fx.submit("unclaimed", b"audio").await;
        // Simulate a previous run that claimed one job and popped another
        let dequeued = fx
            .backend
            .dequeue("w1", Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(dequeued.as_deref(), Some("crashed"));
        fx.backend
            .update("crashed", &JobUpdate::new().status(JobStatus::Processing))
            .await
            .unwrap();
        fx.backend
            .dequeue("w1", Duration::from_millis(10))
            .await
            .unwrap();

        let worker = fx.worker(3);
        assert_eq!(worker.recover(CRASH_RECOVERY_MESSAGE).await.unwrap(), 2);

        let crashed = fx.job("crashed").await;
        assert_eq!(crashed.status, JobStatus::Queued);
        assert_eq!(crashed.retry_count, 1);
        assert!(crashed.message.contains(CRASH_RECOVERY_MESSAGE));
        assert_eq!(fx.job("unclaimed").await.status, JobStatus::Queued);
        assert!(fx.backend.in_flight("w1").await.unwrap().is_empty());

        let mut pending = fx.backend.pending().await;
        pending.sort();
        assert_eq!(pending, vec!["crashed".to_string(), "unclaimed".to_string()]);
    }

    #[tokio::test]
    async fn test_run_exits_on_shutdown() {
        let fx = Fixture::new();
        let worker = fx.worker(3);
        let handle = tokio::spawn(worker.run());
        tokio::time::sleep(Duration::from_millis(20)).await;
        fx.coordinator.trigger();
        let result = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("worker did not stop")
            .unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_shutdown_before_claim_releases_job() {
        let fx = Fixture::new();
        fx.submit("j1", b"audio").await;
        fx.coordinator.trigger();
        let mut worker = fx.worker(3);

        // run_once returns immediately on a requested shutdown, so drive
        // process() directly with an id already in flight.
        fx.backend
            .dequeue("w1", Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(worker.process("j1").await.unwrap(), JobOutcome::Released);
        assert_eq!(fx.job("j1").await.status, JobStatus::Queued);
        assert_eq!(fx.backend.pending().await, vec!["j1".to_string()]);
    }

    #[test]
    fn test_panic_message() {
        assert_eq!(panic_message(Box::new("boom")), "boom");
        assert_eq!(panic_message(Box::new(String::from("bang"))), "bang");
        assert_eq!(panic_message(Box::new(7u8)), "unknown panic");
    }
}
