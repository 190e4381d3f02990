//! In-process job store and work queue.
//!
//! Mirrors the Redis layout (field maps, a pending list consumed from the
//! right, per-worker in-flight lists, a dead-letter list) behind a single
//! mutex, so every operation is atomic. Cloning shares the same state.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use super::{JobStore, QueueStats, WorkQueue, DEFAULT_QUEUE_NAME};
use crate::error::StoreError;
use crate::jobs::job::{FIELD_DEAD_LETTERED, FIELD_RETRY_COUNT, FIELD_STATUS};
use crate::jobs::{next, Job, JobEvent, JobParams, JobState, JobStatus, JobUpdate};
use crate::scheduler::retry::{RetryDecision, RetryOutcome, RetryPolicy};

type Fields = HashMap<String, String>;

#[derive(Default)]
struct State {
    jobs: HashMap<String, Fields>,
    /// Front is the LPUSH end, back is the consuming end.
    pending: VecDeque<String>,
    in_flight: HashMap<String, Vec<String>>,
    /// Newest first.
    dead_letters: VecDeque<String>,
}

struct Inner {
    state: Mutex<State>,
    enqueued: Notify,
    available: AtomicBool,
}

/// Shared in-memory backend.
#[derive(Clone)]
pub struct MemoryBackend {
    inner: Arc<Inner>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                enqueued: Notify::new(),
                available: AtomicBool::new(true),
            }),
        }
    }

    /// Simulates the store going away (`false`) or coming back (`true`).
    pub fn set_available(&self, available: bool) {
        self.inner.available.store(available, Ordering::SeqCst);
    }

    /// Stores a raw field map for `id`, bypassing validation.
    pub async fn insert_raw(&self, id: &str, fields: HashMap<String, String>) {
        self.inner.state.lock().await.jobs.insert(id.to_string(), fields);
    }

    /// Ids waiting in the pending list, in dequeue order.
    pub async fn pending(&self) -> Vec<String> {
        let state = self.inner.state.lock().await;
        state.pending.iter().rev().cloned().collect()
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.inner.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("memory store marked unavailable".into()))
        }
    }
}

fn apply(fields: &mut Fields, pairs: Vec<(&'static str, String)>) {
    for (key, value) in pairs {
        fields.insert(key.to_string(), value);
    }
}

#[async_trait]
impl JobStore for MemoryBackend {
    async fn create(
        &self,
        id: &str,
        filename: &str,
        params: &JobParams,
    ) -> Result<Job, StoreError> {
        self.check_available()?;
        let job = Job::new(id, filename, params.clone());
        let pairs = job.to_fields()?;

        let mut state = self.inner.state.lock().await;
        if state.jobs.contains_key(id) {
            return Err(StoreError::DuplicateJob(id.to_string()));
        }
        let mut fields = Fields::new();
        apply(&mut fields, pairs);
        state.jobs.insert(id.to_string(), fields);
        Ok(job)
    }

    async fn get(&self, id: &str) -> Result<Option<Job>, StoreError> {
        self.check_available()?;
        let state = self.inner.state.lock().await;
        match state.jobs.get(id) {
            None => Ok(None),
            Some(fields) => Job::from_fields(id, fields)
                .map(Some)
                .map_err(|reason| StoreError::CorruptJobData {
                    id: id.to_string(),
                    reason,
                }),
        }
    }

    async fn update(&self, id: &str, update: &JobUpdate) -> Result<(), StoreError> {
        self.check_available()?;
        let pairs = update.to_fields()?;

        let mut state = self.inner.state.lock().await;
        let fields = state
            .jobs
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        apply(fields, pairs);
        Ok(())
    }

    async fn transition(
        &self,
        id: &str,
        expected: JobStatus,
        update: &JobUpdate,
    ) -> Result<bool, StoreError> {
        self.check_available()?;
        let pairs = update.to_fields()?;

        let mut state = self.inner.state.lock().await;
        match state.jobs.get_mut(id) {
            Some(fields)
                if fields.get(FIELD_STATUS).map(String::as_str) == Some(expected.as_str()) =>
            {
                apply(fields, pairs);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete(&self, id: &str) -> Result<bool, StoreError> {
        self.check_available()?;
        let mut state = self.inner.state.lock().await;
        state.pending.retain(|queued| queued != id);
        Ok(state.jobs.remove(id).is_some())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.check_available()
    }
}

#[async_trait]
impl WorkQueue for MemoryBackend {
    async fn enqueue(&self, id: &str) -> Result<(), StoreError> {
        self.check_available()?;
        self.inner
            .state
            .lock()
            .await
            .pending
            .push_front(id.to_string());
        self.inner.enqueued.notify_waiters();
        Ok(())
    }

    async fn dequeue(
        &self,
        worker_id: &str,
        timeout: Duration,
    ) -> Result<Option<String>, StoreError> {
        let deadline = Instant::now() + timeout;

        loop {
            // Register interest before checking, so an enqueue between the
            // check and the wait is not missed.
            let notified = self.inner.enqueued.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            self.check_available()?;
            {
                let mut state = self.inner.state.lock().await;
                if let Some(id) = state.pending.pop_back() {
                    state
                        .in_flight
                        .entry(worker_id.to_string())
                        .or_default()
                        .push(id.clone());
                    return Ok(Some(id));
                }
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn ack(&self, worker_id: &str, id: &str) -> Result<(), StoreError> {
        self.check_available()?;
        let mut state = self.inner.state.lock().await;
        if let Some(list) = state.in_flight.get_mut(worker_id) {
            list.retain(|held| held != id);
        }
        Ok(())
    }

    async fn release(&self, worker_id: &str, id: &str) -> Result<(), StoreError> {
        self.check_available()?;
        {
            let mut state = self.inner.state.lock().await;
            if let Some(list) = state.in_flight.get_mut(worker_id) {
                if let Some(pos) = list.iter().position(|held| held == id) {
                    list.remove(pos);
                }
            }
            state.pending.push_back(id.to_string());
        }
        self.inner.enqueued.notify_waiters();
        Ok(())
    }

    async fn in_flight(&self, worker_id: &str) -> Result<Vec<String>, StoreError> {
        self.check_available()?;
        let state = self.inner.state.lock().await;
        Ok(state.in_flight.get(worker_id).cloned().unwrap_or_default())
    }

    async fn dead_letter(&self, id: &str) -> Result<(), StoreError> {
        self.check_available()?;
        self.inner
            .state
            .lock()
            .await
            .dead_letters
            .push_front(id.to_string());
        Ok(())
    }

    async fn dead_letters(&self, limit: usize) -> Result<Vec<String>, StoreError> {
        self.check_available()?;
        let state = self.inner.state.lock().await;
        Ok(state.dead_letters.iter().take(limit).cloned().collect())
    }

    async fn requeue_failed(
        &self,
        id: &str,
        policy: &RetryPolicy,
        cause: &str,
    ) -> Result<RetryOutcome, StoreError> {
        self.check_available()?;

        let outcome = {
            let mut state = self.inner.state.lock().await;
            let State {
                jobs,
                pending,
                dead_letters,
                ..
            } = &mut *state;

            let fields = match jobs.get_mut(id) {
                Some(fields) => fields,
                None => return Ok(RetryOutcome::Skipped),
            };
            let failed = fields.get(FIELD_STATUS).map(String::as_str) == Some("failed");
            let dead = fields.get(FIELD_DEAD_LETTERED).map(String::as_str) == Some("1");
            if !failed || dead {
                return Ok(RetryOutcome::Skipped);
            }

            let retries = fields
                .get(FIELD_RETRY_COUNT)
                .and_then(|raw| raw.parse::<u32>().ok())
                .unwrap_or(0);

            match policy.decide(retries) {
                RetryDecision::Retry { next_retry } => {
                    let transition = next(
                        JobState::Failed,
                        JobEvent::Retry {
                            retry_count: retries,
                            max_retries: policy.max_retries(),
                            message: policy.requeue_message(cause),
                        },
                    )
                    .map_err(|e| StoreError::CorruptJobData {
                        id: id.to_string(),
                        reason: e.to_string(),
                    })?;
                    apply(fields, transition.update.to_fields()?);
                    pending.push_front(id.to_string());
                    RetryOutcome::Requeued {
                        retry_count: next_retry,
                    }
                }
                RetryDecision::DeadLetter => {
                    let transition = next(
                        JobState::Failed,
                        JobEvent::DeadLetter {
                            retry_count: retries,
                            max_retries: policy.max_retries(),
                            message: policy.dead_letter_message(cause),
                        },
                    )
                    .map_err(|e| StoreError::CorruptJobData {
                        id: id.to_string(),
                        reason: e.to_string(),
                    })?;
                    apply(fields, transition.update.to_fields()?);
                    fields.insert(FIELD_DEAD_LETTERED.to_string(), "1".to_string());
                    dead_letters.push_front(id.to_string());
                    RetryOutcome::DeadLettered {
                        retry_count: retries,
                    }
                }
            }
        };

        if matches!(outcome, RetryOutcome::Requeued { .. }) {
            self.inner.enqueued.notify_waiters();
        }
        Ok(outcome)
    }

    async fn stats(&self) -> Result<QueueStats, StoreError> {
        self.check_available()?;
        let state = self.inner.state.lock().await;
        Ok(QueueStats {
            queue_name: DEFAULT_QUEUE_NAME.to_string(),
            pending_jobs: state.pending.len(),
            dead_letter_jobs: state.dead_letters.len(),
        })
    }
}
