//! Redis-backed job store and work queue.
//!
//! Each job is a hash at `job:{id}`. The pending list is consumed from the
//! right with BRPOPLPUSH into a per-worker in-flight list, so a job that was
//! dequeued by a worker that then crashed can be found again on restart.
//!
//! A blocking BRPOPLPUSH occupies the multiplexed connection for its whole
//! wait, so every worker should own its own [`RedisBackend`].

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use tracing::{info, warn};

use super::{
    in_flight_key, job_key, JobStore, QueueStats, WorkQueue, DEFAULT_DEAD_LETTER_NAME,
    DEFAULT_QUEUE_NAME,
};
use crate::error::StoreError;
use crate::jobs::job::FIELD_STATUS;
use crate::jobs::{Job, JobParams, JobStatus, JobUpdate};
use crate::scheduler::retry::{RetryOutcome, RetryPolicy};

/// HSET the given pairs only if the hash does not exist yet.
const CREATE_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 1 then
    return 0
end
redis.call('HSET', KEYS[1], unpack(ARGV))
return 1
"#;

/// HSET the given pairs only if the hash exists.
const UPDATE_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then
    return 0
end
redis.call('HSET', KEYS[1], unpack(ARGV))
return 1
"#;

/// HSET ARGV[2..] only if the stored status equals ARGV[1].
const TRANSITION_SCRIPT: &str = r#"
if redis.call('HGET', KEYS[1], ARGV[1]) ~= ARGV[2] then
    return 0
end
redis.call('HSET', KEYS[1], unpack(ARGV, 3))
return 1
"#;

/// Requeue or dead-letter a failed job.
///
/// Returns `{code, retry_count}` where code is 0 (skipped), 1 (requeued) or
/// 2 (dead-lettered).
const REQUEUE_FAILED_SCRIPT: &str = r#"
if redis.call('HGET', KEYS[1], 'status') ~= 'failed' then
    return {0, 0}
end
if redis.call('HGET', KEYS[1], 'dead_lettered') == '1' then
    return {0, 0}
end
local retries = tonumber(redis.call('HGET', KEYS[1], 'retry_count') or '0') or 0
if retries < tonumber(ARGV[2]) then
    retries = retries + 1
    redis.call('HSET', KEYS[1],
        'status', 'queued',
        'progress', '0',
        'message', ARGV[3],
        'retry_count', tostring(retries),
        'updated_at', ARGV[5])
    redis.call('LPUSH', KEYS[2], ARGV[1])
    return {1, retries}
end
redis.call('HSET', KEYS[1],
    'dead_lettered', '1',
    'progress', '0',
    'message', ARGV[4],
    'updated_at', ARGV[5])
redis.call('LPUSH', KEYS[3], ARGV[1])
return {2, retries}
"#;

/// Job store and queue on a single Redis connection manager.
#[derive(Clone)]
pub struct RedisBackend {
    redis: ConnectionManager,
    queue_name: String,
    dead_letter_queue: String,
}

impl RedisBackend {
    /// Connects to Redis.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Unavailable` if the server cannot be reached.
    pub async fn connect(redis_url: &str, queue_name: &str) -> Result<Self, StoreError> {
        let client =
            redis::Client::open(redis_url).map_err(|e| StoreError::Unavailable(e.to_string()))?;

        let redis = ConnectionManager::new(client)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        Ok(Self::from_connection(redis, queue_name))
    }

    /// Connects to Redis, retrying with a fixed delay between attempts.
    pub async fn connect_with_retry(
        redis_url: &str,
        queue_name: &str,
        attempts: u32,
        delay: Duration,
    ) -> Result<Self, StoreError> {
        let attempts = attempts.max(1);
        let mut attempt = 1;
        loop {
            match Self::connect(redis_url, queue_name).await {
                Ok(backend) => {
                    info!(attempt, "Connected to Redis");
                    return Ok(backend);
                }
                Err(e) if attempt < attempts => {
                    warn!(
                        attempt,
                        max_attempts = attempts,
                        error = %e,
                        "Redis connection failed, retrying in {:?}",
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Wraps an existing connection manager.
    pub fn from_connection(redis: ConnectionManager, queue_name: &str) -> Self {
        let dead_letter_queue = if queue_name == DEFAULT_QUEUE_NAME {
            DEFAULT_DEAD_LETTER_NAME.to_string()
        } else {
            format!("{}:dead_letter", queue_name)
        };
        Self {
            redis,
            queue_name: queue_name.to_string(),
            dead_letter_queue,
        }
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    pub fn dead_letter_queue(&self) -> &str {
        &self.dead_letter_queue
    }

    fn in_flight_queue(&self, worker_id: &str) -> String {
        in_flight_key(&self.queue_name, worker_id)
    }
}

fn flatten(fields: Vec<(&'static str, String)>) -> Vec<String> {
    fields
        .into_iter()
        .flat_map(|(k, v)| [k.to_string(), v])
        .collect()
}

#[async_trait]
impl JobStore for RedisBackend {
    async fn create(
        &self,
        id: &str,
        filename: &str,
        params: &JobParams,
    ) -> Result<Job, StoreError> {
        let job = Job::new(id, filename, params.clone());
        let args = flatten(job.to_fields()?);

        let mut conn = self.redis.clone();
        let created: i64 = Script::new(CREATE_SCRIPT)
            .key(job_key(id))
            .arg(args)
            .invoke_async(&mut conn)
            .await?;

        if created == 0 {
            return Err(StoreError::DuplicateJob(id.to_string()));
        }
        Ok(job)
    }

    async fn get(&self, id: &str) -> Result<Option<Job>, StoreError> {
        let mut conn = self.redis.clone();
        let fields: HashMap<String, String> = conn.hgetall(job_key(id)).await?;

        if fields.is_empty() {
            return Ok(None);
        }

        Job::from_fields(id, &fields)
            .map(Some)
            .map_err(|reason| StoreError::CorruptJobData {
                id: id.to_string(),
                reason,
            })
    }

    async fn update(&self, id: &str, update: &JobUpdate) -> Result<(), StoreError> {
        let args = flatten(update.to_fields()?);

        let mut conn = self.redis.clone();
        let updated: i64 = Script::new(UPDATE_SCRIPT)
            .key(job_key(id))
            .arg(args)
            .invoke_async(&mut conn)
            .await?;

        if updated == 0 {
            return Err(StoreError::NotFound(id.to_string()));
        }
        Ok(())
    }

    async fn transition(
        &self,
        id: &str,
        expected: JobStatus,
        update: &JobUpdate,
    ) -> Result<bool, StoreError> {
        let args = flatten(update.to_fields()?);

        let mut conn = self.redis.clone();
        let applied: i64 = Script::new(TRANSITION_SCRIPT)
            .key(job_key(id))
            .arg(FIELD_STATUS)
            .arg(expected.as_str())
            .arg(args)
            .invoke_async(&mut conn)
            .await?;

        Ok(applied == 1)
    }

    async fn delete(&self, id: &str) -> Result<bool, StoreError> {
        let mut conn = self.redis.clone();

        let mut pipe = redis::pipe();
        pipe.atomic()
            .del(job_key(id))
            .lrem(&self.queue_name, 0, id);
        let (deleted, _removed): (i64, i64) = pipe.query_async(&mut conn).await?;

        Ok(deleted > 0)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();
        redis::cmd("PING")
            .query_async::<_, String>(&mut conn)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl WorkQueue for RedisBackend {
    async fn enqueue(&self, id: &str) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();
        conn.lpush::<_, _, ()>(&self.queue_name, id).await?;
        Ok(())
    }

    async fn dequeue(
        &self,
        worker_id: &str,
        timeout: Duration,
    ) -> Result<Option<String>, StoreError> {
        let mut conn = self.redis.clone();
        let timeout_secs = timeout.as_secs().max(1) as usize;

        let id: Option<String> = redis::cmd("BRPOPLPUSH")
            .arg(&self.queue_name)
            .arg(self.in_flight_queue(worker_id))
            .arg(timeout_secs)
            .query_async(&mut conn)
            .await?;

        Ok(id)
    }

    async fn ack(&self, worker_id: &str, id: &str) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();
        conn.lrem::<_, _, ()>(self.in_flight_queue(worker_id), 0, id)
            .await?;
        Ok(())
    }

    async fn release(&self, worker_id: &str, id: &str) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();

        // RPUSH puts it back at the consuming end
        let mut pipe = redis::pipe();
        pipe.atomic()
            .lrem(self.in_flight_queue(worker_id), 1, id)
            .rpush(&self.queue_name, id);
        pipe.query_async::<_, ()>(&mut conn).await?;

        Ok(())
    }

    async fn in_flight(&self, worker_id: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.redis.clone();
        let ids: Vec<String> = conn.lrange(self.in_flight_queue(worker_id), 0, -1).await?;
        Ok(ids)
    }

    async fn dead_letter(&self, id: &str) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();
        conn.lpush::<_, _, ()>(&self.dead_letter_queue, id).await?;
        Ok(())
    }

    async fn dead_letters(&self, limit: usize) -> Result<Vec<String>, StoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.redis.clone();
        let ids: Vec<String> = conn
            .lrange(&self.dead_letter_queue, 0, limit as isize - 1)
            .await?;
        Ok(ids)
    }

    async fn requeue_failed(
        &self,
        id: &str,
        policy: &RetryPolicy,
        cause: &str,
    ) -> Result<RetryOutcome, StoreError> {
        let mut conn = self.redis.clone();
        let (code, retry_count): (i64, i64) = Script::new(REQUEUE_FAILED_SCRIPT)
            .key(job_key(id))
            .key(&self.queue_name)
            .key(&self.dead_letter_queue)
            .arg(id)
            .arg(policy.max_retries())
            .arg(policy.requeue_message(cause))
            .arg(policy.dead_letter_message(cause))
            .arg(Utc::now().to_rfc3339())
            .invoke_async(&mut conn)
            .await?;

        let retry_count = retry_count.max(0) as u32;
        Ok(match code {
            1 => RetryOutcome::Requeued { retry_count },
            2 => RetryOutcome::DeadLettered { retry_count },
            _ => RetryOutcome::Skipped,
        })
    }

    async fn stats(&self) -> Result<QueueStats, StoreError> {
        let mut pending_conn = self.redis.clone();
        let mut dead_conn = self.redis.clone();

        let (pending_jobs, dead_letter_jobs): (usize, usize) = tokio::try_join!(
            pending_conn.llen::<_, usize>(&self.queue_name),
            dead_conn.llen::<_, usize>(&self.dead_letter_queue),
        )?;

        Ok(QueueStats {
            queue_name: self.queue_name.clone(),
            pending_jobs,
            dead_letter_jobs,
        })
    }
}
