//! Integration tests against a live Redis server.
//!
//! Run with `REDIS_URL=redis://127.0.0.1:6379/0 cargo test -- --ignored`.

use std::time::Duration;

use stem_forge::jobs::{JobParams, JobStatus, JobUpdate};
use stem_forge::scheduler::{RetryOutcome, RetryPolicy};
use stem_forge::store::{JobStore, RedisBackend, WorkQueue};

async fn backend() -> RedisBackend {
    let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379/0".into());
    let queue = format!("test_queue_{}", uuid::Uuid::new_v4());
    RedisBackend::connect(&url, &queue)
        .await
        .expect("redis not reachable")
}

fn job_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[tokio::test]
#[ignore]
async fn test_create_get_and_duplicate() {
    let redis = backend().await;
    let id = job_id();
    let params = JobParams::default().with_shifts(2);

    let created = redis.create(&id, "song.mp3", &params).await.unwrap();
    assert_eq!(created.status, JobStatus::Queued);
    assert!(redis.create(&id, "song.mp3", &params).await.is_err());

    let job = redis.get(&id).await.unwrap().unwrap();
    assert_eq!(job.filename, "song.mp3");
    assert_eq!(job.params.shifts, 2);
    assert_eq!(job.retry_count, 0);

    assert!(redis.delete(&id).await.unwrap());
    assert!(redis.get(&id).await.unwrap().is_none());
    assert!(!redis.delete(&id).await.unwrap());
}

#[tokio::test]
#[ignore]
async fn test_transition_is_conditional() {
    let redis = backend().await;
    let id = job_id();
    redis
        .create(&id, "song.wav", &JobParams::default())
        .await
        .unwrap();

    let claim = JobUpdate::new().status(JobStatus::Processing).progress(10.0);
    assert!(redis.transition(&id, JobStatus::Queued, &claim).await.unwrap());
    assert!(!redis.transition(&id, JobStatus::Queued, &claim).await.unwrap());

    let job = redis.get(&id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Processing);
    assert_eq!(job.progress, 10.0);

    redis.delete(&id).await.unwrap();
}

#[tokio::test]
#[ignore]
async fn test_update_does_not_recreate_deleted_job() {
    let redis = backend().await;
    let id = job_id();
    redis
        .create(&id, "song.wav", &JobParams::default())
        .await
        .unwrap();
    redis.delete(&id).await.unwrap();

    let _ = redis
        .update(&id, &JobUpdate::new().progress(50.0))
        .await;
    assert!(redis.get(&id).await.unwrap().is_none());
}

#[tokio::test]
#[ignore]
async fn test_queue_claim_ack_and_release() {
    let redis = backend().await;
    let first = job_id();
    let second = job_id();
    redis.enqueue(&first).await.unwrap();
    redis.enqueue(&second).await.unwrap();

    let timeout = Duration::from_secs(1);
    let popped = redis.dequeue("w1", timeout).await.unwrap();
    assert_eq!(popped.as_deref(), Some(first.as_str()));
    assert_eq!(redis.in_flight("w1").await.unwrap(), vec![first.clone()]);

    redis.release("w1", &first).await.unwrap();
    assert!(redis.in_flight("w1").await.unwrap().is_empty());

    let again = redis.dequeue("w1", timeout).await.unwrap();
    assert_eq!(again.as_deref(), Some(first.as_str()));
    redis.ack("w1", &first).await.unwrap();

    let next = redis.dequeue("w2", timeout).await.unwrap();
    assert_eq!(next.as_deref(), Some(second.as_str()));
    redis.ack("w2", &second).await.unwrap();

    assert!(redis.dequeue("w1", timeout).await.unwrap().is_none());
    assert_eq!(redis.stats().await.unwrap().pending_jobs, 0);
}

#[tokio::test]
#[ignore]
async fn test_requeue_failed_until_dead_letter() {
    let redis = backend().await;
    let id = job_id();
    redis
        .create(&id, "song.wav", &JobParams::default())
        .await
        .unwrap();
    let policy = RetryPolicy::new(1);
    let failed = JobUpdate::new()
        .status(JobStatus::Failed)
        .message("engine crashed");

    redis.update(&id, &failed).await.unwrap();
    let first = redis.requeue_failed(&id, &policy, "engine crashed").await.unwrap();
    assert!(matches!(first, RetryOutcome::Requeued { retry_count: 1 }));
    assert_eq!(redis.stats().await.unwrap().pending_jobs, 1);
    assert_eq!(redis.get(&id).await.unwrap().unwrap().status, JobStatus::Queued);

    let popped = redis.dequeue("w1", Duration::from_secs(1)).await.unwrap();
    assert_eq!(popped.as_deref(), Some(id.as_str()));
    redis.ack("w1", &id).await.unwrap();

    redis.update(&id, &failed).await.unwrap();
    let second = redis.requeue_failed(&id, &policy, "engine crashed").await.unwrap();
    assert!(matches!(second, RetryOutcome::DeadLettered { .. }));

    let job = redis.get(&id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.dead_lettered);
    assert_eq!(redis.dead_letters(10).await.unwrap(), vec![id.clone()]);

    let stats = redis.stats().await.unwrap();
    assert_eq!(stats.pending_jobs, 0);
    assert_eq!(stats.dead_letter_jobs, 1);

    redis.delete(&id).await.unwrap();
}
