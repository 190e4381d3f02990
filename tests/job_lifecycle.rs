//! End-to-end job lifecycle scenarios against the in-memory backend.

mod common;

use std::time::Duration;

use common::{Harness, Script};
use stem_forge::jobs::{JobParams, JobStatus, JobUpdate};
use stem_forge::scheduler::CRASH_RECOVERY_MESSAGE;
use stem_forge::store::{JobStore, WorkQueue};
use stem_forge::ServiceError;

const FOUR_STEMS: [&str; 4] = ["drums", "bass", "other", "vocals"];
const SETTLE: Duration = Duration::from_secs(5);

#[tokio::test]
async fn test_submitted_job_completes_with_stems() {
    let h = Harness::new(Script::Succeed(FOUR_STEMS.to_vec()));
    let id = h.submit("song.mp3").await;
    let worker = h.spawn_worker("w1", 3);

    let job = h
        .wait_for(&id, SETTLE, |j| j.status == JobStatus::Completed)
        .await;
    h.stop(vec![worker]).await;

    assert_eq!(job.progress, 100.0);
    assert_eq!(job.stems, FOUR_STEMS.to_vec());
    assert_eq!(job.retry_count, 0);

    let view = h.service.status(&id).await.unwrap();
    assert_eq!(view.stems.unwrap().len(), 4);

    let vocals = h.service.stem_path(&id, "vocals").await.unwrap();
    assert_eq!(vocals, h.output_dir().join(&id).join("vocals.wav"));
    assert!(vocals.is_file());

    // Input is removed once the stems are in place
    assert_eq!(std::fs::read_dir(h.upload_dir()).unwrap().count(), 0);
}

#[tokio::test]
async fn test_engine_fails_twice_then_succeeds() {
    let h = Harness::new(Script::FailFirst(2, FOUR_STEMS.to_vec()));
    let id = h.submit("j1.wav").await;
    let worker = h.spawn_worker("w1", 2);

    let job = h
        .wait_for(&id, SETTLE, |j| j.status == JobStatus::Completed)
        .await;
    h.stop(vec![worker]).await;

    assert_eq!(job.retry_count, 2);
    assert_eq!(job.stems.len(), 4);
    assert_eq!(h.engine.calls(), 3);
}

#[tokio::test]
async fn test_always_failing_engine_is_dead_lettered() {
    let max_retries = 2;
    let h = Harness::new(Script::AlwaysFail);
    let id = h.submit("song.flac").await;
    let worker = h.spawn_worker("w1", max_retries);

    let job = h.wait_for(&id, SETTLE, |j| j.dead_lettered).await;
    h.stop(vec![worker]).await;

    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.retry_count, max_retries);
    assert_eq!(h.engine.calls(), max_retries + 1);
    assert!(job.message.starts_with("Max retries (2) exceeded"));
    assert!(job.message.contains("CUDA out of memory"));
    assert!(job.stems.is_empty());

    let letters = h.service.dead_letters(10).await.unwrap();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].job_id, id);
    assert!(h.backend.pending().await.is_empty());

    // Input is kept for inspection
    assert_eq!(std::fs::read_dir(h.upload_dir()).unwrap().count(), 1);
    assert!(!h.output_dir().join(&id).exists());
}

#[tokio::test]
async fn test_timeout_fails_without_retry() {
    let h = Harness::new(Script::Sleep(Duration::from_secs(30)))
        .with_job_timeout(Duration::from_millis(200));
    let id = h.submit("long.wav").await;
    let worker = h.spawn_worker("w1", 3);

    let job = h
        .wait_for(&id, SETTLE, |j| j.status == JobStatus::Failed)
        .await;

    // Give a wrongly requeued job the chance to be picked up again
    tokio::time::sleep(Duration::from_millis(300)).await;
    h.stop(vec![worker]).await;

    assert_eq!(job.message, "Job timeout after 0.2 seconds");
    assert_eq!(job.retry_count, 0);
    assert!(!job.dead_lettered);
    assert_eq!(h.job(&id).await.status, JobStatus::Failed);
    assert_eq!(h.engine.calls(), 1);
    assert!(h.backend.pending().await.is_empty());
    assert!(!h.output_dir().join(&id).exists());
}

#[tokio::test]
async fn test_missing_input_fails_immediately() {
    let h = Harness::new(Script::Succeed(FOUR_STEMS.to_vec()));
    h.backend
        .create("j3", "gone.mp3", &JobParams::default())
        .await
        .unwrap();
    h.backend.enqueue("j3").await.unwrap();
    let worker = h.spawn_worker("w1", 3);

    let job = h
        .wait_for("j3", SETTLE, |j| j.status == JobStatus::Failed)
        .await;
    h.stop(vec![worker]).await;

    assert!(job.message.contains("Input file not found"));
    assert_eq!(job.retry_count, 0);
    assert_eq!(h.engine.calls(), 0);
    assert!(h.backend.pending().await.is_empty());
}

#[tokio::test]
async fn test_shutdown_interrupts_running_job() {
    let h = Harness::new(Script::Sleep(Duration::from_secs(30)));
    let running = h.submit("a.wav").await;
    let worker = h.spawn_worker("w1", 3);

    h.wait_for(&running, SETTLE, |j| j.status == JobStatus::Processing)
        .await;
    let waiting = h.submit("b.wav").await;

    h.stop(vec![worker]).await;

    let job = h.job(&running).await;
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.message, "Worker shutdown during processing");
    assert_eq!(job.retry_count, 0);

    // The worker claimed nothing after the signal
    assert_eq!(h.job(&waiting).await.status, JobStatus::Queued);
    assert_eq!(h.backend.pending().await, vec![waiting]);
    assert!(h.backend.in_flight("w1").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_racing_workers_never_share_a_job() {
    let h = Harness::new(Script::Succeed(vec!["vocals"]));
    let mut ids = Vec::new();
    for i in 0..24 {
        ids.push(h.submit(&format!("track{}.mp3", i)).await);
    }

    let workers: Vec<_> = (0..4)
        .map(|i| h.spawn_worker(&format!("w{}", i), 3))
        .collect();
    for id in &ids {
        h.wait_for(id, SETTLE, |j| j.status == JobStatus::Completed)
            .await;
    }
    h.stop(workers).await;

    let mut seen = h.engine.seen();
    assert_eq!(seen.len(), ids.len());
    seen.sort();
    seen.dedup();
    assert_eq!(seen.len(), ids.len());
}

#[tokio::test]
async fn test_jobs_are_processed_in_submission_order() {
    let h = Harness::new(Script::Succeed(vec!["vocals"]));
    let first = h.submit("first.wav").await;
    let second = h.submit("second.wav").await;
    let worker = h.spawn_worker("w1", 3);

    h.wait_for(&second, SETTLE, |j| j.status == JobStatus::Completed)
        .await;
    h.stop(vec![worker]).await;

    assert_eq!(h.engine.seen(), vec![first, second]);
}

#[tokio::test]
async fn test_deleted_job_is_gone() {
    let h = Harness::new(Script::Succeed(FOUR_STEMS.to_vec()));
    let id = h.submit("song.mp3").await;
    let worker = h.spawn_worker("w1", 3);
    h.wait_for(&id, SETTLE, |j| j.status == JobStatus::Completed)
        .await;
    h.stop(vec![worker]).await;

    h.service.delete(&id).await.unwrap();

    assert!(matches!(
        h.service.status(&id).await,
        Err(ServiceError::JobNotFound(_))
    ));
    assert!(matches!(
        h.service.stem_path(&id, "vocals").await,
        Err(ServiceError::JobNotFound(_))
    ));
    assert!(!h.output_dir().join(&id).exists());
}

#[tokio::test]
async fn test_restarted_worker_recovers_in_flight_job() {
    let h = Harness::new(Script::Succeed(vec!["vocals"]));
    let id = h.submit("song.wav").await;

    // A previous run of w1 claimed the job and died
    let popped = h
        .backend
        .dequeue("w1", Duration::from_millis(10))
        .await
        .unwrap();
    assert_eq!(popped.as_deref(), Some(id.as_str()));
    h.backend
        .transition(
            &id,
            JobStatus::Queued,
            &JobUpdate::new().status(JobStatus::Processing).progress(40.0),
        )
        .await
        .unwrap();

    let worker = h.spawn_worker("w1", 3);
    let job = h
        .wait_for(&id, SETTLE, |j| j.status == JobStatus::Completed)
        .await;
    h.stop(vec![worker]).await;

    assert_eq!(job.retry_count, 1);
    assert_eq!(h.engine.calls(), 1);
    assert!(h.backend.in_flight("w1").await.unwrap().is_empty());
    assert!(!CRASH_RECOVERY_MESSAGE.is_empty());
}

#[tokio::test]
async fn test_worker_survives_store_outage() {
    let h = Harness::new(Script::Succeed(vec!["vocals"]));
    let worker = h.spawn_worker("w1", 3);

    h.backend.set_available(false);
    tokio::time::sleep(Duration::from_millis(150)).await;
    h.backend.set_available(true);

    let id = h.submit("after.wav").await;
    h.wait_for(&id, SETTLE, |j| j.status == JobStatus::Completed)
        .await;
    h.stop(vec![worker]).await;
}

#[tokio::test]
async fn test_timeout_during_store_outage_is_not_retried() {
    let h = Harness::new(Script::Sleep(Duration::from_secs(30)))
        .with_job_timeout(Duration::from_millis(300));
    let id = h.submit("long.wav").await;
    let worker = h.spawn_worker("w1", 3);

    h.wait_for(&id, SETTLE, |j| j.status == JobStatus::Processing)
        .await;
    tokio::time::sleep(Duration::from_millis(150)).await;
    h.backend.set_available(false);
    // The deadline passes while the store is down
    tokio::time::sleep(Duration::from_millis(400)).await;
    h.backend.set_available(true);

    let job = h
        .wait_for(&id, SETTLE, |j| j.status == JobStatus::Failed)
        .await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    h.stop(vec![worker]).await;

    assert_eq!(job.message, "Job timeout after 0.3 seconds");
    assert_eq!(job.retry_count, 0);
    assert_eq!(h.job(&id).await.status, JobStatus::Failed);
    assert_eq!(h.engine.calls(), 1);
    assert!(h.backend.pending().await.is_empty());
    assert!(h.backend.in_flight("w1").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_worker_gives_up_when_store_stays_down() {
    let h = Harness::new(Script::Succeed(vec!["vocals"]));
    let config = h
        .worker_config("w1")
        .with_reconnect(Duration::from_millis(10), 3);
    let worker = stem_forge::scheduler::Worker::new(
        config,
        std::sync::Arc::new(h.backend.clone()),
        std::sync::Arc::clone(&h.adapter),
        stem_forge::scheduler::RetryPolicy::default(),
        h.coordinator.signal(),
    );

    h.backend.set_available(false);
    let result = tokio::time::timeout(Duration::from_secs(5), worker.run())
        .await
        .expect("worker kept waiting");
    assert!(matches!(result, Err(stem_forge::StoreError::Unavailable(_))));
}
