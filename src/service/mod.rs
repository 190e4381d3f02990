//! Front-side job operations: submit, status, download, delete and health.
//!
//! [`JobService`] is what an HTTP layer or the CLI talks to. It never runs
//! separation itself; it writes inputs, creates queued jobs and reads back
//! what workers produced. Errors carry an HTTP-like class through
//! [`ServiceError::status_code`].

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::StemConfig;
use crate::error::{ServiceError, StoreError};
use crate::jobs::{JobParams, JobStatus, JobView};
use crate::processing::is_valid_stem_name;
use crate::store::{Backend, QueueStats};

/// Accepted input extensions, compared case-insensitively.
pub const SUPPORTED_EXTENSIONS: [&str; 5] = ["mp3", "wav", "flac", "m4a", "ogg"];

/// Returns whether `filename` has a supported audio extension.
pub fn is_supported_file(filename: &str) -> bool {
    Path::new(filename)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            SUPPORTED_EXTENSIONS
                .iter()
                .any(|supported| ext.eq_ignore_ascii_case(supported))
        })
        .unwrap_or(false)
}

/// Result of a health check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub redis: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.error.is_none()
    }
}

/// A dead-lettered job as listed for operators.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeadLetter {
    pub job_id: String,
    /// `None` when the record has since been deleted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Job operations backed by the shared store.
#[derive(Clone)]
pub struct JobService {
    backend: Arc<dyn Backend>,
    upload_dir: PathBuf,
    output_dir: PathBuf,
}

impl JobService {
    pub fn new(
        backend: Arc<dyn Backend>,
        upload_dir: impl Into<PathBuf>,
        output_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            backend,
            upload_dir: upload_dir.into(),
            output_dir: output_dir.into(),
        }
    }

    pub fn from_config(backend: Arc<dyn Backend>, config: &StemConfig) -> Self {
        Self::new(backend, &config.upload_dir, &config.output_dir)
    }

    /// Submits the audio file at `path`.
    pub async fn submit_file(&self, path: &Path, params: JobParams) -> Result<String, ServiceError> {
        let filename = path
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| ServiceError::UnsupportedFormat(path.display().to_string()))?;
        let data = tokio::fs::read(path).await?;
        self.submit_bytes(filename, &data, params).await
    }

    /// Stores `data` as the input of a new job and queues it.
    ///
    /// Returns the new job id. The extension and parameters are checked
    /// before anything is written.
    pub async fn submit_bytes(
        &self,
        filename: &str,
        data: &[u8],
        params: JobParams,
    ) -> Result<String, ServiceError> {
        // Drop any directory part the client sent along
        let filename = Path::new(filename)
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or_default()
            .to_string();
        if !is_supported_file(&filename) {
            return Err(ServiceError::UnsupportedFormat(filename));
        }
        params.validate()?;

        let job_id = Uuid::new_v4().to_string();
        tokio::fs::create_dir_all(&self.upload_dir).await?;
        let input = self.upload_dir.join(format!("{}_{}", job_id, filename));
        tokio::fs::write(&input, data).await?;

        if let Err(e) = self.backend.create(&job_id, &filename, &params).await {
            remove_file_quietly(&input).await;
            return Err(e.into());
        }
        if let Err(e) = self.backend.enqueue(&job_id).await {
            if let Err(cleanup) = self.backend.delete(&job_id).await {
                warn!(job_id = %job_id, error = %cleanup, "Failed to remove unqueued job");
            }
            remove_file_quietly(&input).await;
            return Err(e.into());
        }

        info!(
            job_id = %job_id,
            filename = %filename,
            model = %params.model,
            bytes = data.len(),
            "Job submitted"
        );
        Ok(job_id)
    }

    /// Current status of a job.
    pub async fn status(&self, job_id: &str) -> Result<JobView, ServiceError> {
        match self.backend.get(job_id).await? {
            Some(job) => Ok(job.view()),
            None => Err(ServiceError::JobNotFound(job_id.to_string())),
        }
    }

    /// Path of a stem produced by a completed job.
    pub async fn stem_path(&self, job_id: &str, stem: &str) -> Result<PathBuf, ServiceError> {
        let job = self
            .backend
            .get(job_id)
            .await?
            .ok_or_else(|| ServiceError::JobNotFound(job_id.to_string()))?;

        if job.status != JobStatus::Completed {
            return Err(ServiceError::NotCompleted {
                id: job_id.to_string(),
                status: job.status.to_string(),
            });
        }
        if !is_valid_stem_name(stem) {
            return Err(ServiceError::InvalidStemName(stem.to_string()));
        }

        let path = self.output_dir.join(job_id).join(format!("{}.wav", stem));
        if tokio::fs::metadata(&path).await.map(|m| m.is_file()).unwrap_or(false) {
            Ok(path)
        } else {
            Err(ServiceError::StemNotFound {
                id: job_id.to_string(),
                stem: stem.to_string(),
            })
        }
    }

    /// Deletes a job's record, uploaded input and stems.
    pub async fn delete(&self, job_id: &str) -> Result<(), ServiceError> {
        if !self.backend.delete(job_id).await? {
            return Err(ServiceError::JobNotFound(job_id.to_string()));
        }

        let prefix = format!("{}_", job_id);
        match tokio::fs::read_dir(&self.upload_dir).await {
            Ok(mut entries) => {
                while let Some(entry) = entries.next_entry().await? {
                    if entry.file_name().to_string_lossy().starts_with(&prefix) {
                        remove_file_quietly(&entry.path()).await;
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        match tokio::fs::remove_dir_all(self.output_dir.join(job_id)).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        info!(job_id = %job_id, "Job deleted");
        Ok(())
    }

    /// Reports whether the backing store answers.
    pub async fn health(&self) -> HealthReport {
        match self.backend.ping().await {
            Ok(()) => HealthReport {
                status: "healthy",
                redis: "connected",
                error: None,
            },
            Err(e) => HealthReport {
                status: "unhealthy",
                redis: "disconnected",
                error: Some(e.to_string()),
            },
        }
    }

    /// Most recent dead-lettered jobs, newest first.
    pub async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetter>, ServiceError> {
        let ids = self.backend.dead_letters(limit).await?;
        let mut letters = Vec::with_capacity(ids.len());

        for job_id in ids {
            let job = match self.backend.get(&job_id).await {
                Ok(job) => job,
                Err(StoreError::CorruptJobData { reason, .. }) => {
                    debug!(job_id = %job_id, reason = %reason, "Dead letter has corrupt record");
                    None
                }
                Err(e) => return Err(e.into()),
            };
            letters.push(DeadLetter {
                job_id,
                filename: job.as_ref().map(|j| j.filename.clone()),
                retry_count: job.as_ref().map(|j| j.retry_count),
                message: job.map(|j| j.message),
            });
        }
        Ok(letters)
    }

    /// Queue depths.
    pub async fn stats(&self) -> Result<QueueStats, ServiceError> {
        Ok(self.backend.stats().await?)
    }
}

async fn remove_file_quietly(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "Failed to remove file");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{JobUpdate, SeparationModel};
    use crate::scheduler::RetryPolicy;
    use crate::store::{JobStore, MemoryBackend, WorkQueue};

    fn service() -> (tempfile::TempDir, MemoryBackend, JobService) {
        let dir = tempfile::tempdir().unwrap();
        let backend = MemoryBackend::new();
        let service = JobService::new(
            Arc::new(backend.clone()),
            dir.path().join("uploads"),
            dir.path().join("outputs"),
        );
        (dir, backend, service)
    }

    #[test]
    fn test_supported_extensions() {
        assert!(is_supported_file("song.mp3"));
        assert!(is_supported_file("Song.FLAC"));
        assert!(is_supported_file("take.2.m4a"));
        assert!(!is_supported_file("notes.txt"));
        assert!(!is_supported_file("mp3"));
        assert!(!is_supported_file(""));
    }

    #[tokio::test]
    async fn test_submit_creates_queued_job() {
        let (dir, backend, service) = service();
        let params = JobParams::default().with_model(SeparationModel::Htdemucs6s);
        let id = service
            .submit_bytes("song.mp3", b"audio", params.clone())
            .await
            .unwrap();

        let view = service.status(&id).await.unwrap();
        assert_eq!(view.status, JobStatus::Queued);
        assert_eq!(view.progress, 0.0);
        assert!(view.stems.is_none());

        let job = backend.get(&id).await.unwrap().unwrap();
        assert_eq!(job.params, params);
        assert_eq!(job.filename, "song.mp3");
        assert!(dir
            .path()
            .join("uploads")
            .join(format!("{}_song.mp3", id))
            .is_file());
        assert_eq!(backend.pending().await, vec![id]);
    }

    #[tokio::test]
    async fn test_submit_strips_directories() {
        let (dir, _backend, service) = service();
        let id = service
            .submit_bytes("../../etc/evil.wav", b"audio", JobParams::default())
            .await
            .unwrap();
        assert!(dir
            .path()
            .join("uploads")
            .join(format!("{}_evil.wav", id))
            .is_file());
    }

    #[tokio::test]
    async fn test_submit_rejects_before_storing() {
        let (dir, backend, service) = service();

        let err = service
            .submit_bytes("notes.txt", b"text", JobParams::default())
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 400);

        let err = service
            .submit_bytes("song.wav", b"audio", JobParams::default().with_shifts(99))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::InvalidParams(_)));

        assert!(backend.pending().await.is_empty());
        assert!(!dir.path().join("uploads").exists());
    }

    #[tokio::test]
    async fn test_submit_file() {
        let (dir, backend, service) = service();
        let source = dir.path().join("mix.ogg");
        std::fs::write(&source, b"ogg").unwrap();

        let id = service
            .submit_file(&source, JobParams::default())
            .await
            .unwrap();
        assert_eq!(backend.get(&id).await.unwrap().unwrap().filename, "mix.ogg");
        assert!(source.exists());
    }

    #[tokio::test]
    async fn test_unknown_job() {
        let (_dir, _backend, service) = service();
        let err = service.status("nope").await.unwrap_err();
        assert_eq!(err.status_code(), 404);
        let err = service.stem_path("nope", "vocals").await.unwrap_err();
        assert!(matches!(err, ServiceError::JobNotFound(_)));
        let err = service.delete("nope").await.unwrap_err();
        assert!(matches!(err, ServiceError::JobNotFound(_)));
    }

    #[tokio::test]
    async fn test_stem_path_rules() {
        let (dir, backend, service) = service();
        let id = service
            .submit_bytes("song.wav", b"audio", JobParams::default())
            .await
            .unwrap();

        let err = service.stem_path(&id, "vocals").await.unwrap_err();
        assert!(matches!(err, ServiceError::NotCompleted { .. }));
        assert_eq!(err.status_code(), 400);

        backend
            .update(
                &id,
                &JobUpdate::new()
                    .status(JobStatus::Completed)
                    .stems(vec!["vocals".into()]),
            )
            .await
            .unwrap();
        let job_dir = dir.path().join("outputs").join(&id);
        std::fs::create_dir_all(&job_dir).unwrap();
        std::fs::write(job_dir.join("vocals.wav"), b"RIFF").unwrap();

        assert_eq!(
            service.stem_path(&id, "vocals").await.unwrap(),
            job_dir.join("vocals.wav")
        );
        let err = service.stem_path(&id, "drums").await.unwrap_err();
        assert!(matches!(err, ServiceError::StemNotFound { .. }));
        let err = service.stem_path(&id, "../secret").await.unwrap_err();
        assert!(matches!(err, ServiceError::InvalidStemName(_)));
    }

    #[tokio::test]
    async fn test_delete_removes_everything() {
        let (dir, backend, service) = service();
        let id = service
            .submit_bytes("song.wav", b"audio", JobParams::default())
            .await
            .unwrap();
        let job_dir = dir.path().join("outputs").join(&id);
        std::fs::create_dir_all(&job_dir).unwrap();
        std::fs::write(job_dir.join("bass.wav"), b"RIFF").unwrap();

        service.delete(&id).await.unwrap();

        assert!(matches!(
            service.status(&id).await,
            Err(ServiceError::JobNotFound(_))
        ));
        assert!(!job_dir.exists());
        assert_eq!(std::fs::read_dir(dir.path().join("uploads")).unwrap().count(), 0);
        assert!(backend.pending().await.is_empty());
    }

    #[tokio::test]
    async fn test_health() {
        let (_dir, backend, service) = service();
        let report = service.health().await;
        assert!(report.is_healthy());
        assert_eq!(report.redis, "connected");

        backend.set_available(false);
        let report = service.health().await;
        assert!(!report.is_healthy());
        assert_eq!(report.status, "unhealthy");

        let err = service.status("any").await.unwrap_err();
        assert_eq!(err.status_code(), 503);
    }

    #[tokio::test]
    async fn test_dead_letters_and_stats() {
        let (_dir, backend, service) = service();
        let id = service
            .submit_bytes("song.wav", b"audio", JobParams::default())
            .await
            .unwrap();
        backend
            .dequeue("w", std::time::Duration::from_millis(10))
            .await
            .unwrap();
        backend
            .update(&id, &JobUpdate::new().status(JobStatus::Failed))
            .await
            .unwrap();
        backend
            .requeue_failed(&id, &RetryPolicy::new(0), "engine crashed")
            .await
            .unwrap();

        let letters = service.dead_letters(10).await.unwrap();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].job_id, id);
        assert_eq!(letters[0].retry_count, Some(0));
        assert!(letters[0]
            .message
            .as_deref()
            .unwrap()
            .contains("engine crashed"));

        let stats = service.stats().await.unwrap();
        assert_eq!(stats.pending_jobs, 0);
        assert_eq!(stats.dead_letter_jobs, 1);
    }
}
