//! Shared fixtures for the scenario tests.

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use stem_forge::error::EngineError;
use stem_forge::jobs::{Job, JobParams};
use stem_forge::processing::{
    EngineStem, ProcessingAdapter, ProgressReporter, SeparationEngine, SeparationRequest,
};
use stem_forge::scheduler::{RetryPolicy, ShutdownCoordinator, Worker, WorkerConfig};
use stem_forge::service::JobService;
use stem_forge::store::{Backend, JobStore, MemoryBackend};
use tokio::task::JoinHandle;

/// What the fake engine does on each call.
#[derive(Debug, Clone)]
pub enum Script {
    /// Write these stems.
    Succeed(Vec<&'static str>),
    /// Fail this many calls, then write the stems.
    FailFirst(u32, Vec<&'static str>),
    /// Always exit non-zero.
    AlwaysFail,
    /// Sleep before writing a single stem.
    Sleep(Duration),
}

/// Fake separation engine driven by a [`Script`].
pub struct ScriptedEngine {
    script: Script,
    calls: AtomicU32,
    seen: Mutex<Vec<String>>,
}

impl ScriptedEngine {
    pub fn new(script: Script) -> Arc<Self> {
        Arc::new(Self {
            script,
            calls: AtomicU32::new(0),
            seen: Mutex::new(Vec::new()),
        })
    }

    /// Number of times `separate` was called.
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Job ids in the order they reached the engine.
    pub fn seen(&self) -> Vec<String> {
        self.seen.lock().unwrap().clone()
    }

    async fn write_stems(
        request: &SeparationRequest,
        stems: &[&'static str],
    ) -> Result<Vec<EngineStem>, EngineError> {
        tokio::fs::create_dir_all(&request.output_dir).await?;
        let mut out = Vec::new();
        for name in stems {
            let path = request.output_dir.join(format!("{}.wav", name));
            tokio::fs::write(&path, b"RIFF").await?;
            out.push(EngineStem {
                name: name.to_string(),
                path,
            });
        }
        Ok(out)
    }
}

#[async_trait]
impl SeparationEngine for ScriptedEngine {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn separate(
        &self,
        request: &SeparationRequest,
        progress: &ProgressReporter,
    ) -> Result<Vec<EngineStem>, EngineError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.seen.lock().unwrap().push(request.job_id.clone());
        progress.engine_percent(50.0).await;

        match &self.script {
            Script::Succeed(stems) => Self::write_stems(request, stems).await,
            Script::FailFirst(n, stems) if call > *n => Self::write_stems(request, stems).await,
            Script::FailFirst(..) | Script::AlwaysFail => Err(EngineError::NonZeroExit {
                code: 1,
                stderr: "RuntimeError: CUDA out of memory".into(),
            }),
            Script::Sleep(duration) => {
                tokio::time::sleep(*duration).await;
                Self::write_stems(request, &["vocals"]).await
            }
        }
    }
}

/// A temporary deployment: directories, store, service and workers.
pub struct Harness {
    pub dir: tempfile::TempDir,
    pub backend: MemoryBackend,
    pub service: JobService,
    pub adapter: Arc<ProcessingAdapter>,
    pub engine: Arc<ScriptedEngine>,
    pub coordinator: ShutdownCoordinator,
    pub job_timeout: Duration,
}

impl Harness {
    pub fn new(script: Script) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let backend = MemoryBackend::new();
        let engine = ScriptedEngine::new(script);
        let adapter = Arc::new(ProcessingAdapter::new(
            engine.clone(),
            dir.path().join("uploads"),
            dir.path().join("outputs"),
        ));
        let service = JobService::new(
            Arc::new(backend.clone()),
            dir.path().join("uploads"),
            dir.path().join("outputs"),
        );
        Self {
            dir,
            backend,
            service,
            adapter,
            engine,
            coordinator: ShutdownCoordinator::new(),
            job_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = timeout;
        self
    }

    pub fn upload_dir(&self) -> PathBuf {
        self.dir.path().join("uploads")
    }

    pub fn output_dir(&self) -> PathBuf {
        self.dir.path().join("outputs")
    }

    pub fn worker_config(&self, worker_id: &str) -> WorkerConfig {
        WorkerConfig::default()
            .with_worker_id(worker_id)
            .with_job_timeout(self.job_timeout)
            .with_dequeue_timeout(Duration::from_millis(50))
            .with_reconnect(Duration::from_millis(20), 50)
    }

    pub fn worker(&self, worker_id: &str, max_retries: u32) -> Worker {
        Worker::new(
            self.worker_config(worker_id),
            Arc::new(self.backend.clone()) as Arc<dyn Backend>,
            Arc::clone(&self.adapter),
            RetryPolicy::new(max_retries),
            self.coordinator.signal(),
        )
    }

    /// Spawns a worker loop.
    pub fn spawn_worker(
        &self,
        worker_id: &str,
        max_retries: u32,
    ) -> JoinHandle<Result<(), stem_forge::StoreError>> {
        tokio::spawn(self.worker(worker_id, max_retries).run())
    }

    pub async fn submit(&self, filename: &str) -> String {
        self.service
            .submit_bytes(filename, b"fake audio", JobParams::default())
            .await
            .unwrap()
    }

    pub async fn job(&self, id: &str) -> Job {
        self.backend.get(id).await.unwrap().unwrap()
    }

    /// Polls the job until `done` holds, panicking after `timeout`.
    pub async fn wait_for<F>(&self, id: &str, timeout: Duration, done: F) -> Job
    where
        F: Fn(&Job) -> bool,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let job = self.job(id).await;
            if done(&job) {
                return job;
            }
            if tokio::time::Instant::now() > deadline {
                panic!("job {} did not settle: {:?}", id, job);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Triggers shutdown and waits for the given worker tasks.
    pub async fn stop(&self, handles: Vec<JoinHandle<Result<(), stem_forge::StoreError>>>) {
        self.coordinator.trigger();
        for handle in handles {
            tokio::time::timeout(Duration::from_secs(5), handle)
                .await
                .expect("worker did not stop")
                .expect("worker panicked")
                .expect("worker failed");
        }
    }
}
