//! Processing adapter around the separation engine.
//!
//! The adapter owns the filesystem contract of a job:
//!
//! - input: `upload_dir/<job_id>_<filename>`
//! - scratch: `output_dir/<job_id>/.partial/`
//! - stems: `output_dir/<job_id>/<stem>.wav`
//!
//! It normalizes the input when the engine asks for it, runs the engine,
//! moves the stems into place and reports coarse progress along the way.
//! On failure the job's output directory is removed and the input is kept so
//! a retry can reprocess it.

pub mod audio;
pub mod command;
pub mod engine;
pub mod progress;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::error::{EngineError, ProcessingError};
use crate::jobs::{Job, Phase};

pub use self::command::CommandEngine;
pub use self::engine::{
    build_engine, EngineKind, EngineStem, InputSpec, SeparationEngine, SeparationRequest,
};
pub use self::progress::ProgressReporter;

/// Scratch directory name inside a job's output directory.
const SCRATCH_DIR: &str = ".partial";

/// Returns whether `name` is safe to use as a stem file name.
pub fn is_valid_stem_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 64
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Stems written for a completed job, in model order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StemOutput {
    pub name: String,
    pub path: PathBuf,
}

/// Runs separation jobs against the upload and output directories.
pub struct ProcessingAdapter {
    engine: Arc<dyn SeparationEngine>,
    upload_dir: PathBuf,
    output_dir: PathBuf,
}

impl ProcessingAdapter {
    pub fn new(
        engine: Arc<dyn SeparationEngine>,
        upload_dir: impl Into<PathBuf>,
        output_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            engine,
            upload_dir: upload_dir.into(),
            output_dir: output_dir.into(),
        }
    }

    pub fn engine_name(&self) -> &str {
        self.engine.name()
    }

    pub fn upload_dir(&self) -> &Path {
        &self.upload_dir
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Directory holding the stems of `job_id`.
    pub fn job_output_dir(&self, job_id: &str) -> PathBuf {
        self.output_dir.join(job_id)
    }

    /// Finds the uploaded input for `job_id` by its `"{job_id}_"` prefix.
    pub async fn locate_input(&self, job_id: &str) -> Result<PathBuf, ProcessingError> {
        let prefix = format!("{}_", job_id);
        let mut entries = match tokio::fs::read_dir(&self.upload_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ProcessingError::InputMissing(job_id.to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            if name.to_string_lossy().starts_with(&prefix) && entry.file_type().await?.is_file() {
                return Ok(entry.path());
            }
        }
        Err(ProcessingError::InputMissing(job_id.to_string()))
    }

    /// Processes `job` and returns its stems.
    pub async fn run(
        &self,
        job: &Job,
        progress: &ProgressReporter,
    ) -> Result<Vec<StemOutput>, ProcessingError> {
        match self.run_inner(job, progress).await {
            Ok(stems) => Ok(stems),
            Err(e) => {
                self.discard(&job.id).await;
                Err(e)
            }
        }
    }

    async fn run_inner(
        &self,
        job: &Job,
        progress: &ProgressReporter,
    ) -> Result<Vec<StemOutput>, ProcessingError> {
        let input = self.locate_input(&job.id).await?;
        progress
            .phase(Phase::LocateInput, "Input file located")
            .await;

        let job_dir = self.job_output_dir(&job.id);
        remove_dir_if_exists(&job_dir).await?;
        let scratch = job_dir.join(SCRATCH_DIR);
        tokio::fs::create_dir_all(&scratch).await?;

        progress
            .phase(
                Phase::LoadModel,
                &format!("Loading {} model...", job.params.model),
            )
            .await;

        let engine_input = match self.engine.required_input() {
            Some(spec) => {
                progress.phase(Phase::Decode, "Normalizing audio...").await;
                let source = input.clone();
                let target = scratch.join("input.wav");
                let normalized = target.clone();
                let cancel = audio::CancelFlag::new();
                let guard = cancel.cancel_on_drop();
                let audio = tokio::task::spawn_blocking(move || {
                    audio::normalize(&source, &target, spec, &cancel)
                })
                .await
                .map_err(|e| ProcessingError::Panicked(e.to_string()))??;
                guard.disarm();
                debug!(
                    job_id = %job.id,
                    frames = audio.frames(),
                    sample_rate = audio.sample_rate,
                    "Normalized input"
                );
                normalized
            }
            None => {
                progress.phase(Phase::Decode, "Loading audio file...").await;
                input.clone()
            }
        };

        progress
            .phase(Phase::Separate, "Separating stems (this may take a while)...")
            .await;

        let request = SeparationRequest {
            job_id: job.id.clone(),
            input: engine_input,
            output_dir: scratch.join("engine"),
            params: job.params.clone(),
        };
        let produced = self.engine.separate(&request, progress).await?;
        if produced.is_empty() {
            return Err(EngineError::NoOutput(request.output_dir.display().to_string()).into());
        }

        progress.phase(Phase::Save, "Saving stems...").await;

        let total = produced.len();
        let mut stems = Vec::with_capacity(total);
        for (index, stem) in produced.into_iter().enumerate() {
            if !is_valid_stem_name(&stem.name) {
                return Err(EngineError::InvalidStemName(stem.name).into());
            }
            let target = job_dir.join(format!("{}.wav", stem.name));
            move_file(&stem.path, &target).await?;
            progress.stem_saved(index, total, &stem.name).await;
            stems.push(StemOutput {
                name: stem.name,
                path: target,
            });
        }

        remove_dir_if_exists(&scratch).await?;

        if let Err(e) = tokio::fs::remove_file(&input).await {
            warn!(job_id = %job.id, error = %e, "Failed to remove input file");
        }

        info!(
            job_id = %job.id,
            engine = self.engine.name(),
            stems = stems.len(),
            "Separation finished"
        );
        Ok(stems)
    }

    /// Removes everything written for `job_id` under the output directory.
    pub async fn discard(&self, job_id: &str) {
        let job_dir = self.job_output_dir(job_id);
        if let Err(e) = remove_dir_if_exists(&job_dir).await {
            warn!(job_id = %job_id, error = %e, "Failed to discard job output");
        }
    }
}

async fn remove_dir_if_exists(path: &Path) -> std::io::Result<()> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Renames `from` to `to`, copying when they are on different filesystems.
async fn move_file(from: &Path, to: &Path) -> std::io::Result<()> {
    if tokio::fs::rename(from, to).await.is_ok() {
        return Ok(());
    }
    tokio::fs::copy(from, to).await?;
    tokio::fs::remove_file(from).await
}
