//! Separation engine abstraction.
//!
//! Each engine knows how to:
//! 1. Declare the input shape it needs (if any)
//! 2. Run a separation into a scratch directory
//! 3. Report the stems it produced

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::command::CommandEngine;
use super::progress::ProgressReporter;
use crate::error::EngineError;
use crate::jobs::JobParams;

/// Supported engine backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum EngineKind {
    /// The Python `demucs` command line.
    #[default]
    Demucs,
    /// The native demucs-rs command line.
    DemucsRs,
}

impl EngineKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineKind::Demucs => "demucs",
            EngineKind::DemucsRs => "demucs-rs",
        }
    }

    /// Returns the default command for this engine.
    pub fn default_command(&self) -> &'static str {
        match self {
            EngineKind::Demucs => "demucs",
            EngineKind::DemucsRs => "demucs-rs",
        }
    }
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EngineKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "demucs" | "python" => Ok(EngineKind::Demucs),
            "demucs-rs" | "demucs_rs" | "native" => Ok(EngineKind::DemucsRs),
            other => Err(format!("Unknown engine: {}", other)),
        }
    }
}

/// Audio shape an engine requires at its input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputSpec {
    pub sample_rate: u32,
    pub channels: u16,
}

/// Stereo at 44.1 kHz, the rate the demucs models were trained on.
pub const DEMUCS_INPUT: InputSpec = InputSpec {
    sample_rate: 44_100,
    channels: 2,
};

/// One separation run.
#[derive(Debug, Clone)]
pub struct SeparationRequest {
    pub job_id: String,
    /// Audio file to separate.
    pub input: PathBuf,
    /// Scratch directory the engine writes into.
    pub output_dir: PathBuf,
    pub params: JobParams,
}

/// A stem file produced by an engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineStem {
    pub name: String,
    pub path: PathBuf,
}

/// Trait for separation engines.
#[async_trait]
pub trait SeparationEngine: Send + Sync {
    /// Short engine name for logs.
    fn name(&self) -> &str;

    /// Input shape the engine needs, or `None` if it decodes anything itself.
    fn required_input(&self) -> Option<InputSpec> {
        None
    }

    /// Separates `request.input` into stems under `request.output_dir`.
    async fn separate(
        &self,
        request: &SeparationRequest,
        progress: &ProgressReporter,
    ) -> Result<Vec<EngineStem>, EngineError>;
}

/// Creates the engine for `kind`, optionally overriding its command line.
pub fn build_engine(kind: EngineKind, command: Option<&str>) -> Arc<dyn SeparationEngine> {
    let engine = match command {
        Some(command) if !command.trim().is_empty() => CommandEngine::with_command(kind, command),
        _ => CommandEngine::new(kind),
    };
    Arc::new(engine)
}
