//! Separation engines driven through an external command line.
//!
//! Runs either the Python `demucs` tool or the native demucs-rs binary as a
//! child process, streams its progress output, and collects the stem files
//! it wrote.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::OnceLock;

use async_trait::async_trait;
use regex::Regex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::engine::{
    EngineKind, EngineStem, InputSpec, SeparationEngine, SeparationRequest, DEMUCS_INPUT,
};
use super::is_valid_stem_name;
use super::progress::ProgressReporter;
use crate::error::EngineError;
use crate::jobs::SeparationModel;

/// Bytes of stderr kept for error reports.
const STDERR_TAIL_BYTES: usize = 2048;

fn tqdm_percent() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(\d{1,3})%\|").expect("valid regex"))
}

fn bar_position() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\]\s+(\d+)/(\d+)").expect("valid regex"))
}

/// Extracts a completion percentage from one line of engine output.
///
/// Understands tqdm bars (` 45%|████`) and position bars (`] 9/18`).
pub fn parse_progress(line: &str) -> Option<f64> {
    if let Some(caps) = tqdm_percent().captures_iter(line).last() {
        return caps[1].parse::<f64>().ok().map(|p| p.min(100.0));
    }
    let caps = bar_position().captures_iter(line).last()?;
    let pos = caps[1].parse::<f64>().ok()?;
    let len = caps[2].parse::<f64>().ok()?;
    if len <= 0.0 {
        return None;
    }
    Some((pos / len * 100.0).min(100.0))
}

/// Engine that shells out to a demucs command line.
pub struct CommandEngine {
    kind: EngineKind,
    program: String,
    /// Arguments placed before the per-job arguments.
    base_args: Vec<String>,
}

impl CommandEngine {
    /// Creates an engine using the default command for `kind`.
    pub fn new(kind: EngineKind) -> Self {
        Self::with_command(kind, kind.default_command())
    }

    /// Creates an engine from a command line such as `python3 -m demucs`.
    pub fn with_command(kind: EngineKind, command: &str) -> Self {
        let mut parts = command.split_whitespace().map(str::to_string);
        let program = parts
            .next()
            .unwrap_or_else(|| kind.default_command().to_string());
        Self {
            kind,
            program,
            base_args: parts.collect(),
        }
    }

    pub fn kind(&self) -> EngineKind {
        self.kind
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Builds the per-job argument list.
    pub fn build_args(&self, request: &SeparationRequest) -> Result<Vec<OsString>, EngineError> {
        let mut args: Vec<OsString> = self.base_args.iter().map(OsString::from).collect();
        let params = &request.params;

        match self.kind {
            EngineKind::Demucs => {
                args.push("-n".into());
                args.push(params.model.as_str().into());
                args.push("--shifts".into());
                args.push(params.shifts.to_string().into());
                args.push("--overlap".into());
                args.push(params.overlap.to_string().into());
                if !params.split {
                    args.push("--no-split".into());
                }
                args.push("-o".into());
                args.push(request.output_dir.clone().into_os_string());
                args.push(request.input.clone().into_os_string());
            }
            EngineKind::DemucsRs => {
                if params.model == SeparationModel::MdxExtra {
                    return Err(EngineError::UnsupportedModel {
                        model: params.model.to_string(),
                        engine: self.kind.to_string(),
                    });
                }
                args.push(request.input.clone().into_os_string());
                args.push("-m".into());
                args.push(params.model.as_str().into());
                args.push("-o".into());
                args.push(request.output_dir.clone().into_os_string());
            }
        }

        Ok(args)
    }

    /// Directory the engine writes stem files into.
    pub fn stem_dir(&self, request: &SeparationRequest) -> PathBuf {
        match self.kind {
            EngineKind::Demucs => {
                let track = request
                    .input
                    .file_stem()
                    .map(|s| s.to_os_string())
                    .unwrap_or_default();
                request
                    .output_dir
                    .join(request.params.model.as_str())
                    .join(track)
            }
            EngineKind::DemucsRs => request.output_dir.clone(),
        }
    }
}

/// Keeps the last `STDERR_TAIL_BYTES` of text.
fn push_tail(tail: &mut String, line: &str) {
    tail.push_str(line);
    tail.push('\n');
    if tail.len() > STDERR_TAIL_BYTES {
        let mut cut = tail.len() - STDERR_TAIL_BYTES;
        while !tail.is_char_boundary(cut) {
            cut += 1;
        }
        tail.drain(..cut);
    }
}

/// Lists the stem files in `dir`, ordered as the model lists its stems.
pub async fn collect_stems(
    dir: &Path,
    model: SeparationModel,
) -> Result<Vec<EngineStem>, EngineError> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(EngineError::NoOutput(dir.display().to_string()));
        }
        Err(e) => return Err(e.into()),
    };

    let mut stems = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("wav") {
            continue;
        }
        let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        if !is_valid_stem_name(name) {
            return Err(EngineError::InvalidStemName(name.to_string()));
        }
        stems.push(EngineStem {
            name: name.to_string(),
            path: path.clone(),
        });
    }

    if stems.is_empty() {
        return Err(EngineError::NoOutput(dir.display().to_string()));
    }

    let order = model.stems();
    stems.sort_by_key(|stem| {
        (
            order
                .iter()
                .position(|known| *known == stem.name)
                .unwrap_or(order.len()),
            stem.name.clone(),
        )
    });
    Ok(stems)
}

#[async_trait]
impl SeparationEngine for CommandEngine {
    fn name(&self) -> &str {
        self.kind.as_str()
    }

    fn required_input(&self) -> Option<InputSpec> {
        match self.kind {
            EngineKind::Demucs => None,
            EngineKind::DemucsRs => Some(DEMUCS_INPUT),
        }
    }

    async fn separate(
        &self,
        request: &SeparationRequest,
        progress: &ProgressReporter,
    ) -> Result<Vec<EngineStem>, EngineError> {
        let args = self.build_args(request)?;
        tokio::fs::create_dir_all(&request.output_dir).await?;

        let mut cmd = Command::new(&self.program);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        info!(
            job_id = %request.job_id,
            engine = %self.kind,
            program = %self.program,
            model = %request.params.model,
            "Starting separation engine"
        );

        let mut child = cmd.spawn().map_err(|source| EngineError::Spawn {
            command: self.program.clone(),
            source,
        })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| EngineError::Io(std::io::Error::other("stdout not captured")))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| EngineError::Io(std::io::Error::other("stderr not captured")))?;

        let mut stdout_lines = BufReader::new(stdout).lines();
        // Progress bars redraw with carriage returns
        let mut stderr_segments = BufReader::new(stderr).split(b'\r');

        let mut stderr_tail = String::new();
        let mut stdout_open = true;
        let mut stderr_open = true;

        while stdout_open || stderr_open {
            tokio::select! {
                line = stdout_lines.next_line(), if stdout_open => {
                    match line {
                        Ok(Some(l)) => {
                            debug!(job_id = %request.job_id, "[engine stdout] {}", l);
                            if let Some(percent) = parse_progress(&l) {
                                progress.engine_percent(percent).await;
                            }
                        }
                        Ok(None) => stdout_open = false,
                        Err(e) => {
                            warn!(job_id = %request.job_id, "Error reading engine stdout: {}", e);
                            stdout_open = false;
                        }
                    }
                }
                segment = stderr_segments.next_segment(), if stderr_open => {
                    match segment {
                        Ok(Some(bytes)) => {
                            let text = String::from_utf8_lossy(&bytes);
                            for l in text.lines().filter(|l| !l.trim().is_empty()) {
                                debug!(job_id = %request.job_id, "[engine stderr] {}", l);
                                if let Some(percent) = parse_progress(l) {
                                    progress.engine_percent(percent).await;
                                } else {
                                    push_tail(&mut stderr_tail, l);
                                }
                            }
                        }
                        Ok(None) => stderr_open = false,
                        Err(e) => {
                            warn!(job_id = %request.job_id, "Error reading engine stderr: {}", e);
                            stderr_open = false;
                        }
                    }
                }
            }
        }

        let status = child.wait().await?;
        if !status.success() {
            return Err(EngineError::NonZeroExit {
                code: status.code().unwrap_or(-1),
                stderr: stderr_tail.trim().to_string(),
            });
        }

        let stems = collect_stems(&self.stem_dir(request), request.params.model).await?;
        info!(
            job_id = %request.job_id,
            stems = stems.len(),
            "Separation engine finished"
        );
        Ok(stems)
    }
}
