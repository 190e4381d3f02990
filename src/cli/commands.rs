//! CLI command definitions for stem-forge.
//!
//! Configuration is layered: built-in defaults, then environment variables
//! (see [`StemConfig::from_env`]), then command-line flags.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use serde::Serialize;
use tracing::{info, warn};

use crate::config::StemConfig;
use crate::jobs::{Job, JobParams, JobStatus, SeparationModel};
use crate::jobs::params::{DEFAULT_OVERLAP, DEFAULT_SHIFTS};
use crate::metrics::{export_metrics, init_metrics};
use crate::processing::{build_engine, EngineKind, ProcessingAdapter};
use crate::scheduler::{
    RetryPolicy, ShutdownCoordinator, WorkerConfig, WorkerPool, WorkerPoolConfig,
};
use crate::service::JobService;
use crate::store::{Backend, JobStore, MemoryBackend, RedisBackend, WorkQueue};

/// How often the worker rewrites the metrics file.
const METRICS_WRITE_INTERVAL: Duration = Duration::from_secs(15);

/// How often `process` polls job status while waiting.
const PROCESS_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Stem separation job manager.
#[derive(Parser)]
#[command(name = "stem-forge")]
#[command(about = "Queue audio files for stem separation and run separation workers")]
#[command(version)]
#[command(
    long_about = "stem-forge queues audio files for stem separation in Redis and runs workers that separate them with demucs.\n\nExample usage:\n  stem-forge submit song.mp3 --model htdemucs_6s\n  stem-forge worker --workers 2\n  stem-forge status <job-id>"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,

    /// Redis connection URL (overrides REDIS_HOST/REDIS_PORT/REDIS_DB).
    #[arg(long, env = "REDIS_URL", global = true)]
    pub redis_url: Option<String>,

    /// Directory holding uploaded inputs.
    #[arg(long, global = true)]
    pub upload_dir: Option<PathBuf>,

    /// Directory holding separated stems.
    #[arg(long, global = true)]
    pub output_dir: Option<PathBuf>,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Run separation workers against the Redis queue.
    Worker(WorkerArgs),

    /// Separate local files in-process without Redis.
    Process(ProcessArgs),

    /// Submit an audio file for separation.
    Submit(SubmitArgs),

    /// Show the status of a job.
    Status(JobArgs),

    /// Copy a separated stem out of the output directory.
    Download(DownloadArgs),

    /// Delete a job with its input and stems.
    Delete(JobArgs),

    /// Check that Redis answers.
    Health,

    /// List dead-lettered jobs.
    DeadLetters(DeadLettersArgs),

    /// Show queue depths.
    Stats,
}

/// Engine and worker settings shared by `worker` and `process`.
#[derive(clap::Args, Debug, Clone)]
pub struct EngineArgs {
    /// Separation engine (demucs, demucs-rs).
    #[arg(long)]
    pub engine: Option<EngineKind>,

    /// Engine command line, e.g. "python -m demucs".
    #[arg(long)]
    pub engine_command: Option<String>,

    /// Per-job timeout in seconds.
    #[arg(long)]
    pub job_timeout: Option<f64>,

    /// Retries before a job is dead-lettered.
    #[arg(long)]
    pub max_retries: Option<u32>,

    /// Number of worker loops to run.
    #[arg(short = 'w', long, default_value = "1")]
    pub workers: usize,
}

/// Arguments for `stem-forge worker`.
#[derive(Parser, Debug)]
pub struct WorkerArgs {
    #[command(flatten)]
    pub engine: EngineArgs,

    /// Worker id; names the in-flight list used for crash recovery.
    #[arg(long)]
    pub worker_id: Option<String>,

    /// Write Prometheus metrics to this file periodically.
    #[arg(long)]
    pub metrics_file: Option<PathBuf>,
}

/// Arguments for `stem-forge process`.
#[derive(Parser, Debug)]
pub struct ProcessArgs {
    /// Audio files to separate.
    #[arg(required = true)]
    pub files: Vec<PathBuf>,

    #[command(flatten)]
    pub params: ParamsArgs,

    #[command(flatten)]
    pub engine: EngineArgs,

    /// Output JSON to stdout.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Separation parameters for a submission.
#[derive(clap::Args, Debug, Clone)]
pub struct ParamsArgs {
    /// Model (htdemucs, htdemucs_ft, htdemucs_6s, mdx_extra).
    #[arg(short = 'm', long, default_value = "htdemucs")]
    pub model: String,

    /// Number of random shifts (0 to 10).
    #[arg(long, default_value_t = DEFAULT_SHIFTS)]
    pub shifts: u32,

    /// Overlap between split windows (0.1 to 0.9).
    #[arg(long, default_value_t = DEFAULT_OVERLAP)]
    pub overlap: f64,

    /// Process the whole track at once instead of in windows.
    #[arg(long)]
    pub no_split: bool,
}

impl ParamsArgs {
    fn to_params(&self) -> anyhow::Result<JobParams> {
        let model: SeparationModel = self.model.parse()?;
        let params = JobParams::new()
            .with_model(model)
            .with_shifts(self.shifts)
            .with_overlap(self.overlap)
            .with_split(!self.no_split);
        params.validate()?;
        Ok(params)
    }
}

/// Arguments for `stem-forge submit`.
#[derive(Parser, Debug)]
pub struct SubmitArgs {
    /// Audio file (mp3, wav, flac, m4a, ogg).
    pub file: PathBuf,

    #[command(flatten)]
    pub params: ParamsArgs,
}

/// Arguments for commands taking only a job id.
#[derive(Parser, Debug)]
pub struct JobArgs {
    pub job_id: String,

    /// Output JSON to stdout.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Arguments for `stem-forge download`.
#[derive(Parser, Debug)]
pub struct DownloadArgs {
    pub job_id: String,

    /// Stem name, e.g. vocals.
    pub stem: String,

    /// Destination file (defaults to <job_id>_<stem>.wav).
    #[arg(short = 'o', long)]
    pub output: Option<PathBuf>,
}

/// Arguments for `stem-forge dead-letters`.
#[derive(Parser, Debug)]
pub struct DeadLettersArgs {
    /// Maximum number of entries to list.
    #[arg(short = 'n', long, default_value = "20")]
    pub limit: usize,
}

/// Parse CLI arguments and return the Cli struct.
///
/// This allows main.rs to access CLI arguments (like log_level) before running commands.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
///
/// This is the main entry point for the stem-forge CLI.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    let config = load_config(&cli)?;

    match cli.command {
        Commands::Worker(args) => run_worker_command(config, args).await,
        Commands::Process(args) => run_process_command(config, args).await,
        Commands::Submit(args) => run_submit_command(config, args).await,
        Commands::Status(args) => run_status_command(config, args).await,
        Commands::Download(args) => run_download_command(config, args).await,
        Commands::Delete(args) => run_delete_command(config, args).await,
        Commands::Health => run_health_command(config).await,
        Commands::DeadLetters(args) => run_dead_letters_command(config, args).await,
        Commands::Stats => run_stats_command(config).await,
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<StemConfig> {
    let mut config = StemConfig::from_env().context("Invalid configuration")?;
    if let Some(url) = &cli.redis_url {
        config = config.with_redis_url(url.clone());
    }
    if let Some(dir) = &cli.upload_dir {
        config = config.with_upload_dir(dir.clone());
    }
    if let Some(dir) = &cli.output_dir {
        config = config.with_output_dir(dir.clone());
    }
    config.validate()?;
    Ok(config)
}

fn apply_engine_args(mut config: StemConfig, args: &EngineArgs) -> anyhow::Result<StemConfig> {
    if let Some(engine) = args.engine {
        config = config.with_engine(engine);
    }
    if let Some(command) = &args.engine_command {
        config = config.with_engine_command(command.clone());
    }
    if let Some(secs) = args.job_timeout {
        let timeout = Duration::try_from_secs_f64(secs)
            .ok()
            .filter(|t| !t.is_zero())
            .with_context(|| {
                format!("--job-timeout must be a positive number of seconds, got {}", secs)
            })?;
        config = config.with_job_timeout(timeout);
    }
    if let Some(max_retries) = args.max_retries {
        config = config.with_max_retries(max_retries);
    }
    anyhow::ensure!(args.workers > 0, "--workers must be at least 1");
    config.validate()?;
    Ok(config)
}

async fn connect(config: &StemConfig) -> anyhow::Result<RedisBackend> {
    let backend = RedisBackend::connect_with_retry(
        &config.redis_url(),
        &config.queue_name,
        config.reconnect_attempts,
        config.reconnect_delay,
    )
    .await
    .context("Failed to connect to Redis")?;
    Ok(backend)
}

async fn service(config: &StemConfig) -> anyhow::Result<JobService> {
    let backend = connect(config).await?;
    Ok(JobService::from_config(Arc::new(backend), config))
}

fn build_pool(config: &StemConfig, workers: usize, coordinator: ShutdownCoordinator) -> WorkerPool {
    let engine = build_engine(config.engine, config.engine_command.as_deref());
    let adapter = Arc::new(ProcessingAdapter::new(
        engine,
        &config.upload_dir,
        &config.output_dir,
    ));
    let pool_config = WorkerPoolConfig::new(workers).with_worker(WorkerConfig::from_config(config));
    WorkerPool::new(
        pool_config,
        adapter,
        RetryPolicy::new(config.max_retries),
        coordinator,
    )
}

// ============================================================================
// Worker
// ============================================================================

async fn run_worker_command(config: StemConfig, args: WorkerArgs) -> anyhow::Result<()> {
    let mut config = apply_engine_args(config, &args.engine)?;
    if let Some(worker_id) = args.worker_id {
        config = config.with_worker_id(worker_id);
        config.validate()?;
    }
    config.ensure_dirs()?;

    info!(
        redis = %config.redis_url(),
        engine = %config.engine,
        workers = args.engine.workers,
        upload_dir = %config.upload_dir.display(),
        output_dir = %config.output_dir.display(),
        "Starting stem separation worker"
    );

    // Each worker blocks on its own dequeue, so each gets its own connection
    let mut backends: Vec<Arc<dyn Backend>> = Vec::with_capacity(args.engine.workers);
    for _ in 0..args.engine.workers {
        backends.push(Arc::new(connect(&config).await?));
    }

    let metrics_task = match &args.metrics_file {
        Some(path) => {
            init_metrics().context("Failed to initialize metrics")?;
            Some(tokio::spawn(write_metrics_periodically(path.clone())))
        }
        None => None,
    };

    let coordinator = ShutdownCoordinator::new();
    let _signals = coordinator.listen_for_signals();

    let mut pool = build_pool(&config, args.engine.workers, coordinator);
    pool.start(backends)?;
    let result = pool.join().await;

    if let Some(task) = metrics_task {
        task.abort();
    }
    if let Some(path) = &args.metrics_file {
        write_metrics(path).await;
    }

    let stats = pool.stats();
    info!(
        completed = stats.completed,
        failed = stats.failed,
        retried = stats.retried,
        dead_lettered = stats.dead_lettered,
        mean_attempt_secs = stats.mean_attempt_time.as_secs_f64(),
        "Worker shut down"
    );
    result?;
    Ok(())
}

async fn write_metrics_periodically(path: PathBuf) {
    let mut interval = tokio::time::interval(METRICS_WRITE_INTERVAL);
    loop {
        interval.tick().await;
        write_metrics(&path).await;
    }
}

async fn write_metrics(path: &Path) {
    if let Err(e) = tokio::fs::write(path, export_metrics()).await {
        warn!(path = %path.display(), error = %e, "Failed to write metrics file");
    }
}

// ============================================================================
// Local processing
// ============================================================================

#[derive(Debug, Serialize)]
struct ProcessEntry {
    file: String,
    job_id: String,
    status: JobStatus,
    message: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    stems: Vec<String>,
}

async fn run_process_command(config: StemConfig, args: ProcessArgs) -> anyhow::Result<()> {
    let config = apply_engine_args(config, &args.engine)?;
    config.ensure_dirs()?;
    let params = args.params.to_params()?;

    let backend = MemoryBackend::new();
    let service = JobService::from_config(Arc::new(backend.clone()), &config);

    let mut submitted = Vec::with_capacity(args.files.len());
    for file in &args.files {
        let job_id = service
            .submit_file(file, params.clone())
            .await
            .with_context(|| format!("Failed to submit {}", file.display()))?;
        submitted.push((file.display().to_string(), job_id));
    }

    let coordinator = ShutdownCoordinator::new();
    let _signals = coordinator.listen_for_signals();

    let workers = args.engine.workers;
    let backends: Vec<Arc<dyn Backend>> = (0..workers)
        .map(|_| Arc::new(backend.clone()) as Arc<dyn Backend>)
        .collect();
    let mut pool = build_pool(&config, workers, coordinator.clone());
    let worker_ids: Vec<String> = (0..workers).map(|i| pool.config().worker_id(i)).collect();
    pool.start(backends)?;

    // Wait until every job is settled or the user interrupts
    let entries = loop {
        let mut entries = Vec::with_capacity(submitted.len());
        let mut all_settled = true;
        for (file, job_id) in &submitted {
            let job = backend
                .get(job_id)
                .await?
                .with_context(|| format!("Job {} disappeared", job_id))?;
            all_settled &= is_settled(&backend, &job, &worker_ids).await?;
            entries.push(ProcessEntry {
                file: file.clone(),
                job_id: job_id.clone(),
                status: job.status,
                message: job.message,
                stems: job.stems,
            });
        }
        if all_settled || coordinator.is_triggered() {
            break entries;
        }
        tokio::time::sleep(PROCESS_POLL_INTERVAL).await;
    };

    if let Err(e) = pool.shutdown().await {
        warn!(error = %e, "Worker pool did not shut down cleanly");
    }

    if args.json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
    } else {
        for entry in &entries {
            println!("{} [{}] {}", entry.file, entry.status, entry.message);
            for stem in &entry.stems {
                println!(
                    "  {}",
                    config
                        .output_dir
                        .join(&entry.job_id)
                        .join(format!("{}.wav", stem))
                        .display()
                );
            }
        }
    }

    let failed = entries
        .iter()
        .filter(|e| e.status != JobStatus::Completed)
        .count();
    anyhow::ensure!(failed == 0, "{} of {} jobs failed", failed, entries.len());
    Ok(())
}

/// Whether no worker will touch `job` again.
///
/// A `failed` job is final once no worker holds it: the retry decision is
/// made before the worker acks, and a requeued job reads as `queued`.
async fn is_settled(backend: &MemoryBackend, job: &Job, worker_ids: &[String]) -> anyhow::Result<bool> {
    match job.status {
        JobStatus::Completed => Ok(true),
        JobStatus::Failed => {
            for worker_id in worker_ids {
                if backend.in_flight(worker_id).await?.contains(&job.id) {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        JobStatus::Queued | JobStatus::Processing => Ok(false),
    }
}

// ============================================================================
// Job commands
// ============================================================================

async fn run_submit_command(config: StemConfig, args: SubmitArgs) -> anyhow::Result<()> {
    let params = args.params.to_params()?;
    let service = service(&config).await?;
    let job_id = service.submit_file(&args.file, params).await?;
    println!("{}", job_id);
    Ok(())
}

async fn run_status_command(config: StemConfig, args: JobArgs) -> anyhow::Result<()> {
    let service = service(&config).await?;
    let view = service.status(&args.job_id).await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&view)?);
    } else {
        println!("Job:      {}", view.job_id);
        println!("Status:   {}", view.status);
        println!("Progress: {:.0}%", view.progress);
        println!("Message:  {}", view.message);
        if let Some(stems) = &view.stems {
            println!("Stems:    {}", stems.join(", "));
        }
    }
    Ok(())
}

async fn run_download_command(config: StemConfig, args: DownloadArgs) -> anyhow::Result<()> {
    let service = service(&config).await?;
    let source = service.stem_path(&args.job_id, &args.stem).await?;
    let target = args
        .output
        .unwrap_or_else(|| PathBuf::from(format!("{}_{}.wav", args.job_id, args.stem)));

    tokio::fs::copy(&source, &target)
        .await
        .with_context(|| format!("Failed to copy {} to {}", source.display(), target.display()))?;
    println!("{}", target.display());
    Ok(())
}

async fn run_delete_command(config: StemConfig, args: JobArgs) -> anyhow::Result<()> {
    let service = service(&config).await?;
    service.delete(&args.job_id).await?;
    if args.json {
        println!(
            "{}",
            serde_json::json!({ "message": "Job deleted successfully" })
        );
    } else {
        println!("Job {} deleted", args.job_id);
    }
    Ok(())
}

async fn run_health_command(config: StemConfig) -> anyhow::Result<()> {
    // A single attempt; health must report, not wait
    let report = match RedisBackend::connect(&config.redis_url(), &config.queue_name).await {
        Ok(backend) => JobService::from_config(Arc::new(backend), &config).health().await,
        Err(e) => crate::service::HealthReport {
            status: "unhealthy",
            redis: "disconnected",
            error: Some(e.to_string()),
        },
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    anyhow::ensure!(report.is_healthy(), "Redis is not reachable");
    Ok(())
}

async fn run_dead_letters_command(config: StemConfig, args: DeadLettersArgs) -> anyhow::Result<()> {
    let service = service(&config).await?;
    let letters = service.dead_letters(args.limit).await?;
    println!("{}", serde_json::to_string_pretty(&letters)?);
    Ok(())
}

async fn run_stats_command(config: StemConfig) -> anyhow::Result<()> {
    let service = service(&config).await?;
    let stats = service.stats().await?;
    println!(
        "{}",
        serde_json::json!({
            "queue": stats.queue_name,
            "pending": stats.pending_jobs,
            "dead_letter": stats.dead_letter_jobs,
        })
    );
    Ok(())
}
