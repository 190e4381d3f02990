//! Service configuration.
//!
//! Every setting has a default, can be overridden from the environment, and
//! is checked by [`StemConfig::validate`] before a worker or the job service
//! starts.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::processing::EngineKind;
use crate::scheduler::retry::DEFAULT_MAX_RETRIES;
use crate::store::DEFAULT_QUEUE_NAME;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    /// IO error while preparing directories.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration shared by the worker and the job service.
#[derive(Debug, Clone)]
pub struct StemConfig {
    // Store settings
    pub redis_host: String,
    pub redis_port: u16,
    pub redis_db: u32,
    /// Full connection URL; takes precedence over host, port and db.
    pub redis_url: Option<String>,
    pub queue_name: String,

    // Filesystem layout
    pub upload_dir: PathBuf,
    pub output_dir: PathBuf,

    // Worker settings
    pub worker_id: String,
    pub max_retries: u32,
    /// Deadline for processing a single job.
    pub job_timeout: Duration,
    /// How long one blocking dequeue waits before re-checking for shutdown.
    pub dequeue_timeout: Duration,
    pub reconnect_delay: Duration,
    pub reconnect_attempts: u32,

    // Engine settings
    pub engine: EngineKind,
    /// Overrides the engine's default command line.
    pub engine_command: Option<String>,
}

impl Default for StemConfig {
    fn default() -> Self {
        Self {
            redis_host: "localhost".to_string(),
            redis_port: 6379,
            redis_db: 0,
            redis_url: None,
            queue_name: DEFAULT_QUEUE_NAME.to_string(),

            upload_dir: PathBuf::from("uploads"),
            output_dir: PathBuf::from("outputs"),

            worker_id: "worker".to_string(),
            max_retries: DEFAULT_MAX_RETRIES,
            job_timeout: Duration::from_secs(600), // 10 minutes
            dequeue_timeout: Duration::from_secs(5),
            reconnect_delay: Duration::from_secs(5),
            reconnect_attempts: 10,

            engine: EngineKind::default(),
            engine_command: None,
        }
    }
}

impl StemConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `REDIS_URL`: full connection URL (overrides the next three)
    /// - `REDIS_HOST`: Redis host (default: localhost)
    /// - `REDIS_PORT`: Redis port (default: 6379)
    /// - `REDIS_DB`: Redis database index (default: 0)
    /// - `QUEUE_NAME`: pending list name (default: job_queue)
    /// - `UPLOAD_DIR`: where submitted files are stored (default: uploads)
    /// - `OUTPUT_DIR`: where stems are written (default: outputs)
    /// - `WORKER_ID`: stable worker identity for crash recovery (default: worker)
    /// - `MAX_RETRIES`: retries before dead-lettering (default: 3)
    /// - `JOB_TIMEOUT`: per-job deadline in seconds (default: 600)
    /// - `DEQUEUE_TIMEOUT`: blocking dequeue wait in seconds (default: 5)
    /// - `RECONNECT_DELAY`: seconds between store reconnect probes (default: 5)
    /// - `RECONNECT_ATTEMPTS`: reconnect probes before giving up (default: 10)
    /// - `ENGINE`: `demucs` or `demucs-rs` (default: demucs)
    /// - `ENGINE_COMMAND`: engine command line override
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable has an invalid value.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`from_env`](Self::from_env), reading variables through `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        // Store settings
        if let Some(val) = lookup("REDIS_URL").filter(|v| !v.is_empty()) {
            config.redis_url = Some(val);
        }
        if let Some(val) = lookup("REDIS_HOST") {
            config.redis_host = val;
        }
        if let Some(val) = lookup("REDIS_PORT") {
            config.redis_port = parse_env_value(&val, "REDIS_PORT")?;
        }
        if let Some(val) = lookup("REDIS_DB") {
            config.redis_db = parse_env_value(&val, "REDIS_DB")?;
        }
        if let Some(val) = lookup("QUEUE_NAME") {
            config.queue_name = val;
        }

        // Filesystem layout
        if let Some(val) = lookup("UPLOAD_DIR") {
            config.upload_dir = PathBuf::from(val);
        }
        if let Some(val) = lookup("OUTPUT_DIR") {
            config.output_dir = PathBuf::from(val);
        }

        // Worker settings
        if let Some(val) = lookup("WORKER_ID") {
            config.worker_id = val;
        }
        if let Some(val) = lookup("MAX_RETRIES") {
            config.max_retries = parse_env_value(&val, "MAX_RETRIES")?;
        }
        if let Some(val) = lookup("JOB_TIMEOUT") {
            config.job_timeout = parse_env_secs(&val, "JOB_TIMEOUT")?;
        }
        if let Some(val) = lookup("DEQUEUE_TIMEOUT") {
            config.dequeue_timeout = parse_env_secs(&val, "DEQUEUE_TIMEOUT")?;
        }
        if let Some(val) = lookup("RECONNECT_DELAY") {
            config.reconnect_delay = parse_env_secs(&val, "RECONNECT_DELAY")?;
        }
        if let Some(val) = lookup("RECONNECT_ATTEMPTS") {
            config.reconnect_attempts = parse_env_value(&val, "RECONNECT_ATTEMPTS")?;
        }

        // Engine settings
        if let Some(val) = lookup("ENGINE") {
            config.engine = val.parse().map_err(|message| ConfigError::InvalidValue {
                key: "ENGINE".to_string(),
                message,
            })?;
        }
        if let Some(val) = lookup("ENGINE_COMMAND").filter(|v| !v.trim().is_empty()) {
            config.engine_command = Some(val);
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.redis_url.is_none() && self.redis_host.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "redis_host cannot be empty".to_string(),
            ));
        }

        if self.queue_name.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "queue_name cannot be empty".to_string(),
            ));
        }

        if self.worker_id.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "worker_id cannot be empty".to_string(),
            ));
        }

        if self.job_timeout.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "job_timeout must be greater than 0".to_string(),
            ));
        }

        if self.dequeue_timeout.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "dequeue_timeout must be greater than 0".to_string(),
            ));
        }

        if self.reconnect_attempts == 0 {
            return Err(ConfigError::ValidationFailed(
                "reconnect_attempts must be greater than 0".to_string(),
            ));
        }

        if self.upload_dir == self.output_dir {
            return Err(ConfigError::ValidationFailed(
                "upload_dir and output_dir must differ".to_string(),
            ));
        }

        Ok(())
    }

    /// Connection URL for the Redis backend.
    pub fn redis_url(&self) -> String {
        match &self.redis_url {
            Some(url) => url.clone(),
            None => format!(
                "redis://{}:{}/{}",
                self.redis_host, self.redis_port, self.redis_db
            ),
        }
    }

    /// Creates the upload and output directories if needed.
    pub fn ensure_dirs(&self) -> Result<(), ConfigError> {
        std::fs::create_dir_all(&self.upload_dir)?;
        std::fs::create_dir_all(&self.output_dir)?;
        Ok(())
    }

    pub fn with_redis_url(mut self, url: impl Into<String>) -> Self {
        self.redis_url = Some(url.into());
        self
    }

    pub fn with_queue_name(mut self, name: impl Into<String>) -> Self {
        self.queue_name = name.into();
        self
    }

    pub fn with_upload_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.upload_dir = path.into();
        self
    }

    pub fn with_output_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.output_dir = path.into();
        self
    }

    pub fn with_worker_id(mut self, id: impl Into<String>) -> Self {
        self.worker_id = id.into();
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = timeout;
        self
    }

    pub fn with_dequeue_timeout(mut self, timeout: Duration) -> Self {
        self.dequeue_timeout = timeout;
        self
    }

    pub fn with_reconnect(mut self, delay: Duration, attempts: u32) -> Self {
        self.reconnect_delay = delay;
        self.reconnect_attempts = attempts;
        self
    }

    pub fn with_engine(mut self, engine: EngineKind) -> Self {
        self.engine = engine;
        self
    }

    pub fn with_engine_command(mut self, command: impl Into<String>) -> Self {
        self.engine_command = Some(command.into());
        self
    }
}

/// Parse an environment variable value into a type.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

/// Parse an environment variable holding whole or fractional seconds.
fn parse_env_secs(value: &str, key: &str) -> Result<Duration, ConfigError> {
    let secs: f64 = parse_env_value(value, key)?;
    Duration::try_from_secs_f64(secs).map_err(|e| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("'{}' is not a usable number of seconds: {}", value, e),
    })
}
