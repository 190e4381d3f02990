//! Job records as stored in the job store.
//!
//! A job is persisted as a flat field map (a Redis hash in production), so
//! that individual fields can be written atomically without rewriting the
//! whole record. [`Job::to_fields`] and [`Job::from_fields`] define that
//! layout; [`JobUpdate`] describes a partial write.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::params::JobParams;

pub const FIELD_JOB_ID: &str = "job_id";
pub const FIELD_STATUS: &str = "status";
pub const FIELD_FILENAME: &str = "filename";
pub const FIELD_PROGRESS: &str = "progress";
pub const FIELD_MESSAGE: &str = "message";
pub const FIELD_STEMS: &str = "stems";
pub const FIELD_RETRY_COUNT: &str = "retry_count";
pub const FIELD_PARAMS: &str = "params";
pub const FIELD_DEAD_LETTERED: &str = "dead_lettered";
pub const FIELD_CREATED_AT: &str = "created_at";
pub const FIELD_UPDATED_AT: &str = "updated_at";

/// Message stored on a freshly created job.
pub const QUEUED_MESSAGE: &str = "Job queued for processing";

/// Persisted status of a job.
///
/// A dead-lettered job is stored as `Failed`; the distinction lives in the
/// dead-letter list and the internal `dead_lettered` marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(format!("unknown status '{}'", other)),
        }
    }
}

/// A stem separation job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub status: JobStatus,
    /// Original name of the uploaded file. Never changes.
    pub filename: String,
    /// Completion percentage, 0 to 100.
    pub progress: f64,
    pub message: String,
    /// Stem names, populated only once the job has completed.
    pub stems: Vec<String>,
    pub retry_count: u32,
    pub params: JobParams,
    /// Set when the retry budget is exhausted and the id was dead-lettered.
    pub dead_lettered: bool,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Creates a new queued job.
    pub fn new(id: impl Into<String>, filename: impl Into<String>, params: JobParams) -> Self {
        Self {
            id: id.into(),
            status: JobStatus::Queued,
            filename: filename.into(),
            progress: 0.0,
            message: QUEUED_MESSAGE.to_string(),
            stems: Vec::new(),
            retry_count: 0,
            params,
            dead_lettered: false,
            created_at: Some(Utc::now()),
            updated_at: None,
        }
    }

    /// Serializes the job into its stored field map.
    pub fn to_fields(&self) -> Result<Vec<(&'static str, String)>, serde_json::Error> {
        let mut fields = vec![
            (FIELD_JOB_ID, self.id.clone()),
            (FIELD_STATUS, self.status.as_str().to_string()),
            (FIELD_FILENAME, self.filename.clone()),
            (FIELD_PROGRESS, self.progress.to_string()),
            (FIELD_MESSAGE, self.message.clone()),
            (FIELD_STEMS, serde_json::to_string(&self.stems)?),
            (FIELD_RETRY_COUNT, self.retry_count.to_string()),
            (FIELD_PARAMS, serde_json::to_string(&self.params)?),
            (FIELD_DEAD_LETTERED, bool_field(self.dead_lettered)),
        ];
        if let Some(created_at) = self.created_at {
            fields.push((FIELD_CREATED_AT, created_at.to_rfc3339()));
        }
        if let Some(updated_at) = self.updated_at {
            fields.push((FIELD_UPDATED_AT, updated_at.to_rfc3339()));
        }
        Ok(fields)
    }

    /// Parses a stored field map.
    ///
    /// Returns a human-readable reason when the record is incomplete or
    /// malformed; callers turn it into a corrupt-data error.
    pub fn from_fields(id: &str, fields: &HashMap<String, String>) -> Result<Self, String> {
        let filename = fields
            .get(FIELD_FILENAME)
            .filter(|f| !f.is_empty())
            .ok_or_else(|| "missing filename".to_string())?
            .clone();

        let status = fields
            .get(FIELD_STATUS)
            .ok_or_else(|| "missing status".to_string())?
            .parse::<JobStatus>()?;

        let progress = match fields.get(FIELD_PROGRESS) {
            Some(raw) => raw
                .parse::<f64>()
                .map_err(|_| format!("invalid progress '{}'", raw))?,
            None => 0.0,
        };

        let stems = match fields.get(FIELD_STEMS).filter(|s| !s.is_empty()) {
            Some(raw) => serde_json::from_str::<Vec<String>>(raw)
                .map_err(|e| format!("invalid stems: {}", e))?,
            None => Vec::new(),
        };

        let retry_count = match fields.get(FIELD_RETRY_COUNT) {
            Some(raw) => raw
                .parse::<u32>()
                .map_err(|_| format!("invalid retry_count '{}'", raw))?,
            None => 0,
        };

        let params = match fields.get(FIELD_PARAMS).filter(|s| !s.is_empty()) {
            Some(raw) => serde_json::from_str::<JobParams>(raw)
                .map_err(|e| format!("invalid params: {}", e))?,
            None => JobParams::default(),
        };

        Ok(Self {
            id: id.to_string(),
            status,
            filename,
            progress,
            message: fields.get(FIELD_MESSAGE).cloned().unwrap_or_default(),
            stems,
            retry_count,
            params,
            dead_lettered: fields.get(FIELD_DEAD_LETTERED).map(String::as_str) == Some("1"),
            created_at: parse_timestamp(fields.get(FIELD_CREATED_AT)),
            updated_at: parse_timestamp(fields.get(FIELD_UPDATED_AT)),
        })
    }

    /// Returns the public status view of the job.
    pub fn view(&self) -> JobView {
        JobView {
            job_id: self.id.clone(),
            status: self.status,
            progress: self.progress,
            message: self.message.clone(),
            stems: if self.stems.is_empty() {
                None
            } else {
                Some(self.stems.clone())
            },
        }
    }
}

/// What a status query returns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobView {
    pub job_id: String,
    pub status: JobStatus,
    pub progress: f64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stems: Option<Vec<String>>,
}

/// A partial write to a job record.
///
/// Only the fields that are set are written; everything else on the record
/// is left untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobUpdate {
    pub status: Option<JobStatus>,
    pub progress: Option<f64>,
    pub message: Option<String>,
    pub stems: Option<Vec<String>>,
    pub retry_count: Option<u32>,
}

impl JobUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn progress(mut self, progress: f64) -> Self {
        self.progress = Some(progress.clamp(0.0, 100.0));
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn stems(mut self, stems: Vec<String>) -> Self {
        self.stems = Some(stems);
        self
    }

    pub fn retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = Some(retry_count);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.status.is_none()
            && self.progress.is_none()
            && self.message.is_none()
            && self.stems.is_none()
            && self.retry_count.is_none()
    }

    /// Field/value pairs to write, including the `updated_at` stamp.
    pub fn to_fields(&self) -> Result<Vec<(&'static str, String)>, serde_json::Error> {
        let mut fields = Vec::with_capacity(6);
        if let Some(status) = self.status {
            fields.push((FIELD_STATUS, status.as_str().to_string()));
        }
        if let Some(progress) = self.progress {
            fields.push((FIELD_PROGRESS, progress.to_string()));
        }
        if let Some(ref message) = self.message {
            fields.push((FIELD_MESSAGE, message.clone()));
        }
        if let Some(ref stems) = self.stems {
            fields.push((FIELD_STEMS, serde_json::to_string(stems)?));
        }
        if let Some(retry_count) = self.retry_count {
            fields.push((FIELD_RETRY_COUNT, retry_count.to_string()));
        }
        fields.push((FIELD_UPDATED_AT, Utc::now().to_rfc3339()));
        Ok(fields)
    }
}

fn bool_field(value: bool) -> String {
    if value { "1" } else { "0" }.to_string()
}

fn parse_timestamp(raw: Option<&String>) -> Option<DateTime<Utc>> {
    raw.and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}
