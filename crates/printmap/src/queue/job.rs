use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::db::job_repo::JobRow;
use crate::error::QueueError;

/// Position of a job in the broker's lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Waiting,
    Active,
    Delayed,
    Completed,
    Failed,
}

impl JobState {
    pub const ALL: [JobState; 5] = [
        JobState::Waiting,
        JobState::Active,
        JobState::Delayed,
        JobState::Completed,
        JobState::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Waiting => "waiting",
            JobState::Active => "active",
            JobState::Delayed => "delayed",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }

    /// Completed and failed jobs no longer move.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "waiting" => Ok(JobState::Waiting),
            "active" => Ok(JobState::Active),
            "delayed" => Ok(JobState::Delayed),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            other => Err(QueueError::InvalidState(other.to_string())),
        }
    }
}

/// Per-document analysis options supplied at submission time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingOptions {
    /// Raster resolution in dots per inch.
    #[serde(default = "default_resolution")]
    pub resolution: u32,
    /// Read declared optional-content layers.
    #[serde(default = "default_true")]
    pub enable_layer_mode: bool,
    /// Reserved for die-cut vector extraction (currently stubbed).
    #[serde(default)]
    pub enable_vector_extraction: bool,
    /// Options the core does not interpret, carried through untouched.
    #[serde(flatten, default)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

fn default_resolution() -> u32 {
    300
}

fn default_true() -> bool {
    true
}

impl Default for ProcessingOptions {
    fn default() -> Self {
        Self {
            resolution: default_resolution(),
            enable_layer_mode: true,
            enable_vector_extraction: false,
            extra: BTreeMap::new(),
        }
    }
}

/// What the gateway hands over for one uploaded document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobPayload {
    pub file_path: PathBuf,
    pub original_name: String,
    pub file_size: u64,
    #[serde(default)]
    pub options: ProcessingOptions,
    pub submitted_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submitter: Option<String>,
}

impl JobPayload {
    pub fn new(file_path: PathBuf, original_name: impl Into<String>, file_size: u64) -> Self {
        Self {
            file_path,
            original_name: original_name.into(),
            file_size,
            options: ProcessingOptions::default(),
            submitted_at: Utc::now(),
            submitter: None,
        }
    }

    pub fn with_options(mut self, options: ProcessingOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_submitter(mut self, submitter: impl Into<String>) -> Self {
        self.submitter = Some(submitter.into());
        self
    }
}

/// Delivery options for a single job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobOptions {
    /// Total attempts allowed, including the first.
    pub attempts: u32,
    /// Base delay for exponential backoff between attempts.
    pub backoff: Duration,
    /// How long a finished job is kept before the TTL sweep may delete it.
    pub ttl: Option<Duration>,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_secs(5),
            ttl: None,
        }
    }
}

/// A job as read back from the store.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: String,
    pub state: JobState,
    pub payload: JobPayload,
    pub attempts_made: u32,
    pub max_attempts: u32,
    pub progress: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    pub stall_count: u32,
    pub submitted_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub available_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn from_row(row: &JobRow) -> Result<Self, QueueError> {
        let result = row
            .result
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?;

        Ok(Self {
            id: row.id.clone(),
            state: row.state.parse()?,
            payload: serde_json::from_str(&row.payload)?,
            attempts_made: row.attempts_made,
            max_attempts: row.max_attempts,
            progress: row.progress,
            result,
            failure_reason: row.failure_reason.clone(),
            stall_count: row.stall_count,
            submitted_at: from_millis(row.submitted_at),
            started_at: row.started_at.map(from_millis),
            finished_at: row.finished_at.map(from_millis),
            available_at: row.available_at.map(from_millis),
        })
    }
}

/// A job plus the token proving this worker holds its lease.
#[derive(Debug, Clone)]
pub struct LeasedJob {
    pub job: Job,
    pub token: String,
}

impl LeasedJob {
    pub fn id(&self) -> &str {
        &self.job.id
    }
}

/// Milliseconds since the epoch, the store's time unit.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

pub fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

pub fn duration_millis(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}
