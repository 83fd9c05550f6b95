//! Facade used by the upload gateway and by maintenance callers.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::analyzer::manifest::Manifest;
use crate::error::QueueError;

use super::broker::Broker;
use super::job::{Job, JobOptions, JobPayload, JobState, ProcessingOptions};
use super::maintenance::QueueCounts;

/// One document handed over by the gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub file_path: PathBuf,
    pub original_name: String,
    pub file_size: u64,
    /// Falls back to the service's default options when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<ProcessingOptions>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submitter: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubmitReceipt {
    pub id: String,
    pub status: PublicState,
}

/// Job state as exposed to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PublicState {
    Queued,
    Processing,
    Completed,
    Failed,
    Delayed,
    Paused,
    Unknown,
}

impl PublicState {
    fn of(state: JobState, queue_paused: bool) -> Self {
        match state {
            JobState::Waiting if queue_paused => PublicState::Paused,
            JobState::Waiting => PublicState::Queued,
            JobState::Active => PublicState::Processing,
            JobState::Delayed => PublicState::Delayed,
            JobState::Completed => PublicState::Completed,
            JobState::Failed => PublicState::Failed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatusView {
    pub id: String,
    pub state: PublicState,
    pub progress: u8,
    pub attempts_made: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub submitted_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl JobStatusView {
    fn unknown(id: &str) -> Self {
        Self {
            id: id.to_string(),
            state: PublicState::Unknown,
            progress: 0,
            attempts_made: 0,
            submitted_at: None,
            started_at: None,
            finished_at: None,
            error: None,
        }
    }

    fn from_job(job: Job, queue_paused: bool) -> Self {
        Self {
            state: PublicState::of(job.state, queue_paused),
            progress: job.progress,
            attempts_made: job.attempts_made,
            submitted_at: Some(job.submitted_at),
            started_at: job.started_at,
            finished_at: job.finished_at,
            error: job.failure_reason,
            id: job.id,
        }
    }
}

pub struct JobService {
    broker: Arc<Broker>,
    defaults: JobOptions,
    default_options: ProcessingOptions,
}

impl JobService {
    pub fn new(broker: Arc<Broker>, defaults: JobOptions) -> Self {
        Self {
            broker,
            defaults,
            default_options: ProcessingOptions::default(),
        }
    }

    pub fn with_default_options(mut self, options: ProcessingOptions) -> Self {
        self.default_options = options;
        self
    }

    pub fn broker(&self) -> &Arc<Broker> {
        &self.broker
    }

    pub fn submit(&self, request: SubmitRequest) -> Result<SubmitReceipt, QueueError> {
        let mut payload = JobPayload::new(request.file_path, request.original_name, request.file_size)
            .with_options(request.options.unwrap_or_else(|| self.default_options.clone()));
        payload.submitter = request.submitter;

        let id = self.broker.enqueue(request.id, payload, self.defaults)?;
        info!(job_id = %id, "Job submitted");
        Ok(SubmitReceipt {
            id,
            status: PublicState::Queued,
        })
    }

    /// Unknown ids report `unknown` rather than an error.
    pub fn status(&self, id: &str) -> Result<JobStatusView, QueueError> {
        match self.broker.get(id)? {
            Some(job) => {
                let paused = job.state == JobState::Waiting && self.broker.is_paused()?;
                Ok(JobStatusView::from_job(job, paused))
            }
            None => Ok(JobStatusView::unknown(id)),
        }
    }

    pub fn result(&self, id: &str) -> Result<Manifest, QueueError> {
        let job = self
            .broker
            .get(id)?
            .ok_or_else(|| QueueError::NotFound(id.to_string()))?;
        match (job.state, job.result) {
            (JobState::Completed, Some(result)) => Ok(serde_json::from_value(result)?),
            (state, _) => Err(QueueError::NotCompleted {
                id: id.to_string(),
                state: state.to_string(),
            }),
        }
    }

    pub fn pause(&self) -> Result<(), QueueError> {
        self.broker.pause()
    }

    pub fn force_resume(&self) -> Result<bool, QueueError> {
        self.broker.force_resume()
    }

    pub fn purge_older_than(&self, state: JobState, max_age: Duration) -> Result<usize, QueueError> {
        self.broker.purge_older_than(state, max_age)
    }

    pub fn list_by_state(&self, state: JobState) -> Result<Vec<Job>, QueueError> {
        self.broker.list_by_state(state)
    }

    pub fn purge_expired(&self) -> Result<usize, QueueError> {
        self.broker.purge_expired()
    }

    pub fn counts(&self) -> Result<QueueCounts, QueueError> {
        self.broker.counts()
    }
}
