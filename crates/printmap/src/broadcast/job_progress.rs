//! Job progress broadcaster for real-time job status streaming.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Checkpoint within one processing attempt.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobPhase {
    Queued,
    Validated,
    Initialized,
    Parsing,
    Dimensions,
    Layers,
    Masks,
    BaseRaster,
    Manifest,
    Finalizing,
    Cleanup,
    Completed,
    Failed,
}

impl JobPhase {
    /// Progress percentage reached when the phase starts.
    pub fn percent(&self) -> u8 {
        match self {
            JobPhase::Queued => 0,
            JobPhase::Validated => 5,
            JobPhase::Initialized => 10,
            JobPhase::Parsing => 15,
            JobPhase::Dimensions => 25,
            JobPhase::Layers => 35,
            JobPhase::Masks => 35,
            JobPhase::BaseRaster => 80,
            JobPhase::Manifest => 90,
            JobPhase::Finalizing => 95,
            JobPhase::Cleanup | JobPhase::Completed => 100,
            JobPhase::Failed => 0,
        }
    }
}

impl std::fmt::Display for JobPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobPhase::Queued => write!(f, "Queued"),
            JobPhase::Validated => write!(f, "Validated"),
            JobPhase::Initialized => write!(f, "Initialized"),
            JobPhase::Parsing => write!(f, "Parsing"),
            JobPhase::Dimensions => write!(f, "Reading dimensions"),
            JobPhase::Layers => write!(f, "Enumerating layers"),
            JobPhase::Masks => write!(f, "Rendering masks"),
            JobPhase::BaseRaster => write!(f, "Rendering base raster"),
            JobPhase::Manifest => write!(f, "Assembling manifest"),
            JobPhase::Finalizing => write!(f, "Finalizing"),
            JobPhase::Cleanup => write!(f, "Cleaning up"),
            JobPhase::Completed => write!(f, "Completed"),
            JobPhase::Failed => write!(f, "Failed"),
        }
    }
}

/// Status of a job.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Processing,
    Completed,
    Failed,
}

/// Progress event for a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobProgressEvent {
    pub job_id: String,
    /// Original filename being processed.
    pub filename: String,
    pub phase: JobPhase,
    pub status: JobStatus,
    /// Percent complete for the current attempt.
    pub progress: u8,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    /// Manifest location (set on completion).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manifest_path: Option<String>,
    /// Error message (set on failure).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl JobProgressEvent {
    pub fn new(job_id: &str, filename: &str, phase: JobPhase, progress: u8, message: &str) -> Self {
        let status = match phase {
            JobPhase::Completed => JobStatus::Completed,
            JobPhase::Failed => JobStatus::Failed,
            _ => JobStatus::Processing,
        };

        Self {
            job_id: job_id.to_string(),
            filename: filename.to_string(),
            phase,
            status,
            progress: progress.min(100),
            message: message.to_string(),
            timestamp: Utc::now(),
            manifest_path: None,
            error: None,
        }
    }

    pub fn completed(job_id: &str, filename: &str, manifest_path: &str) -> Self {
        Self {
            manifest_path: Some(manifest_path.to_string()),
            ..Self::new(job_id, filename, JobPhase::Completed, 100, "Processing completed successfully")
        }
    }

    /// `progress` is the last value reached before the failure.
    pub fn failed(job_id: &str, filename: &str, progress: u8, error: &str) -> Self {
        Self {
            error: Some(error.to_string()),
            ..Self::new(job_id, filename, JobPhase::Failed, progress, "Processing failed")
        }
    }
}

/// Broadcasts job progress events for streaming.
#[derive(Clone)]
pub struct JobProgressBroadcaster {
    sender: Arc<broadcast::Sender<JobProgressEvent>>,
}

impl JobProgressBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Sends a progress event to all subscribers.
    pub fn send(&self, event: JobProgressEvent) {
        // No active receivers is fine.
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobProgressEvent> {
        self.sender.subscribe()
    }

    /// Creates a tracker for one leased attempt.
    pub fn start_job(&self, job_id: &str, filename: &str) -> JobProgressTracker {
        JobProgressTracker::new(job_id, filename, Arc::clone(&self.sender))
    }
}

impl Default for JobProgressBroadcaster {
    fn default() -> Self {
        Self::new(100)
    }
}

/// Tracks progress for a single job.
pub struct JobProgressTracker {
    job_id: String,
    filename: String,
    sender: Arc<broadcast::Sender<JobProgressEvent>>,
}

impl JobProgressTracker {
    pub fn new(job_id: &str, filename: &str, sender: Arc<broadcast::Sender<JobProgressEvent>>) -> Self {
        Self {
            job_id: job_id.to_string(),
            filename: filename.to_string(),
            sender,
        }
    }

    pub fn update(&self, phase: JobPhase, progress: u8, message: &str) {
        let event = JobProgressEvent::new(&self.job_id, &self.filename, phase, progress, message);
        let _ = self.sender.send(event);
    }

    pub fn completed(&self, manifest_path: &str) {
        let event = JobProgressEvent::completed(&self.job_id, &self.filename, manifest_path);
        let _ = self.sender.send(event);
    }

    pub fn failed(&self, progress: u8, error: &str) {
        let event = JobProgressEvent::failed(&self.job_id, &self.filename, progress, error);
        let _ = self.sender.send(event);
    }
}
