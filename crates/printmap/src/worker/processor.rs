//! One attempt at one leased job, from validation to ack or fail.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tracing::{debug, error, info, info_span, warn};

use crate::analyzer::manifest::{Manifest, ProcessingRecord, ResourceSnapshot};
use crate::analyzer::quality::{self, LOW_QUALITY_THRESHOLD};
use crate::analyzer::Analyzer;
use crate::broadcast::job_progress::{JobPhase, JobProgressBroadcaster};
use crate::error::{AnalyzeError, QueueError};
use crate::pipeline::{checkpoint, BrokerProgress, ProgressEvent, ProgressReporter};
use crate::queue::broker::FailOutcome;
use crate::queue::{Broker, LeasedJob};
use crate::sanitize;
use crate::storage::{ErrorRecord, JobWorkspace, WorkArea};

use super::slot::{SlotHandle, SlotState};

/// How an attempt ended, from this worker's point of view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    Completed,
    Retrying,
    Failed,
    /// The lease was reclaimed before the attempt finished; nothing was
    /// recorded and the job directory was left to the new lease holder.
    Abandoned,
}

pub struct JobProcessor {
    broker: Arc<Broker>,
    analyzer: Arc<Analyzer>,
    work_area: WorkArea,
    broadcaster: Option<JobProgressBroadcaster>,
    worker_name: String,
}

impl JobProcessor {
    pub fn new(
        broker: Arc<Broker>,
        analyzer: Arc<Analyzer>,
        work_area: WorkArea,
        broadcaster: Option<JobProgressBroadcaster>,
        worker_name: impl Into<String>,
    ) -> Self {
        Self {
            broker,
            analyzer,
            work_area,
            broadcaster,
            worker_name: worker_name.into(),
        }
    }

    pub fn broker(&self) -> &Arc<Broker> {
        &self.broker
    }

    pub fn worker_name(&self) -> &str {
        &self.worker_name
    }

    pub fn process(&self, leased: LeasedJob, slot: &SlotHandle) -> ProcessOutcome {
        let job = &leased.job;
        let attempt = job.attempts_made + 1;
        let filename = sanitize::redact_path(std::path::Path::new(&job.payload.original_name));
        let _span = info_span!(
            "job",
            job_id = %job.id,
            filename = %filename,
            source = %sanitize::hash_path(&job.payload.file_path),
            attempt
        )
        .entered();

        let tracker = self
            .broadcaster
            .as_ref()
            .map(|b| b.start_job(&job.id, &job.payload.original_name));
        let progress = BrokerProgress::new(Arc::clone(&self.broker), &job.id, &leased.token, tracker);
        let workspace = self.work_area.job(&job.id).for_attempt(&leased.token);

        info!("Processing job");
        match self.run(&leased, attempt, &workspace, &progress) {
            Ok(manifest) => {
                slot.set(SlotState::Acking);
                self.complete(&leased, &workspace, manifest, &progress)
            }
            Err(AnalyzeError::Cancelled(reason)) => {
                warn!("Stopping attempt: {}", reason);
                discard_scratch(&workspace);
                ProcessOutcome::Abandoned
            }
            Err(e) => {
                slot.set(SlotState::Failing);
                self.fail(&leased, attempt, &workspace, &e, &progress)
            }
        }
    }

    fn run(
        &self,
        leased: &LeasedJob,
        attempt: u32,
        workspace: &JobWorkspace,
        progress: &BrokerProgress,
    ) -> Result<Manifest, AnalyzeError> {
        let started_at = Utc::now();
        let started = Instant::now();
        let payload = &leased.job.payload;

        if !payload.file_path.is_file() {
            return Err(AnalyzeError::InputMissing(payload.file_path.clone()));
        }
        checkpoint(progress, ProgressEvent::phase(JobPhase::Validated, "Input present"))?;

        workspace.prepare()?;
        checkpoint(progress, ProgressEvent::phase(JobPhase::Initialized, "Workspace ready"))?;

        let mut manifest = self.analyzer.analyze(payload, workspace, progress)?;

        checkpoint(progress, ProgressEvent::phase(JobPhase::Finalizing, "Scoring quality"))?;
        let report = quality::assess(&manifest, workspace.root());
        if report.score < LOW_QUALITY_THRESHOLD {
            warn!(score = report.score, warnings = ?report.warnings, "Low quality manifest");
        } else {
            debug!(score = report.score, "Quality assessed");
        }
        manifest.quality = Some(report);
        manifest.processing = Some(ProcessingRecord {
            job_id: leased.job.id.clone(),
            worker: self.worker_name.clone(),
            attempt,
            started_at,
            finished_at: Utc::now(),
            elapsed_ms: started.elapsed().as_millis() as u64,
            steps: progress.take_steps(),
            resources: ResourceSnapshot {
                peak_rss_kb: peak_rss_kb(),
            },
        });

        progress
            .confirm_lease()
            .map_err(|e| AnalyzeError::Cancelled(e.to_string()))?;
        workspace.write_manifest(&manifest)?;
        discard_scratch(workspace);
        progress.report(ProgressEvent::phase(JobPhase::Cleanup, "Done"));
        Ok(manifest)
    }

    fn complete(
        &self,
        leased: &LeasedJob,
        workspace: &JobWorkspace,
        manifest: Manifest,
        progress: &BrokerProgress,
    ) -> ProcessOutcome {
        let result = match serde_json::to_value(&manifest) {
            Ok(v) => v,
            Err(e) => {
                error!("Failed to encode manifest: {}", e);
                return ProcessOutcome::Abandoned;
            }
        };

        match self.broker.ack(leased.id(), &leased.token, &result) {
            Ok(()) => {
                if let Err(e) = workspace.remove_tmp() {
                    warn!("Failed to clean temp area: {}", e);
                }
                let manifest_path = workspace.manifest_path().display().to_string();
                progress.report(ProgressEvent::Completed { manifest_path });
                info!(confidence = manifest.parsing.confidence, "Job completed");
                ProcessOutcome::Completed
            }
            Err(e) => {
                abandon(&e);
                ProcessOutcome::Abandoned
            }
        }
    }

    fn fail(
        &self,
        leased: &LeasedJob,
        attempt: u32,
        workspace: &JobWorkspace,
        err: &AnalyzeError,
        progress: &BrokerProgress,
    ) -> ProcessOutcome {
        let reason = err.to_string();
        warn!(kind = error_kind(err), "Attempt failed: {}", reason);

        // The job directory belongs to whoever holds the lease now.
        if let Err(e) = progress.confirm_lease() {
            abandon(&e);
            discard_scratch(workspace);
            return ProcessOutcome::Abandoned;
        }

        if let Err(e) = workspace.discard_manifest() {
            warn!("Failed to discard manifest: {}", e);
        }
        let record = ErrorRecord {
            job_id: leased.job.id.clone(),
            attempt,
            kind: error_kind(err).to_string(),
            error: reason.clone(),
            progress: progress.current(),
            occurred_at: Utc::now(),
        };
        if let Err(e) = workspace.write_error(&record) {
            warn!("Failed to write error record: {}", e);
        }
        discard_scratch(workspace);
        progress.report(ProgressEvent::Failed {
            error: reason.clone(),
        });

        match self.broker.fail(leased.id(), &leased.token, &reason) {
            Ok(FailOutcome::Retrying { .. }) => ProcessOutcome::Retrying,
            Ok(FailOutcome::Failed { .. }) => {
                if let Err(e) = workspace.remove_tmp() {
                    warn!("Failed to clean temp area: {}", e);
                }
                ProcessOutcome::Failed
            }
            Err(e) => {
                abandon(&e);
                ProcessOutcome::Abandoned
            }
        }
    }
}

fn discard_scratch(workspace: &JobWorkspace) {
    if let Err(e) = workspace.remove_scratch() {
        warn!("Failed to clean attempt scratch: {}", e);
    }
}

fn abandon(err: &QueueError) {
    match err {
        QueueError::LeaseLost(_) | QueueError::NotActive { .. } => {
            warn!("Lease was reclaimed before the attempt finished: {}", err)
        }
        other => error!("Broker rejected the attempt result: {}", other),
    }
}

pub fn error_kind(err: &AnalyzeError) -> &'static str {
    match err {
        AnalyzeError::InputMissing(_) => "InputMissing",
        AnalyzeError::InvalidInput { .. } => "InvalidInput",
        AnalyzeError::RenderFailure(_) => "RenderFailure",
        AnalyzeError::PersistenceFailure { .. } => "PersistenceFailure",
        AnalyzeError::Image(_) => "RenderFailure",
        AnalyzeError::Cancelled(_) => "Cancelled",
    }
}

/// Peak resident set size of this process, where the platform exposes it.
fn peak_rss_kb() -> Option<u64> {
    let status = std::fs::read_to_string("/proc/self/status").ok()?;
    status
        .lines()
        .find_map(|line| line.strip_prefix("VmHWM:"))
        .and_then(|rest| rest.trim().trim_end_matches("kB").trim().parse().ok())
}
