use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::Utc;
use tracing::{debug, warn};

use crate::analyzer::manifest::ProcessingStep;
use crate::broadcast::job_progress::{JobPhase, JobProgressTracker};
use crate::error::{AnalyzeError, QueueError};
use crate::queue::Broker;

/// Events emitted while a job is processed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressEvent {
    Phase {
        phase: JobPhase,
        /// Percent complete; never lowered by reporters.
        progress: u8,
        message: String,
    },
    Completed {
        manifest_path: String,
    },
    Failed {
        error: String,
    },
}

impl ProgressEvent {
    /// A phase event at the phase's own checkpoint percentage.
    pub fn phase(phase: JobPhase, message: impl Into<String>) -> Self {
        Self::at(phase, phase.percent(), message)
    }

    pub fn at(phase: JobPhase, progress: u8, message: impl Into<String>) -> Self {
        ProgressEvent::Phase {
            phase,
            progress,
            message: message.into(),
        }
    }
}

pub trait ProgressReporter: Send + Sync {
    fn report(&self, event: ProgressEvent);

    /// True once the work being reported on should stop early.
    fn is_cancelled(&self) -> bool {
        false
    }
}

/// Reports `event`, then fails with `Cancelled` if the reporter says the
/// attempt should stop.
pub fn checkpoint(progress: &dyn ProgressReporter, event: ProgressEvent) -> Result<(), AnalyzeError> {
    progress.report(event);
    if progress.is_cancelled() {
        return Err(AnalyzeError::Cancelled("lease was reclaimed".to_string()));
    }
    Ok(())
}

/// No-op reporter for unit tests.
pub struct NoopProgress;

impl ProgressReporter for NoopProgress {
    fn report(&self, _event: ProgressEvent) {}
}

/// Forwards checkpoints to the broker (persisting progress and refreshing
/// the lease heartbeat) and to the broadcast channel.
///
/// Reported values are clamped so the persisted and broadcast progress never
/// decreases within the attempt. Each checkpoint is also kept as a step of
/// the processing timeline.
pub struct BrokerProgress {
    broker: Arc<Broker>,
    job_id: String,
    token: String,
    tracker: Option<JobProgressTracker>,
    last: AtomicU8,
    lease_lost: AtomicBool,
    started: Instant,
    steps: Mutex<Vec<ProcessingStep>>,
}

impl BrokerProgress {
    pub fn new(
        broker: Arc<Broker>,
        job_id: &str,
        token: &str,
        tracker: Option<JobProgressTracker>,
    ) -> Self {
        Self {
            broker,
            job_id: job_id.to_string(),
            token: token.to_string(),
            tracker,
            last: AtomicU8::new(0),
            lease_lost: AtomicBool::new(false),
            started: Instant::now(),
            steps: Mutex::new(Vec::new()),
        }
    }

    /// Highest progress reported so far.
    pub fn current(&self) -> u8 {
        self.last.load(Ordering::SeqCst)
    }

    /// Set once the broker refused an update because the lease was reclaimed.
    pub fn lease_lost(&self) -> bool {
        self.lease_lost.load(Ordering::SeqCst)
    }

    /// Re-checks the lease with the broker, refreshing its heartbeat.
    ///
    /// Callers confirm before touching shared job outputs, since a reclaimed
    /// job's directory belongs to the attempt that now holds the lease.
    pub fn confirm_lease(&self) -> Result<(), QueueError> {
        match self.broker.progress(&self.job_id, &self.token, self.current()) {
            Ok(()) => Ok(()),
            Err(e) => {
                if matches!(e, QueueError::LeaseLost(_) | QueueError::NotActive { .. }) {
                    self.lease_lost.store(true, Ordering::SeqCst);
                }
                Err(e)
            }
        }
    }

    pub fn take_steps(&self) -> Vec<ProcessingStep> {
        self.steps
            .lock()
            .map(|mut steps| std::mem::take(&mut *steps))
            .unwrap_or_default()
    }

    fn record(&self, phase: JobPhase, progress: u8) {
        if let Ok(mut steps) = self.steps.lock() {
            steps.push(ProcessingStep {
                stage: phase.to_string(),
                progress,
                at: Utc::now(),
                offset_ms: self.started.elapsed().as_millis() as u64,
            });
        }
    }
}

impl ProgressReporter for BrokerProgress {
    fn is_cancelled(&self) -> bool {
        self.lease_lost()
    }

    fn report(&self, event: ProgressEvent) {
        match event {
            ProgressEvent::Phase {
                phase,
                progress,
                message,
            } => {
                let requested = progress.min(100);
                let previous = self.last.fetch_max(requested, Ordering::SeqCst);
                let effective = previous.max(requested);
                self.record(phase, effective);

                match self.broker.progress(&self.job_id, &self.token, effective) {
                    Ok(()) => debug!(job_id = %self.job_id, progress = effective, "{}", message),
                    Err(QueueError::LeaseLost(_)) | Err(QueueError::NotActive { .. }) => {
                        if !self.lease_lost.swap(true, Ordering::SeqCst) {
                            warn!(job_id = %self.job_id, "Lease lost while processing");
                        }
                    }
                    Err(e) => warn!(job_id = %self.job_id, "Failed to record progress: {}", e),
                }
                if let Some(tracker) = &self.tracker {
                    tracker.update(phase, effective, &message);
                }
            }
            ProgressEvent::Completed { manifest_path } => {
                if let Some(tracker) = &self.tracker {
                    tracker.completed(&manifest_path);
                }
            }
            ProgressEvent::Failed { error } => {
                if let Some(tracker) = &self.tracker {
                    tracker.failed(self.current(), &error);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::JobProgressBroadcaster;
    use crate::db::Database;
    use crate::queue::{BrokerConfig, JobOptions, JobPayload};
    use std::path::PathBuf;

    fn leased() -> (Arc<Broker>, String) {
        let broker = Broker::open(Database::open_in_memory().unwrap(), BrokerConfig::default()).unwrap();
        let id = broker
            .enqueue(
                None,
                JobPayload::new(PathBuf::from("/in/a.pdf"), "a.pdf", 1),
                JobOptions::default(),
            )
            .unwrap();
        broker.lease("w").unwrap().unwrap();
        (Arc::new(broker), id)
    }

    #[test]
    fn test_forwards_and_never_lowers() {
        let (broker, id) = leased();
        let broadcaster = JobProgressBroadcaster::new(16);
        let mut rx = broadcaster.subscribe();
        let progress = BrokerProgress::new(
            Arc::clone(&broker),
            &id,
            "w",
            Some(broadcaster.start_job(&id, "a.pdf")),
        );

        progress.report(ProgressEvent::phase(JobPhase::Dimensions, "dims"));
        progress.report(ProgressEvent::at(JobPhase::Masks, 10, "late low value"));

        assert_eq!(progress.current(), 25);
        assert_eq!(broker.get(&id).unwrap().unwrap().progress, 25);
        assert_eq!(rx.try_recv().unwrap().progress, 25);
        assert_eq!(rx.try_recv().unwrap().progress, 25);

        let steps = progress.take_steps();
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0].stage, JobPhase::Dimensions.to_string());
    }

    #[test]
    fn test_flags_lost_lease() {
        let (broker, id) = leased();
        let progress = BrokerProgress::new(Arc::clone(&broker), &id, "someone-else", None);
        progress.report(ProgressEvent::phase(JobPhase::Validated, "validated"));
        assert!(progress.lease_lost());
        assert!(progress.is_cancelled());
        assert_eq!(broker.get(&id).unwrap().unwrap().progress, 0);
    }

    #[test]
    fn test_checkpoint_stops_after_lost_lease() {
        let (broker, id) = leased();
        let owner = BrokerProgress::new(Arc::clone(&broker), &id, "w", None);
        assert!(checkpoint(&owner, ProgressEvent::phase(JobPhase::Validated, "ok")).is_ok());
        assert!(owner.confirm_lease().is_ok());

        let stale = BrokerProgress::new(Arc::clone(&broker), &id, "stale", None);
        let err = checkpoint(&stale, ProgressEvent::phase(JobPhase::Validated, "stale")).unwrap_err();
        assert!(matches!(err, AnalyzeError::Cancelled(_)));
        assert!(matches!(stale.confirm_lease(), Err(QueueError::LeaseLost(_))));
    }

    #[test]
    fn test_confirm_lease_after_completion_flags_loss() {
        let (broker, id) = leased();
        let progress = BrokerProgress::new(Arc::clone(&broker), &id, "w", None);
        broker.ack(&id, "w", &serde_json::json!({})).unwrap();

        assert!(progress.confirm_lease().is_err());
        assert!(progress.lease_lost());
    }
}
