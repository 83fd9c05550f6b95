//! The queue broker: ordering, leasing, retry and stall handling over the
//! job store.
//!
//! Every operation that reads and then writes a job runs inside one
//! `BEGIN IMMEDIATE` transaction, so the store (not the workers) enforces
//! mutual exclusion per job id, across threads and processes alike.

use std::time::Duration;

use tracing::{debug, info, warn};

use crate::db::job_repo::{self, JobRow};
use crate::db::Database;
use crate::error::QueueError;

use super::control::{read_paused, QueueControl};
use super::job::{duration_millis, now_millis, Job, JobOptions, JobPayload, JobState, LeasedJob};

/// Reason recorded when a job keeps stalling.
pub const STALLED_REASON: &str = "job stalled more than the allowable limit";

/// How many finished jobs of each kind are kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Retention {
    pub completed: u64,
    pub failed: u64,
}

impl Default for Retention {
    fn default() -> Self {
        Self {
            completed: 100,
            failed: 500,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// A lease with no heartbeat for this long is presumed dead.
    pub stall_interval: Duration,
    /// Stall reclaims allowed before the job is failed outright.
    pub max_stalled_count: u32,
    pub retention: Retention,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            stall_interval: Duration::from_secs(300),
            max_stalled_count: 1,
            retention: Retention::default(),
        }
    }
}

/// What `fail` decided for the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// Parked in `delayed`; eligible again after `delay`.
    Retrying { attempts_made: u32, delay: Duration },
    /// Attempt budget exhausted; the job is in `failed`.
    Failed { attempts_made: u32 },
}

/// Result of one stall sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StallReport {
    pub requeued: Vec<String>,
    pub failed: Vec<String>,
}

/// Delay before retry after `attempts_made` failed attempts:
/// `base * 2^(attempts_made - 1)`.
pub fn backoff_delay(base: Duration, attempts_made: u32) -> Duration {
    let exponent = attempts_made.saturating_sub(1).min(31);
    base.saturating_mul(1u32 << exponent)
}

pub struct Broker {
    db: Database,
    control: QueueControl,
    config: BrokerConfig,
}

impl Broker {
    /// Opens the broker over `db`.
    ///
    /// Always resumes the queue: a pause persisted by an earlier run never
    /// carries over into a fresh start.
    pub fn open(db: Database, config: BrokerConfig) -> Result<Self, QueueError> {
        let control = QueueControl::new(db.clone());
        if control.is_paused()? {
            warn!("Queue was left paused by a previous run; resuming");
        }
        control.resume()?;

        Ok(Self {
            db,
            control,
            config,
        })
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub(crate) fn database(&self) -> &Database {
        &self.db
    }

    /// Adds a job to the waiting list and returns its id.
    ///
    /// A caller-supplied id that belongs to an unfinished job is rejected;
    /// one that belongs to a finished job replaces it.
    pub fn enqueue(
        &self,
        id: Option<String>,
        payload: JobPayload,
        options: JobOptions,
    ) -> Result<String, QueueError> {
        let id = id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let payload_json = serde_json::to_string(&payload)?;
        let now = now_millis();

        self.db.with_tx(|tx| {
            if let Some(existing) = job_repo::find_by_id(tx, &id)? {
                let state: JobState = existing.state.parse()?;
                if !state.is_terminal() {
                    return Err(QueueError::DuplicateId(id.clone()));
                }
                debug!(job_id = %id, previous = %state, "Replacing finished job");
                job_repo::delete(tx, &id)?;
            }

            let row = JobRow {
                id: id.clone(),
                seq: job_repo::next_seq(tx)?,
                state: JobState::Waiting.as_str().to_string(),
                payload: payload_json,
                max_attempts: options.attempts.max(1),
                attempts_made: 0,
                backoff_ms: duration_millis(options.backoff),
                ttl_ms: options.ttl.map(duration_millis),
                progress: 0,
                result: None,
                failure_reason: None,
                lease_token: None,
                heartbeat_at: None,
                available_at: None,
                submitted_at: payload.submitted_at.timestamp_millis(),
                started_at: None,
                finished_at: None,
                updated_at: now,
                stall_count: 0,
            };
            job_repo::insert(tx, &row)?;
            Ok(())
        })?;

        info!(job_id = %id, "Job enqueued");
        Ok(id)
    }

    /// Claims the oldest eligible job for `worker_token`.
    ///
    /// Returns `None` when the queue is paused or nothing is eligible. Delayed
    /// jobs whose backoff has elapsed become eligible here, ordered by their
    /// original submission.
    pub fn lease(&self, worker_token: &str) -> Result<Option<LeasedJob>, QueueError> {
        let now = now_millis();

        let leased = self.db.with_tx(|tx| {
            if read_paused(tx)? {
                return Ok(None);
            }

            let promoted = job_repo::promote_due_delayed(tx, now)?;
            if promoted > 0 {
                debug!(count = promoted, "Promoted delayed jobs");
            }

            let Some(row) = job_repo::oldest_waiting(tx)? else {
                return Ok(None);
            };
            if job_repo::mark_active(tx, &row.id, worker_token, now)? == 0 {
                return Ok(None);
            }

            let row = job_repo::find_by_id(tx, &row.id)?
                .ok_or_else(|| QueueError::NotFound(row.id.clone()))?;
            Ok::<_, QueueError>(Some(Job::from_row(&row)?))
        })?;

        Ok(leased.map(|job| {
            debug!(job_id = %job.id, worker = %worker_token, "Job leased");
            LeasedJob {
                job,
                token: worker_token.to_string(),
            }
        }))
    }

    /// Marks an active job completed with `result`, then trims the completed
    /// list to its retention count.
    pub fn ack(&self, id: &str, token: &str, result: &serde_json::Value) -> Result<(), QueueError> {
        let result_json = serde_json::to_string(result)?;
        let now = now_millis();
        let keep = self.config.retention.completed;

        self.db.with_tx(|tx| {
            Self::check_lease(tx, id, token)?;
            job_repo::mark_completed(tx, id, token, &result_json, now)?;
            let trimmed = job_repo::trim_state(tx, JobState::Completed.as_str(), keep)?;
            if trimmed > 0 {
                debug!(count = trimmed, "Trimmed completed jobs");
            }
            Ok::<_, QueueError>(())
        })?;

        info!(job_id = %id, "Job completed");
        Ok(())
    }

    /// Records a failed attempt. Retries with exponential backoff while
    /// attempts remain; otherwise the job becomes permanently failed.
    pub fn fail(&self, id: &str, token: &str, reason: &str) -> Result<FailOutcome, QueueError> {
        let now = now_millis();
        let keep = self.config.retention.failed;

        let outcome = self.db.with_tx(|tx| {
            let row = Self::check_lease(tx, id, token)?;
            let attempts_made = row.attempts_made + 1;

            if attempts_made < row.max_attempts {
                let base = Duration::from_millis(u64::try_from(row.backoff_ms).unwrap_or(0));
                let delay = backoff_delay(base, attempts_made);
                let available_at = now.saturating_add(duration_millis(delay));
                job_repo::mark_delayed(tx, id, token, attempts_made, available_at, now)?;
                job_repo::set_failure_reason(tx, id, reason)?;
                Ok::<_, QueueError>(FailOutcome::Retrying {
                    attempts_made,
                    delay,
                })
            } else {
                job_repo::mark_failed(tx, id, Some(token), attempts_made, reason, now)?;
                job_repo::trim_state(tx, JobState::Failed.as_str(), keep)?;
                Ok(FailOutcome::Failed { attempts_made })
            }
        })?;

        match outcome {
            FailOutcome::Retrying {
                attempts_made,
                delay,
            } => warn!(
                job_id = %id,
                attempts_made,
                delay_ms = delay.as_millis() as u64,
                "Job attempt failed, retrying: {}",
                reason
            ),
            FailOutcome::Failed { attempts_made } => warn!(
                job_id = %id,
                attempts_made,
                "Job failed permanently: {}",
                reason
            ),
        }
        Ok(outcome)
    }

    /// Raises the job's progress to `pct` (clamped to 100) and refreshes the
    /// lease heartbeat. Lower values than the current progress are ignored.
    pub fn progress(&self, id: &str, token: &str, pct: u8) -> Result<(), QueueError> {
        let now = now_millis();
        let pct = pct.min(100);
        self.db.with_tx(|tx| {
            Self::check_lease(tx, id, token)?;
            job_repo::update_progress(tx, id, token, pct, now)?;
            Ok(())
        })
    }

    pub fn pause(&self) -> Result<(), QueueError> {
        self.control.pause()?;
        info!("Queue paused");
        Ok(())
    }

    pub fn resume(&self) -> Result<(), QueueError> {
        self.control.resume()?;
        info!("Queue resumed");
        Ok(())
    }

    pub fn is_paused(&self) -> Result<bool, QueueError> {
        Ok(self.control.is_paused()?)
    }

    /// Reclaims leases whose heartbeat is older than the stall interval.
    ///
    /// Each reclaim counts against the job; past `max_stalled_count` the job
    /// fails instead of going back to waiting.
    pub fn check_stalled(&self) -> Result<StallReport, QueueError> {
        let now = now_millis();
        let cutoff = now - duration_millis(self.config.stall_interval);
        let max_stalled = self.config.max_stalled_count;
        let keep = self.config.retention.failed;

        let report = self.db.with_tx(|tx| {
            let mut report = StallReport::default();
            for row in job_repo::find_stalled(tx, cutoff)? {
                let stall_count = row.stall_count + 1;
                if stall_count > max_stalled {
                    job_repo::mark_failed(tx, &row.id, None, row.attempts_made, STALLED_REASON, now)?;
                    report.failed.push(row.id);
                } else {
                    job_repo::requeue_stalled(tx, &row.id, stall_count, now)?;
                    report.requeued.push(row.id);
                }
            }
            if !report.failed.is_empty() {
                job_repo::trim_state(tx, JobState::Failed.as_str(), keep)?;
            }
            Ok::<_, QueueError>(report)
        })?;

        for id in &report.requeued {
            warn!(job_id = %id, "Stalled job returned to waiting");
        }
        for id in &report.failed {
            warn!(job_id = %id, "Stalled job failed");
        }
        Ok(report)
    }

    /// Reads a job by id.
    pub fn get(&self, id: &str) -> Result<Option<Job>, QueueError> {
        let row = self.db.with_conn(|conn| job_repo::find_by_id(conn, id))?;
        row.as_ref().map(Job::from_row).transpose()
    }

    /// Ensures `token` still holds the lease on active job `id`.
    fn check_lease(conn: &rusqlite::Connection, id: &str, token: &str) -> Result<JobRow, QueueError> {
        let row = job_repo::find_by_id(conn, id)?.ok_or_else(|| QueueError::NotFound(id.to_string()))?;
        if row.state != JobState::Active.as_str() {
            return Err(QueueError::NotActive {
                id: id.to_string(),
                state: row.state,
            });
        }
        if row.lease_token.as_deref() != Some(token) {
            return Err(QueueError::LeaseLost(id.to_string()));
        }
        Ok(row)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn broker_with(config: BrokerConfig) -> Broker {
        Broker::open(Database::open_in_memory().unwrap(), config).unwrap()
    }

    fn broker() -> Broker {
        broker_with(BrokerConfig::default())
    }

    fn payload(name: &str) -> JobPayload {
        JobPayload::new(PathBuf::from(format!("/uploads/{}", name)), name, 10)
    }

    fn opts(attempts: u32, backoff_ms: u64) -> JobOptions {
        JobOptions {
            attempts,
            backoff: Duration::from_millis(backoff_ms),
            ttl: None,
        }
    }

    #[test]
    fn test_backoff_delay_doubles() {
        let base = Duration::from_millis(100);
        assert_eq!(backoff_delay(base, 1), Duration::from_millis(100));
        assert_eq!(backoff_delay(base, 2), Duration::from_millis(200));
        assert_eq!(backoff_delay(base, 3), Duration::from_millis(400));
        assert_eq!(backoff_delay(base, 5), Duration::from_millis(1600));
    }

    #[test]
    fn test_enqueue_generates_id() {
        let broker = broker();
        let id = broker.enqueue(None, payload("a.pdf"), JobOptions::default()).unwrap();
        assert!(!id.is_empty());
        let job = broker.get(&id).unwrap().unwrap();
        assert_eq!(job.state, JobState::Waiting);
        assert_eq!(job.max_attempts, 3);
        assert_eq!(job.payload.original_name, "a.pdf");
    }

    #[test]
    fn test_enqueue_rejects_duplicate_unfinished_id() {
        let broker = broker();
        broker
            .enqueue(Some("dup".into()), payload("a.pdf"), JobOptions::default())
            .unwrap();
        let err = broker
            .enqueue(Some("dup".into()), payload("b.pdf"), JobOptions::default())
            .unwrap_err();
        assert!(matches!(err, QueueError::DuplicateId(id) if id == "dup"));
    }

    #[test]
    fn test_enqueue_replaces_finished_job() {
        let broker = broker();
        broker
            .enqueue(Some("again".into()), payload("a.pdf"), JobOptions::default())
            .unwrap();
        let leased = broker.lease("w").unwrap().unwrap();
        broker.ack(leased.id(), "w", &serde_json::json!({})).unwrap();

        broker
            .enqueue(Some("again".into()), payload("b.pdf"), JobOptions::default())
            .unwrap();
        let job = broker.get("again").unwrap().unwrap();
        assert_eq!(job.state, JobState::Waiting);
        assert_eq!(job.payload.original_name, "b.pdf");
    }

    #[test]
    fn test_lease_is_fifo() {
        let broker = broker();
        let first = broker.enqueue(None, payload("1.pdf"), JobOptions::default()).unwrap();
        let second = broker.enqueue(None, payload("2.pdf"), JobOptions::default()).unwrap();

        assert_eq!(broker.lease("w").unwrap().unwrap().id(), first);
        assert_eq!(broker.lease("w").unwrap().unwrap().id(), second);
        assert!(broker.lease("w").unwrap().is_none());
    }

    #[test]
    fn test_lease_respects_pause() {
        let broker = broker();
        broker.enqueue(None, payload("a.pdf"), JobOptions::default()).unwrap();
        broker.pause().unwrap();
        assert!(broker.lease("w").unwrap().is_none());
        broker.resume().unwrap();
        assert!(broker.lease("w").unwrap().is_some());
    }

    #[test]
    fn test_ack_completes_and_stores_result() {
        let broker = broker();
        let id = broker.enqueue(None, payload("a.pdf"), JobOptions::default()).unwrap();
        let leased = broker.lease("w").unwrap().unwrap();
        broker
            .ack(leased.id(), &leased.token, &serde_json::json!({"ok": true}))
            .unwrap();

        let job = broker.get(&id).unwrap().unwrap();
        assert_eq!(job.state, JobState::Completed);
        assert_eq!(job.progress, 100);
        assert_eq!(job.result, Some(serde_json::json!({"ok": true})));
        assert!(job.finished_at.is_some());
    }

    #[test]
    fn test_ack_requires_active_lease() {
        let broker = broker();
        let id = broker.enqueue(None, payload("a.pdf"), JobOptions::default()).unwrap();
        let err = broker.ack(&id, "w", &serde_json::json!({})).unwrap_err();
        assert!(matches!(err, QueueError::NotActive { .. }));

        broker.lease("w").unwrap();
        let err = broker.ack(&id, "intruder", &serde_json::json!({})).unwrap_err();
        assert!(matches!(err, QueueError::LeaseLost(_)));
    }

    #[test]
    fn test_completed_retention_drops_oldest() {
        let broker = broker_with(BrokerConfig {
            retention: Retention {
                completed: 2,
                failed: 2,
            },
            ..BrokerConfig::default()
        });
        let mut ids = Vec::new();
        for i in 0..3 {
            let id = broker
                .enqueue(None, payload(&format!("{}.pdf", i)), JobOptions::default())
                .unwrap();
            let leased = broker.lease("w").unwrap().unwrap();
            broker.ack(leased.id(), "w", &serde_json::json!({})).unwrap();
            ids.push(id);
            std::thread::sleep(Duration::from_millis(2));
        }
        assert!(broker.get(&ids[0]).unwrap().is_none());
        assert!(broker.get(&ids[1]).unwrap().is_some());
        assert!(broker.get(&ids[2]).unwrap().is_some());
    }

    #[test]
    fn test_fail_with_single_attempt_is_terminal() {
        let broker = broker();
        let id = broker.enqueue(None, payload("a.pdf"), opts(1, 10)).unwrap();
        broker.lease("w").unwrap();

        let outcome = broker.fail(&id, "w", "boom").unwrap();
        assert_eq!(outcome, FailOutcome::Failed { attempts_made: 1 });

        let job = broker.get(&id).unwrap().unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.failure_reason.as_deref(), Some("boom"));
    }

    #[test]
    fn test_fail_with_three_attempts_backs_off_then_fails() {
        let broker = broker();
        let id = broker.enqueue(None, payload("a.pdf"), opts(3, 0)).unwrap();

        broker.lease("w").unwrap().unwrap();
        assert_eq!(
            broker.fail(&id, "w", "first").unwrap(),
            FailOutcome::Retrying {
                attempts_made: 1,
                delay: Duration::ZERO
            }
        );
        assert_eq!(broker.get(&id).unwrap().unwrap().state, JobState::Delayed);

        broker.lease("w").unwrap().unwrap();
        assert!(matches!(
            broker.fail(&id, "w", "second").unwrap(),
            FailOutcome::Retrying { attempts_made: 2, .. }
        ));

        broker.lease("w").unwrap().unwrap();
        assert_eq!(
            broker.fail(&id, "w", "third").unwrap(),
            FailOutcome::Failed { attempts_made: 3 }
        );
        let job = broker.get(&id).unwrap().unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.attempts_made, 3);
    }

    #[test]
    fn test_fail_schedules_backoff_delay() {
        let broker = broker();
        let id = broker.enqueue(None, payload("a.pdf"), opts(3, 60_000)).unwrap();

        broker.lease("w").unwrap();
        let before = now_millis();
        let outcome = broker.fail(&id, "w", "x").unwrap();
        assert_eq!(
            outcome,
            FailOutcome::Retrying {
                attempts_made: 1,
                delay: Duration::from_millis(60_000)
            }
        );
        let job = broker.get(&id).unwrap().unwrap();
        let available = job.available_at.unwrap().timestamp_millis();
        assert!(available >= before + 60_000);

        // Still backing off: not leasable yet.
        assert!(broker.lease("w").unwrap().is_none());
    }

    #[test]
    fn test_retried_job_keeps_original_position() {
        let broker = broker();
        let old = broker.enqueue(None, payload("old.pdf"), opts(2, 0)).unwrap();
        broker.lease("w").unwrap();
        let newer = broker.enqueue(None, payload("new.pdf"), opts(2, 0)).unwrap();
        broker.fail(&old, "w", "transient").unwrap();

        assert_eq!(broker.lease("w").unwrap().unwrap().id(), old);
        assert_eq!(broker.lease("w").unwrap().unwrap().id(), newer);
    }

    #[test]
    fn test_new_attempt_resets_progress() {
        let broker = broker();
        let id = broker.enqueue(None, payload("a.pdf"), opts(2, 0)).unwrap();
        broker.lease("w").unwrap();
        broker.progress(&id, "w", 60).unwrap();
        broker.fail(&id, "w", "x").unwrap();

        let leased = broker.lease("w").unwrap().unwrap();
        assert_eq!(leased.job.progress, 0);
    }

    #[test]
    fn test_progress_requires_active() {
        let broker = broker();
        let id = broker.enqueue(None, payload("a.pdf"), JobOptions::default()).unwrap();
        assert!(matches!(
            broker.progress(&id, "w", 10).unwrap_err(),
            QueueError::NotActive { .. }
        ));
        assert!(matches!(
            broker.progress("nope", "w", 10).unwrap_err(),
            QueueError::NotFound(_)
        ));
    }

    #[test]
    fn test_progress_clamps_and_is_monotonic() {
        let broker = broker();
        let id = broker.enqueue(None, payload("a.pdf"), JobOptions::default()).unwrap();
        broker.lease("w").unwrap();
        broker.progress(&id, "w", 50).unwrap();
        broker.progress(&id, "w", 30).unwrap();
        assert_eq!(broker.get(&id).unwrap().unwrap().progress, 50);
        broker.progress(&id, "w", 250).unwrap();
        assert_eq!(broker.get(&id).unwrap().unwrap().progress, 100);
    }

    #[test]
    fn test_stalled_job_is_requeued_then_failed() {
        let broker = broker_with(BrokerConfig {
            stall_interval: Duration::from_millis(20),
            max_stalled_count: 1,
            ..BrokerConfig::default()
        });
        let id = broker.enqueue(None, payload("a.pdf"), JobOptions::default()).unwrap();

        broker.lease("dead-worker").unwrap();
        std::thread::sleep(Duration::from_millis(40));
        let report = broker.check_stalled().unwrap();
        assert_eq!(report.requeued, vec![id.clone()]);
        assert_eq!(broker.get(&id).unwrap().unwrap().state, JobState::Waiting);

        // The dead worker's late ack is refused.
        assert!(broker.ack(&id, "dead-worker", &serde_json::json!({})).is_err());

        broker.lease("second-worker").unwrap();
        std::thread::sleep(Duration::from_millis(40));
        let report = broker.check_stalled().unwrap();
        assert_eq!(report.failed, vec![id.clone()]);
        let job = broker.get(&id).unwrap().unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.failure_reason.as_deref(), Some(STALLED_REASON));
    }

    #[test]
    fn test_heartbeat_prevents_stall() {
        let broker = broker_with(BrokerConfig {
            stall_interval: Duration::from_millis(50),
            ..BrokerConfig::default()
        });
        let id = broker.enqueue(None, payload("a.pdf"), JobOptions::default()).unwrap();
        broker.lease("w").unwrap();
        std::thread::sleep(Duration::from_millis(30));
        broker.progress(&id, "w", 10).unwrap();
        std::thread::sleep(Duration::from_millis(30));

        let report = broker.check_stalled().unwrap();
        assert!(report.requeued.is_empty());
        assert!(report.failed.is_empty());
    }
}
