//! Operations for periodic callers: unpausing, cleanup, inspection.

use std::time::Duration;

use serde::Serialize;
use tracing::info;

use crate::db::job_repo;
use crate::error::QueueError;

use super::broker::Broker;
use super::job::{duration_millis, now_millis, Job, JobState};

/// Number of jobs per state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueCounts {
    pub waiting: u64,
    pub active: u64,
    pub delayed: u64,
    pub completed: u64,
    pub failed: u64,
}

impl QueueCounts {
    pub fn total(&self) -> u64 {
        self.waiting + self.active + self.delayed + self.completed + self.failed
    }
}

impl Broker {
    /// Clears the pause flag whatever set it.
    pub fn force_resume(&self) -> Result<bool, QueueError> {
        let was_paused = self.is_paused()?;
        self.resume()?;
        if was_paused {
            info!("Queue force-resumed");
        }
        Ok(was_paused)
    }

    /// Deletes jobs in `state` that finished (or were submitted, if never
    /// finished) more than `max_age` ago. Active jobs are never purged.
    pub fn purge_older_than(&self, state: JobState, max_age: Duration) -> Result<usize, QueueError> {
        if state == JobState::Active {
            return Ok(0);
        }
        let cutoff = now_millis() - duration_millis(max_age);
        let removed = self
            .database()
            .with_conn(|conn| job_repo::purge_older_than(conn, state.as_str(), cutoff))?;
        if removed > 0 {
            info!(state = %state, count = removed, "Purged old jobs");
        }
        Ok(removed)
    }

    /// Jobs in `state`, oldest submission first.
    pub fn list_by_state(&self, state: JobState) -> Result<Vec<Job>, QueueError> {
        let rows = self
            .database()
            .with_conn(|conn| job_repo::list_by_state(conn, state.as_str()))?;
        rows.iter().map(Job::from_row).collect()
    }

    /// Deletes finished jobs whose TTL has run out.
    pub fn purge_expired(&self) -> Result<usize, QueueError> {
        let now = now_millis();
        let removed = self
            .database()
            .with_conn(|conn| job_repo::purge_expired(conn, now))?;
        if removed > 0 {
            info!(count = removed, "Purged expired jobs");
        }
        Ok(removed)
    }

    pub fn counts(&self) -> Result<QueueCounts, QueueError> {
        Ok(self.database().with_conn(|conn| {
            Ok(QueueCounts {
                waiting: job_repo::count_by_state(conn, JobState::Waiting.as_str())?,
                active: job_repo::count_by_state(conn, JobState::Active.as_str())?,
                delayed: job_repo::count_by_state(conn, JobState::Delayed.as_str())?,
                completed: job_repo::count_by_state(conn, JobState::Completed.as_str())?,
                failed: job_repo::count_by_state(conn, JobState::Failed.as_str())?,
            })
        })?)
    }
}
