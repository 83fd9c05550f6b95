//! Row-level operations on the `jobs` table.
//!
//! Every function takes a plain `&Connection` so the broker can compose
//! several of them inside one `Database::with_tx` transaction. State-changing
//! updates are guarded by the expected current state (and lease token) and
//! return the number of rows changed; zero means another writer got there
//! first.

use rusqlite::{params, Connection, OptionalExtension, Row};

use super::DatabaseError;

/// A raw job row from the database.
#[derive(Debug, Clone, PartialEq)]
pub struct JobRow {
    pub id: String,
    pub seq: i64,
    pub state: String,
    pub payload: String,
    pub max_attempts: u32,
    pub attempts_made: u32,
    pub backoff_ms: i64,
    pub ttl_ms: Option<i64>,
    pub progress: u8,
    pub result: Option<String>,
    pub failure_reason: Option<String>,
    pub lease_token: Option<String>,
    pub heartbeat_at: Option<i64>,
    pub available_at: Option<i64>,
    pub submitted_at: i64,
    pub started_at: Option<i64>,
    pub finished_at: Option<i64>,
    pub updated_at: i64,
    pub stall_count: u32,
}

impl JobRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            seq: row.get("seq")?,
            state: row.get("state")?,
            payload: row.get("payload")?,
            max_attempts: row.get("max_attempts")?,
            attempts_made: row.get("attempts_made")?,
            backoff_ms: row.get("backoff_ms")?,
            ttl_ms: row.get("ttl_ms")?,
            progress: row.get("progress")?,
            result: row.get("result")?,
            failure_reason: row.get("failure_reason")?,
            lease_token: row.get("lease_token")?,
            heartbeat_at: row.get("heartbeat_at")?,
            available_at: row.get("available_at")?,
            submitted_at: row.get("submitted_at")?,
            started_at: row.get("started_at")?,
            finished_at: row.get("finished_at")?,
            updated_at: row.get("updated_at")?,
            stall_count: row.get("stall_count")?,
        })
    }
}

/// Inserts a new job row.
pub fn insert(conn: &Connection, job: &JobRow) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO jobs (id, seq, state, payload, max_attempts, attempts_made, backoff_ms,
         ttl_ms, progress, result, failure_reason, lease_token, heartbeat_at, available_at,
         submitted_at, started_at, finished_at, updated_at, stall_count)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)",
        params![
            job.id,
            job.seq,
            job.state,
            job.payload,
            job.max_attempts,
            job.attempts_made,
            job.backoff_ms,
            job.ttl_ms,
            job.progress,
            job.result,
            job.failure_reason,
            job.lease_token,
            job.heartbeat_at,
            job.available_at,
            job.submitted_at,
            job.started_at,
            job.finished_at,
            job.updated_at,
            job.stall_count,
        ],
    )?;
    Ok(())
}

/// Deletes a job row, returning the number of rows removed.
pub fn delete(conn: &Connection, id: &str) -> Result<usize, DatabaseError> {
    Ok(conn.execute("DELETE FROM jobs WHERE id = ?1", params![id])?)
}

/// Finds a job by its ID.
pub fn find_by_id(conn: &Connection, id: &str) -> Result<Option<JobRow>, DatabaseError> {
    Ok(conn
        .query_row(
            "SELECT * FROM jobs WHERE id = ?1",
            params![id],
            JobRow::from_row,
        )
        .optional()?)
}

/// Next insertion sequence number. Must be called inside the inserting
/// transaction.
pub fn next_seq(conn: &Connection) -> Result<i64, DatabaseError> {
    Ok(conn.query_row("SELECT COALESCE(MAX(seq), 0) + 1 FROM jobs", [], |r| {
        r.get(0)
    })?)
}

/// Oldest waiting job by original insertion sequence.
pub fn oldest_waiting(conn: &Connection) -> Result<Option<JobRow>, DatabaseError> {
    Ok(conn
        .query_row(
            "SELECT * FROM jobs WHERE state = 'waiting' ORDER BY seq ASC LIMIT 1",
            [],
            JobRow::from_row,
        )
        .optional()?)
}

/// Moves delayed jobs whose backoff has elapsed back to waiting.
/// Their `seq` is untouched, so they rejoin by original submission order.
pub fn promote_due_delayed(conn: &Connection, now: i64) -> Result<usize, DatabaseError> {
    Ok(conn.execute(
        "UPDATE jobs SET state = 'waiting', available_at = NULL, updated_at = ?1
         WHERE state = 'delayed' AND available_at <= ?1",
        params![now],
    )?)
}

/// Claims a waiting job for `token`, starting a fresh attempt.
pub fn mark_active(
    conn: &Connection,
    id: &str,
    token: &str,
    now: i64,
) -> Result<usize, DatabaseError> {
    Ok(conn.execute(
        "UPDATE jobs SET state = 'active', lease_token = ?2, heartbeat_at = ?3,
         started_at = ?3, progress = 0, updated_at = ?3
         WHERE id = ?1 AND state = 'waiting'",
        params![id, token, now],
    )?)
}

/// Records a successful attempt.
pub fn mark_completed(
    conn: &Connection,
    id: &str,
    token: &str,
    result: &str,
    now: i64,
) -> Result<usize, DatabaseError> {
    Ok(conn.execute(
        "UPDATE jobs SET state = 'completed', result = ?3, progress = 100,
         lease_token = NULL, heartbeat_at = NULL, finished_at = ?4, updated_at = ?4
         WHERE id = ?1 AND state = 'active' AND lease_token = ?2",
        params![id, token, result, now],
    )?)
}

/// Puts a failed attempt into the delayed set until `available_at`.
pub fn mark_delayed(
    conn: &Connection,
    id: &str,
    token: &str,
    attempts_made: u32,
    available_at: i64,
    now: i64,
) -> Result<usize, DatabaseError> {
    Ok(conn.execute(
        "UPDATE jobs SET state = 'delayed', attempts_made = ?3, available_at = ?4,
         lease_token = NULL, heartbeat_at = NULL, updated_at = ?5
         WHERE id = ?1 AND state = 'active' AND lease_token = ?2",
        params![id, token, attempts_made, available_at, now],
    )?)
}

/// Terminally fails an active job. `token` of `None` is used by the stall
/// sweep, which acts on behalf of a worker that is presumed dead.
pub fn mark_failed(
    conn: &Connection,
    id: &str,
    token: Option<&str>,
    attempts_made: u32,
    reason: &str,
    now: i64,
) -> Result<usize, DatabaseError> {
    Ok(conn.execute(
        "UPDATE jobs SET state = 'failed', attempts_made = ?3, failure_reason = ?4,
         lease_token = NULL, heartbeat_at = NULL, finished_at = ?5, updated_at = ?5
         WHERE id = ?1 AND state = 'active' AND (?2 IS NULL OR lease_token = ?2)",
        params![id, token, attempts_made, reason, now],
    )?)
}

/// Raises progress (never lowers it) and refreshes the heartbeat.
pub fn update_progress(
    conn: &Connection,
    id: &str,
    token: &str,
    pct: u8,
    now: i64,
) -> Result<usize, DatabaseError> {
    Ok(conn.execute(
        "UPDATE jobs SET progress = MAX(progress, ?3), heartbeat_at = ?4, updated_at = ?4
         WHERE id = ?1 AND state = 'active' AND lease_token = ?2",
        params![id, token, pct, now],
    )?)
}

/// Active jobs whose last heartbeat is older than `cutoff`.
pub fn find_stalled(conn: &Connection, cutoff: i64) -> Result<Vec<JobRow>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT * FROM jobs WHERE state = 'active' AND heartbeat_at < ?1 ORDER BY seq ASC",
    )?;
    let rows = stmt
        .query_map(params![cutoff], JobRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Returns a stalled job to the waiting set, releasing its lease.
pub fn requeue_stalled(
    conn: &Connection,
    id: &str,
    stall_count: u32,
    now: i64,
) -> Result<usize, DatabaseError> {
    Ok(conn.execute(
        "UPDATE jobs SET state = 'waiting', stall_count = ?2, lease_token = NULL,
         heartbeat_at = NULL, progress = 0, updated_at = ?3
         WHERE id = ?1 AND state = 'active'",
        params![id, stall_count, now],
    )?)
}

/// Lists jobs in `state` ordered by submission.
pub fn list_by_state(conn: &Connection, state: &str) -> Result<Vec<JobRow>, DatabaseError> {
    let mut stmt = conn.prepare("SELECT * FROM jobs WHERE state = ?1 ORDER BY seq ASC")?;
    let rows = stmt
        .query_map(params![state], JobRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Counts jobs with the given state.
pub fn count_by_state(conn: &Connection, state: &str) -> Result<u64, DatabaseError> {
    Ok(conn.query_row(
        "SELECT COUNT(*) FROM jobs WHERE state = ?1",
        params![state],
        |r| r.get(0),
    )?)
}

/// Keeps only the `keep` most recently finished jobs in `state`.
pub fn trim_state(conn: &Connection, state: &str, keep: u64) -> Result<usize, DatabaseError> {
    Ok(conn.execute(
        "DELETE FROM jobs WHERE state = ?1 AND id NOT IN (
            SELECT id FROM jobs WHERE state = ?1
            ORDER BY finished_at DESC, seq DESC LIMIT ?2
         )",
        params![state, keep as i64],
    )?)
}

/// Deletes jobs in `state` whose finish (or, if unfinished, submission) time
/// is older than `cutoff`.
pub fn purge_older_than(
    conn: &Connection,
    state: &str,
    cutoff: i64,
) -> Result<usize, DatabaseError> {
    Ok(conn.execute(
        "DELETE FROM jobs WHERE state = ?1 AND COALESCE(finished_at, submitted_at) < ?2",
        params![state, cutoff],
    )?)
}

/// Records the latest attempt's failure without changing state.
pub fn set_failure_reason(conn: &Connection, id: &str, reason: &str) -> Result<usize, DatabaseError> {
    Ok(conn.execute(
        "UPDATE jobs SET failure_reason = ?2 WHERE id = ?1",
        params![id, reason],
    )?)
}

/// Deletes finished jobs whose TTL has run out.
pub fn purge_expired(conn: &Connection, now: i64) -> Result<usize, DatabaseError> {
    Ok(conn.execute(
        "DELETE FROM jobs WHERE state IN ('completed', 'failed')
         AND ttl_ms IS NOT NULL AND finished_at + ttl_ms <= ?1",
        params![now],
    )?)
}
