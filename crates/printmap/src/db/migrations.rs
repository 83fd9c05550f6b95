//! Versioned schema migrations.
//!
//! Applied versions are recorded in `_migrations`; pending ones run in order.

use rusqlite::Connection;

use super::error::DatabaseError;

struct Migration {
    version: u32,
    description: &'static str,
    sql: &'static str,
}

const CREATE_JOBS_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS jobs (
    id TEXT PRIMARY KEY,
    seq INTEGER NOT NULL,
    state TEXT NOT NULL,
    payload TEXT NOT NULL,
    max_attempts INTEGER NOT NULL,
    attempts_made INTEGER NOT NULL DEFAULT 0,
    backoff_ms INTEGER NOT NULL,
    ttl_ms INTEGER,
    progress INTEGER NOT NULL DEFAULT 0,
    result TEXT,
    failure_reason TEXT,
    lease_token TEXT,
    heartbeat_at INTEGER,
    available_at INTEGER,
    stall_count INTEGER NOT NULL DEFAULT 0,
    submitted_at INTEGER NOT NULL,
    started_at INTEGER,
    finished_at INTEGER,
    updated_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_jobs_state_seq ON jobs (state, seq);
CREATE INDEX IF NOT EXISTS idx_jobs_state_finished ON jobs (state, finished_at);
"#;

const CREATE_QUEUE_CONTROL_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS queue_control (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

/// All migrations in order. Each is applied at most once.
const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "create_jobs_table",
        sql: CREATE_JOBS_SQL,
    },
    Migration {
        version: 2,
        description: "create_queue_control_table",
        sql: CREATE_QUEUE_CONTROL_SQL,
    },
];

/// Runs all pending migrations on the given connection.
pub fn run_all(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            description TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );",
    )?;

    let current_version: u32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM _migrations",
        [],
        |r| r.get(0),
    )?;

    for migration in MIGRATIONS {
        if migration.version <= current_version {
            continue;
        }

        log::info!(
            "Running migration v{}: {}",
            migration.version,
            migration.description
        );

        conn.execute_batch(migration.sql)
            .map_err(|e| DatabaseError::Migration {
                version: migration.version,
                reason: e.to_string(),
            })?;

        // A second process may have applied the same version concurrently.
        conn.execute(
            "INSERT OR IGNORE INTO _migrations (version, description) VALUES (?1, ?2)",
            rusqlite::params![migration.version, migration.description],
        )?;
    }

    Ok(())
}
