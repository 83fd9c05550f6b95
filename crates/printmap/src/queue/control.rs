//! Queue-wide pause switch.
//!
//! The flag lives in the `queue_control` table so every process sharing the
//! store sees the same value. Leasing reads it inside the lease transaction.

use rusqlite::{params, Connection, OptionalExtension};

use crate::db::{Database, DatabaseError};

const PAUSED_KEY: &str = "paused";

pub struct QueueControl {
    db: Database,
}

impl QueueControl {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn pause(&self) -> Result<(), DatabaseError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO queue_control (key, value) VALUES (?1, 'true')
                 ON CONFLICT(key) DO UPDATE SET value = 'true'",
                params![PAUSED_KEY],
            )?;
            Ok(())
        })
    }

    /// Clears the persisted flag entirely, so nothing is left for a later
    /// start to pick up.
    pub fn resume(&self) -> Result<(), DatabaseError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "DELETE FROM queue_control WHERE key = ?1",
                params![PAUSED_KEY],
            )?;
            Ok(())
        })
    }

    pub fn is_paused(&self) -> Result<bool, DatabaseError> {
        self.db.with_conn(read_paused)
    }
}

/// Reads the flag on an already-held connection or transaction.
pub(crate) fn read_paused(conn: &Connection) -> Result<bool, DatabaseError> {
    let value: Option<String> = conn
        .query_row(
            "SELECT value FROM queue_control WHERE key = ?1",
            params![PAUSED_KEY],
            |r| r.get(0),
        )
        .optional()?;
    Ok(value.as_deref() == Some("true"))
}
