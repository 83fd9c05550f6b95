use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("Job store error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// The parent directory of the job store file could not be created.
    #[error("Cannot create job store directory '{path}': {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Job store migration v{version} failed: {reason}")]
    Migration { version: u32, reason: String },

    /// A thread panicked while holding the shared connection.
    #[error("Job store connection lock poisoned")]
    LockPoisoned,
}
