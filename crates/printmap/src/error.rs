use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PrintmapError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Analysis error: {0}")]
    Analyze(#[from] AnalyzeError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),

    #[error("Database error: {0}")]
    Database(#[from] crate::db::DatabaseError),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config JSON: {0}")]
    ParseJson(#[from] serde_json::Error),

    #[error("Config validation failed: {message}")]
    Validation { message: String },

    #[error("Schema validation failed: {errors}")]
    SchemaValidation { errors: String },

    #[error("Invalid effect rule '{effect}': {reason}")]
    InvalidEffectRule { effect: String, reason: String },
}

/// Failures of a whole analysis run. Per-layer problems never surface here;
/// they degrade the affected layer instead.
#[derive(Error, Debug)]
pub enum AnalyzeError {
    #[error("Input file is missing: {0}")]
    InputMissing(PathBuf),

    #[error("Invalid input '{path}': {reason}")]
    InvalidInput { path: PathBuf, reason: String },

    #[error("Render failed: {0}")]
    RenderFailure(#[from] RenderError),

    #[error("Failed to persist '{path}': {source}")]
    PersistenceFailure {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to encode image: {0}")]
    Image(String),

    /// The attempt no longer holds its lease and must not touch job outputs.
    #[error("Attempt abandoned: {0}")]
    Cancelled(String),
}

#[derive(Error, Debug)]
pub enum RenderError {
    #[error("Failed to launch '{tool}': {source}")]
    Spawn {
        tool: String,
        #[source]
        source: std::io::Error,
    },

    #[error("'{tool}' timed out after {secs}s")]
    Timeout { tool: String, secs: u64 },

    #[error("'{tool}' exited with {status}: {stderr}")]
    ToolFailed {
        tool: String,
        status: String,
        stderr: String,
    },

    #[error("Layer '{0}' is not declared in the document")]
    UnknownLayer(String),

    #[error("Failed to prepare render input: {0}")]
    Prepare(String),

    #[error("Render IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Job '{0}' already exists and is not finished")]
    DuplicateId(String),

    #[error("Job '{0}' not found")]
    NotFound(String),

    #[error("Job '{id}' is not active (state: {state})")]
    NotActive { id: String, state: String },

    #[error("Lease on job '{0}' is no longer held by this worker")]
    LeaseLost(String),

    #[error("Job '{id}' has no result (state: {state})")]
    NotCompleted { id: String, state: String },

    #[error("Invalid job state '{0}'")]
    InvalidState(String),

    #[error("Failed to encode job data: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] crate::db::DatabaseError),
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Failed to create directory '{path}': {source}")]
    CreateDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write file '{path}': {source}")]
    WriteFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to remove '{path}': {source}")]
    Remove {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to serialize '{path}': {source}")]
    Serialize {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl From<StorageError> for AnalyzeError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::CreateDirectory { path, source }
            | StorageError::WriteFile { path, source }
            | StorageError::Remove { path, source } => {
                AnalyzeError::PersistenceFailure { path, source }
            }
            StorageError::Serialize { path, source } => AnalyzeError::PersistenceFailure {
                path,
                source: std::io::Error::new(std::io::ErrorKind::InvalidData, source),
            },
        }
    }
}

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Failed to spawn worker: {0}")]
    SpawnFailed(String),

    #[error("Failed to install signal handler: {0}")]
    SignalHandler(String),

    #[error("{busy} worker slot(s) still busy after {secs}s drain deadline")]
    DrainTimeout { busy: usize, secs: u64 },
}

pub type Result<T> = std::result::Result<T, PrintmapError>;
