pub mod analyzer;
pub mod broadcast;
pub mod config;
pub mod db;
pub mod error;
pub mod pipeline;
pub mod queue;
pub mod sanitize;
pub mod storage;
pub mod telemetry;
pub mod worker;

pub use analyzer::{Analyzer, AnalyzerConfig};
pub use broadcast::JobProgressBroadcaster;
pub use config::{load_config, Config};
pub use error::{
    AnalyzeError, ConfigError, PrintmapError, QueueError, Result, StorageError, WorkerError,
};
pub use queue::{Broker, BrokerConfig, JobService};
pub use worker::{JobProcessor, WorkerPool};
