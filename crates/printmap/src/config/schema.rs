use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::analyzer::classify::EffectTable;
use crate::analyzer::manifest::Materials;
use crate::analyzer::AnalyzerConfig;
use crate::queue::{BrokerConfig, JobOptions, ProcessingOptions, Retention};
use crate::telemetry::LogFormat;
use crate::worker::PoolConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub version: String,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub analyzer: AnalyzerSection,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// SQLite file holding the job store. Defaults to `~/.printmap/data/queue.db`.
    #[serde(default)]
    pub database_path: Option<PathBuf>,
    #[serde(default = "default_attempts")]
    pub attempts: u32,
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
    #[serde(default = "default_stall_interval_secs")]
    pub stall_interval_secs: u64,
    #[serde(default = "default_max_stalled_count")]
    pub max_stalled_count: u32,
    #[serde(default = "default_keep_completed")]
    pub keep_completed: u64,
    #[serde(default = "default_keep_failed")]
    pub keep_failed: u64,
    /// Age after which finished jobs may be purged.
    #[serde(default)]
    pub job_ttl_secs: Option<u64>,
}

fn default_attempts() -> u32 {
    3
}

fn default_backoff_ms() -> u64 {
    5_000
}

fn default_stall_interval_secs() -> u64 {
    300
}

fn default_max_stalled_count() -> u32 {
    1
}

fn default_keep_completed() -> u64 {
    100
}

fn default_keep_failed() -> u64 {
    500
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            database_path: None,
            attempts: default_attempts(),
            backoff_ms: default_backoff_ms(),
            stall_interval_secs: default_stall_interval_secs(),
            max_stalled_count: default_max_stalled_count(),
            keep_completed: default_keep_completed(),
            keep_failed: default_keep_failed(),
            job_ttl_secs: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_shutdown_deadline_secs")]
    pub shutdown_deadline_secs: u64,
    /// Shown in logs and lease tokens. Defaults to `printmap-<pid>`.
    #[serde(default)]
    pub name: Option<String>,
}

fn default_concurrency() -> usize {
    num_cpus::get().clamp(1, 2)
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_shutdown_deadline_secs() -> u64 {
    60
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            poll_interval_ms: default_poll_interval_ms(),
            shutdown_deadline_secs: default_shutdown_deadline_secs(),
            name: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyzerSection {
    /// Resolution for jobs submitted without options.
    #[serde(default = "default_dpi")]
    pub dpi: u32,
    #[serde(default = "default_true")]
    pub enable_layer_mode: bool,
    #[serde(default = "default_min_mask_bytes")]
    pub min_mask_bytes: usize,
    #[serde(default = "default_render_timeout_secs")]
    pub render_timeout_secs: u64,
    /// Replaces the built-in effect keyword table when present.
    #[serde(default)]
    pub effects: Option<EffectTable>,
    #[serde(default)]
    pub materials: Materials,
}

fn default_dpi() -> u32 {
    300
}

fn default_true() -> bool {
    true
}

fn default_min_mask_bytes() -> usize {
    512
}

fn default_render_timeout_secs() -> u64 {
    60
}

impl Default for AnalyzerSection {
    fn default() -> Self {
        Self {
            dpi: default_dpi(),
            enable_layer_mode: true,
            min_mask_bytes: default_min_mask_bytes(),
            render_timeout_secs: default_render_timeout_secs(),
            effects: None,
            materials: Materials::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root of per-job directories. Defaults to `~/.printmap/work`.
    #[serde(default)]
    pub work_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub format: LogFormat,
}

fn home_relative(parts: &[&str]) -> PathBuf {
    let mut path = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
    path.push(".printmap");
    for part in parts {
        path.push(part);
    }
    path
}

impl Config {
    pub fn database_path(&self) -> PathBuf {
        self.queue
            .database_path
            .clone()
            .or_else(crate::db::default_database_path)
            .unwrap_or_else(|| home_relative(&["data", "queue.db"]))
    }

    pub fn work_dir(&self) -> PathBuf {
        self.storage
            .work_dir
            .clone()
            .unwrap_or_else(|| home_relative(&["work"]))
    }

    pub fn broker_config(&self) -> BrokerConfig {
        BrokerConfig {
            stall_interval: Duration::from_secs(self.queue.stall_interval_secs),
            max_stalled_count: self.queue.max_stalled_count,
            retention: Retention {
                completed: self.queue.keep_completed,
                failed: self.queue.keep_failed,
            },
        }
    }

    pub fn job_options(&self) -> JobOptions {
        JobOptions {
            attempts: self.queue.attempts,
            backoff: Duration::from_millis(self.queue.backoff_ms),
            ttl: self.queue.job_ttl_secs.map(Duration::from_secs),
        }
    }

    pub fn processing_options(&self) -> ProcessingOptions {
        ProcessingOptions {
            resolution: self.analyzer.dpi,
            enable_layer_mode: self.analyzer.enable_layer_mode,
            ..ProcessingOptions::default()
        }
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            concurrency: self.worker.concurrency,
            poll_interval: Duration::from_millis(self.worker.poll_interval_ms),
            stall_check_interval: Duration::from_secs(self.queue.stall_interval_secs),
            drain_deadline: Duration::from_secs(self.worker.shutdown_deadline_secs),
            ..PoolConfig::default()
        }
    }

    pub fn analyzer_config(&self) -> AnalyzerConfig {
        AnalyzerConfig {
            enable_layer_mode: self.analyzer.enable_layer_mode,
            min_mask_bytes: self.analyzer.min_mask_bytes,
            effect_table: self.analyzer.effects.clone().unwrap_or_default(),
            materials: self.analyzer.materials.clone(),
        }
    }

    pub fn render_timeout(&self) -> Duration {
        Duration::from_secs(self.analyzer.render_timeout_secs)
    }

    pub fn worker_name(&self) -> String {
        self.worker
            .name
            .clone()
            .unwrap_or_else(|| format!("printmap-{}", std::process::id()))
    }
}
