//! Test harness for isolated queue and worker tests.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use printmap::analyzer::{Analyzer, AnalyzerConfig, Renderer};
use printmap::broadcast::JobProgressBroadcaster;
use printmap::db::Database;
use printmap::queue::{
    Broker, BrokerConfig, JobOptions, JobService, ProcessingOptions, SubmitRequest,
};
use printmap::storage::{JobWorkspace, WorkArea};
use printmap::worker::JobProcessor;

use super::builders::PdfBuilder;

/// Isolated environment: `uploads/`, `work/` and a file-backed job store.
pub struct TestHarness {
    temp_dir: TempDir,
    pub upload_dir: PathBuf,
    pub work_dir: PathBuf,
    pub db_path: PathBuf,
}

impl TestHarness {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let base = temp_dir.path();
        let upload_dir = base.join("uploads");
        std::fs::create_dir_all(&upload_dir).expect("Failed to create upload dir");

        Self {
            work_dir: base.join("work"),
            db_path: base.join("data").join("queue.db"),
            upload_dir,
            temp_dir,
        }
    }

    pub fn temp_path(&self) -> &Path {
        self.temp_dir.path()
    }

    /// Opens a broker over the harness store. Every call opens a fresh
    /// connection, like a separate process would.
    pub fn broker(&self, config: BrokerConfig) -> Arc<Broker> {
        let db = Database::open(&self.db_path).expect("Failed to open job store");
        Arc::new(Broker::open(db, config).expect("Failed to open broker"))
    }

    pub fn service(&self, broker: &Arc<Broker>, options: JobOptions) -> JobService {
        JobService::new(Arc::clone(broker), options)
    }

    pub fn write_pdf(&self, name: &str, builder: PdfBuilder) -> PathBuf {
        builder.write(&self.upload_dir.join(name))
    }

    pub fn request(&self, id: &str, path: &Path) -> SubmitRequest {
        let original_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("upload.pdf")
            .to_string();
        let file_size = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);
        SubmitRequest {
            id: Some(id.to_string()),
            file_path: path.to_path_buf(),
            original_name,
            file_size,
            options: Some(ProcessingOptions::default()),
            submitter: None,
        }
    }

    pub fn work_area(&self) -> WorkArea {
        WorkArea::new(&self.work_dir)
    }

    pub fn workspace(&self, job_id: &str) -> JobWorkspace {
        self.work_area().job(job_id)
    }

    pub fn processor(&self, broker: &Arc<Broker>, renderer: Arc<dyn Renderer>) -> JobProcessor {
        self.observed_processor(broker, renderer, None)
    }

    /// Like [`processor`](Self::processor) but publishing progress on `broadcaster`.
    pub fn observed_processor(
        &self,
        broker: &Arc<Broker>,
        renderer: Arc<dyn Renderer>,
        broadcaster: Option<JobProgressBroadcaster>,
    ) -> JobProcessor {
        let analyzer = Analyzer::new(
            AnalyzerConfig {
                min_mask_bytes: 16,
                ..AnalyzerConfig::default()
            },
            renderer,
        );
        JobProcessor::new(
            Arc::clone(broker),
            Arc::new(analyzer),
            self.work_area(),
            broadcaster,
            "test-worker",
        )
    }
}

/// Job options with a short backoff so retries are quick.
pub fn quick_options(attempts: u32) -> JobOptions {
    JobOptions {
        attempts,
        backoff: Duration::from_millis(5),
        ttl: None,
    }
}
