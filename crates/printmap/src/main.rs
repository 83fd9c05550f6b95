use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use crossbeam_channel::{bounded, RecvTimeoutError};
use tracing::{error, info, warn};

use printmap::analyzer::render::PopplerRenderer;
use printmap::analyzer::Analyzer;
use printmap::config::{load_config, Config};
use printmap::db::Database;
use printmap::error::{PrintmapError, WorkerError};
use printmap::queue::Broker;
use printmap::storage::WorkArea;
use printmap::telemetry::init_tracing;
use printmap::worker::{JobProcessor, ProcessOutcome, WorkerPool};

/// How often the main thread sweeps expired jobs while waiting for a signal.
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Parser)]
#[command(name = "printmap-worker", version, about = "Runs the print-document worker pool")]
struct Cli {
    /// Path to the JSON configuration file.
    #[arg(short, long, env = "PRINTMAP_CONFIG")]
    config: PathBuf,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match load_config(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("printmap-worker: {}", e);
            return ExitCode::from(2);
        }
    };
    init_tracing(config.logging.format);

    match run(config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(config: Config) -> Result<(), PrintmapError> {
    info!("Starting printmap-worker v{}", env!("CARGO_PKG_VERSION"));

    let db = Database::open(&config.database_path())?;
    let broker = Arc::new(Broker::open(db, config.broker_config())?);

    let work_area = WorkArea::new(config.work_dir());
    let renderer = Arc::new(PopplerRenderer::new(
        work_area.root().join(".render"),
        config.render_timeout(),
    ));
    let analyzer = Arc::new(Analyzer::new(config.analyzer_config(), renderer));
    let processor = Arc::new(JobProcessor::new(
        Arc::clone(&broker),
        analyzer,
        work_area,
        None,
        config.worker_name(),
    ));

    let pool = WorkerPool::start(processor, config.pool_config())?;

    let (signal_tx, signal_rx) = bounded::<()>(1);
    ctrlc::set_handler(move || {
        let _ = signal_tx.try_send(());
    })
    .map_err(|e| WorkerError::SignalHandler(e.to_string()))?;

    loop {
        match signal_rx.recv_timeout(MAINTENANCE_INTERVAL) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {
                log_reports(&pool);
                if let Err(e) = broker.purge_expired() {
                    warn!("Expired job sweep failed: {}", e);
                }
            }
        }
    }

    info!("Signal received, draining in-flight jobs");
    log_reports(&pool);
    pool.shutdown()?;
    Ok(())
}

fn log_reports(pool: &WorkerPool) {
    let reports = pool.drain_reports();
    if reports.is_empty() {
        return;
    }
    let count = |outcome: ProcessOutcome| reports.iter().filter(|r| r.outcome == outcome).count();
    info!(
        completed = count(ProcessOutcome::Completed),
        retrying = count(ProcessOutcome::Retrying),
        failed = count(ProcessOutcome::Failed),
        abandoned = count(ProcessOutcome::Abandoned),
        "Attempts since last report"
    );
}
