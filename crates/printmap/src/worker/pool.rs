use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use log::{debug, error, info, warn};

use crate::error::WorkerError;
use crate::queue::Broker;
use crate::worker::processor::{JobProcessor, ProcessOutcome};
use crate::worker::slot::{SlotHandle, SlotState};

const DRAIN_POLL: Duration = Duration::from_millis(100);

pub const REPORT_BUFFER: usize = 1024;

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub concurrency: usize,
    /// Sleep between lease attempts when nothing is leasable.
    pub poll_interval: Duration,
    pub stall_check_interval: Duration,
    /// How long `shutdown` waits for in-flight jobs.
    pub drain_deadline: Duration,
    /// Attempt reports kept until someone reads them; newer ones are dropped
    /// while the buffer is full.
    pub report_buffer: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            concurrency: num_cpus::get().clamp(1, 2),
            poll_interval: Duration::from_millis(500),
            stall_check_interval: Duration::from_secs(300),
            drain_deadline: Duration::from_secs(60),
            report_buffer: REPORT_BUFFER,
        }
    }
}

/// Result of one attempt, as seen by observers of the pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptReport {
    pub job_id: String,
    pub slot: usize,
    pub outcome: ProcessOutcome,
}

/// Fixed number of slot threads that lease jobs from the broker, plus one
/// thread that periodically sweeps stalled leases.
pub struct WorkerPool {
    config: PoolConfig,
    slots: Arc<Vec<SlotHandle>>,
    shutdown: Arc<AtomicBool>,
    /// Dropped on shutdown; its receivers wake immediately.
    stop_sender: Option<Sender<()>>,
    report_receiver: Receiver<AttemptReport>,
    workers: Vec<JoinHandle<()>>,
    monitor: Option<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn start(processor: Arc<JobProcessor>, config: PoolConfig) -> Result<Self, WorkerError> {
        if config.concurrency == 0 {
            return Err(WorkerError::SpawnFailed(
                "concurrency must be at least 1".to_string(),
            ));
        }

        let (stop_sender, stop_receiver) = bounded::<()>(0);
        let (report_sender, report_receiver) = bounded::<AttemptReport>(config.report_buffer.max(1));
        let shutdown = Arc::new(AtomicBool::new(false));
        let slots: Arc<Vec<SlotHandle>> =
            Arc::new((0..config.concurrency).map(|_| SlotHandle::new()).collect());

        let mut pool = Self {
            config: config.clone(),
            slots: Arc::clone(&slots),
            shutdown: Arc::clone(&shutdown),
            stop_sender: Some(stop_sender),
            report_receiver,
            workers: Vec::with_capacity(config.concurrency),
            monitor: None,
        };

        for slot_id in 0..config.concurrency {
            let ctx = SlotContext {
                slot_id,
                processor: Arc::clone(&processor),
                slots: Arc::clone(&slots),
                shutdown: Arc::clone(&shutdown),
                stop: stop_receiver.clone(),
                reports: report_sender.clone(),
                poll_interval: config.poll_interval,
            };
            let handle = thread::Builder::new()
                .name(format!("printmap-slot-{}", slot_id))
                .spawn(move || run_slot(ctx));
            match handle {
                Ok(h) => pool.workers.push(h),
                Err(e) => {
                    pool.abort();
                    return Err(WorkerError::SpawnFailed(e.to_string()));
                }
            }
        }

        let broker = Arc::clone(processor.broker());
        let interval = config.stall_check_interval;
        let monitor = thread::Builder::new()
            .name("printmap-stall-monitor".to_string())
            .spawn(move || run_stall_monitor(broker, stop_receiver, interval));
        match monitor {
            Ok(h) => pool.monitor = Some(h),
            Err(e) => {
                pool.abort();
                return Err(WorkerError::SpawnFailed(e.to_string()));
            }
        }

        info!(
            "Started {} worker slots as '{}'",
            config.concurrency,
            processor.worker_name()
        );
        Ok(pool)
    }

    pub fn concurrency(&self) -> usize {
        self.config.concurrency
    }

    pub fn slot_states(&self) -> Vec<SlotState> {
        self.slots.iter().map(SlotHandle::get).collect()
    }

    /// Slots currently holding or acquiring a lease.
    pub fn busy(&self) -> usize {
        self.slots.iter().filter(|s| s.get().is_busy()).count()
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    pub fn try_recv_report(&self) -> Option<AttemptReport> {
        self.report_receiver.try_recv().ok()
    }

    pub fn recv_report_timeout(&self, timeout: Duration) -> Option<AttemptReport> {
        self.report_receiver.recv_timeout(timeout).ok()
    }

    /// Takes every report buffered so far.
    pub fn drain_reports(&self) -> Vec<AttemptReport> {
        self.report_receiver.try_iter().collect()
    }

    /// Stops leasing and waits up to the drain deadline for in-flight jobs.
    ///
    /// Jobs still running at the deadline keep their lease; the stall sweep
    /// of a later process reclaims them.
    pub fn shutdown(mut self) -> Result<(), WorkerError> {
        info!("Shutting down worker pool...");
        self.signal_stop();

        let deadline = Instant::now() + self.config.drain_deadline;
        loop {
            let busy = self.busy();
            if busy == 0 {
                break;
            }
            if Instant::now() >= deadline {
                warn!("{} slot(s) still busy at drain deadline", busy);
                return Err(WorkerError::DrainTimeout {
                    busy,
                    secs: self.config.drain_deadline.as_secs(),
                });
            }
            thread::sleep(DRAIN_POLL);
        }

        self.join_all();
        info!("All workers have stopped");
        Ok(())
    }

    fn signal_stop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.stop_sender.take();
    }

    fn abort(&mut self) {
        self.signal_stop();
        self.join_all();
    }

    fn join_all(&mut self) {
        for (i, worker) in self.workers.drain(..).enumerate() {
            if let Err(e) = worker.join() {
                error!("Worker slot {} panicked: {:?}", i, e);
            } else {
                debug!("Worker slot {} finished", i);
            }
        }
        if let Some(monitor) = self.monitor.take() {
            if monitor.join().is_err() {
                error!("Stall monitor panicked");
            }
        }
    }
}

struct SlotContext {
    slot_id: usize,
    processor: Arc<JobProcessor>,
    slots: Arc<Vec<SlotHandle>>,
    shutdown: Arc<AtomicBool>,
    stop: Receiver<()>,
    reports: Sender<AttemptReport>,
    poll_interval: Duration,
}

fn run_slot(ctx: SlotContext) {
    let slot = &ctx.slots[ctx.slot_id];
    let broker = ctx.processor.broker();
    debug!("Worker slot {} started", ctx.slot_id);

    loop {
        // Marked busy before the shutdown check so a drain never misses a
        // lease taken concurrently with the stop signal.
        slot.set(SlotState::Leasing);
        if ctx.shutdown.load(Ordering::SeqCst) {
            break;
        }

        let token = format!(
            "{}:{}:{}",
            ctx.processor.worker_name(),
            ctx.slot_id,
            uuid::Uuid::new_v4()
        );
        match broker.lease(&token) {
            Ok(Some(leased)) => {
                slot.set(SlotState::Processing);
                let job_id = leased.job.id.clone();
                let outcome = ctx.processor.process(leased, slot);
                slot.set(SlotState::Idle);
                let report = AttemptReport {
                    job_id,
                    slot: ctx.slot_id,
                    outcome,
                };
                if let Err(TrySendError::Full(dropped)) = ctx.reports.try_send(report) {
                    debug!("Report buffer full; dropping report for {}", dropped.job_id);
                }
            }
            Ok(None) => {
                slot.set(SlotState::Idle);
                if wait_or_stop(&ctx.stop, ctx.poll_interval) {
                    break;
                }
            }
            Err(e) => {
                slot.set(SlotState::Idle);
                error!("Worker slot {} failed to lease: {}", ctx.slot_id, e);
                if wait_or_stop(&ctx.stop, ctx.poll_interval) {
                    break;
                }
            }
        }
    }

    slot.set(SlotState::Stopped);
    debug!("Worker slot {} stopped", ctx.slot_id);
}

fn run_stall_monitor(broker: Arc<Broker>, stop: Receiver<()>, interval: Duration) {
    debug!("Stall monitor started ({:?} interval)", interval);
    while !wait_or_stop(&stop, interval) {
        match broker.check_stalled() {
            Ok(report) if report.requeued.is_empty() && report.failed.is_empty() => {}
            Ok(report) => info!(
                "Stall sweep requeued {} job(s), failed {}",
                report.requeued.len(),
                report.failed.len()
            ),
            Err(e) => error!("Stall sweep failed: {}", e),
        }
    }
    debug!("Stall monitor stopped");
}

/// Sleeps for `timeout` unless the stop channel closes first. Returns true
/// when the pool is stopping.
fn wait_or_stop(stop: &Receiver<()>, timeout: Duration) -> bool {
    match stop.recv_timeout(timeout) {
        Err(RecvTimeoutError::Timeout) => false,
        Ok(()) | Err(RecvTimeoutError::Disconnected) => true,
    }
}
