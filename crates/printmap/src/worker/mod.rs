pub mod pool;
pub mod processor;
pub mod slot;

pub use pool::{AttemptReport, PoolConfig, WorkerPool};
pub use processor::{JobProcessor, ProcessOutcome};
pub use slot::{SlotHandle, SlotState};
