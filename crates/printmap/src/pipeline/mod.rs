pub mod progress;

pub use progress::{checkpoint, BrokerProgress, NoopProgress, ProgressEvent, ProgressReporter};
