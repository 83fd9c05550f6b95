pub mod filesystem;

pub use filesystem::{ErrorRecord, JobWorkspace, WorkArea};
