//! Durable job queue: submission, leasing, retries and maintenance.

pub mod broker;
pub mod control;
pub mod job;
pub mod maintenance;
pub mod service;

pub use broker::{backoff_delay, Broker, BrokerConfig, FailOutcome, Retention, StallReport, STALLED_REASON};
pub use control::QueueControl;
pub use job::{Job, JobOptions, JobPayload, JobState, LeasedJob, ProcessingOptions};
pub use maintenance::QueueCounts;
pub use service::{JobService, JobStatusView, PublicState, SubmitReceipt, SubmitRequest};
