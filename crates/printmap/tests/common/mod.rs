//! Shared test utilities for printmap integration tests.
//!
//! - `TestHarness` owns a temp directory holding uploads, the job store and
//!   the work area, and wires brokers, analyzers and processors over them.
//! - Builders produce minimal PDFs and canned renders without external tools.

pub mod builders;
pub mod harness;

pub use builders::*;
pub use harness::{quick_options, TestHarness};
