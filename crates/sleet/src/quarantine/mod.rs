//! Quarantine for failed files and rejected batches.
//!
//! Failed files and permanently-rejected batches are written as NDJSON
//! to a configurable directory for later inspection and replay, instead
//! of aborting the run.

mod tracker;
mod types;
mod writer;

pub use tracker::FailureTracker;
pub use types::{FailedFile, FailureStats, QuarantinedRow};
pub use writer::QuarantineWriter;
