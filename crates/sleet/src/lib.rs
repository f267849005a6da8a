//! Sleet: Concurrent bulk ingestion of JSON document trees into a
//! relational data lake.
//!
//! This crate handles:
//! - Streaming enumeration of large JSON directory trees, with chunked
//!   sibling files grouped under their main document
//! - Concurrent reading and parsing with bounded queues as the only
//!   backpressure mechanism
//! - Sharded batch aggregation with row/byte/age sealing thresholds
//! - Idempotent set-based bulk merges into Postgres, keyed by entity
//! - Quarantine of failed files and rejected batches for later replay

pub mod config;
pub mod error;
pub mod mapping;
pub mod pipeline;
pub mod quarantine;
pub mod sink;
pub mod source;

// Re-export commonly used items
pub use config::Config;
pub use error::PipelineError;
pub use pipeline::{Pipeline, RunState, RunSummary};
pub use sink::{BulkSink, PostgresSink};

// Re-export from sleet-common
pub use sleet_common::{CliArgs, KB, MB, MetricsConfig, init_tracing, shutdown_signal};
