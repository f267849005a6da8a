//! sleet-common: Shared components for the sleet ingestion pipeline.
//!
//! This crate contains infrastructure used by the pipeline crate:
//!
//! - `config/` - Configuration sources, multi-file merging, and environment
//!   variable interpolation
//! - `metrics/` - Prometheus metrics infrastructure
//! - `queue` - Bounded stage queues (the backpressure primitive)
//! - `signal` - Signal handling for graceful shutdown
//! - `tracing` - Subscriber initialization for the binaries
//! - `error` - Common error types

pub mod config;
pub mod error;
pub mod metrics;
pub mod queue;
pub mod signal;
pub mod tracing;

// Re-export commonly used items
pub use config::{CliArgs, ComponentKey, ConfigPath, KB, MB, MetricsConfig};
pub use error::{ConfigError, MetricsError, QuarantineError};
pub use queue::{QueueClosed, StageQueue, StageReceiver, StageSender};
pub use signal::shutdown_signal;
pub use crate::tracing::init_tracing;
