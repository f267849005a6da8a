//! Error types for the sleet ingestion pipeline.

use snafu::prelude::*;

// Re-export common errors
pub use sleet_common::error::{ConfigError, MetricsError, QuarantineError};

/// Errors that can occur while reading source files.
///
/// All read errors are treated as transient and retried with backoff;
/// a file that still fails after the retry budget is counted as failed,
/// never fatal to the worker pool.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ReadError {
    /// Failed to read a source file.
    #[snafu(display("Failed to read {path}: {source}"))]
    FileRead {
        path: String,
        source: std::io::Error,
    },
}

/// Errors that classify a payload as malformed input.
///
/// These are counted skips, never faults: a malformed file reaches a
/// terminal Skipped outcome and the run continues.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ParseError {
    /// Payload is not valid JSON.
    #[snafu(display("Invalid JSON in {path}: {message}"))]
    InvalidJson { path: String, message: String },

    /// Document root is not a JSON object.
    #[snafu(display("Document root is not an object in {path}"))]
    NotAnObject { path: String },

    /// A required top-level field is missing or empty.
    #[snafu(display("Required field '{field}' is missing or empty in {path}"))]
    MissingField { path: String, field: String },

    /// A chunk file's merge target is missing or has the wrong shape.
    #[snafu(display("Cannot merge chunk into '{merge_path}' for {path}: {message}"))]
    ChunkMerge {
        path: String,
        merge_path: String,
        message: String,
    },
}

/// Errors returned by the bulk sink, classified for retry policy.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum SinkError {
    /// Retryable sink failure (timeout, deadlock victim, dropped
    /// connection mid-statement). The whole batch is retried.
    #[snafu(display("Transient sink error: {message}"))]
    Transient { message: String },

    /// Non-retryable rejection (constraint or schema violation). The
    /// batch is quarantined and the run continues.
    #[snafu(display("Permanent sink error: {message}"))]
    Permanent { message: String },

    /// The sink cannot be reached at all. Exhausting the top-level
    /// retry budget on this variant fails the run.
    #[snafu(display("Sink unavailable: {message}"))]
    Unavailable { message: String },
}

impl SinkError {
    pub fn is_transient(&self) -> bool {
        matches!(self, SinkError::Transient { .. })
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(self, SinkError::Unavailable { .. })
    }
}

/// Top-level pipeline errors.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum PipelineError {
    /// Configuration error.
    #[snafu(display("Configuration error: {source}"))]
    Config { source: ConfigError },

    /// Quarantine error.
    #[snafu(display("Quarantine error: {source}"))]
    Quarantine { source: QuarantineError },

    /// Sink error outside of batch loading (startup, resume query).
    #[snafu(display("Sink error: {source}"))]
    Sink { source: SinkError },

    /// Task join error.
    #[snafu(display("Task join error: {source}"))]
    TaskJoin { source: tokio::task::JoinError },

    /// Maximum failures exceeded.
    #[snafu(display("Maximum failures exceeded: {count} failures"))]
    MaxFailures { count: usize },
}

impl From<ConfigError> for PipelineError {
    fn from(source: ConfigError) -> Self {
        PipelineError::Config { source }
    }
}

impl From<QuarantineError> for PipelineError {
    fn from(source: QuarantineError) -> Self {
        PipelineError::Quarantine { source }
    }
}

impl From<SinkError> for PipelineError {
    fn from(source: SinkError) -> Self {
        PipelineError::Sink { source }
    }
}

impl From<tokio::task::JoinError> for PipelineError {
    fn from(source: tokio::task::JoinError) -> Self {
        PipelineError::TaskJoin { source }
    }
}
