//! Common error types shared across the workspace.

use snafu::prelude::*;

// ============ Config Errors ============

/// Errors that can occur during configuration parsing and validation.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ConfigError {
    /// No datasets configured.
    #[snafu(display("At least one dataset must be configured"))]
    NoDatasets,

    /// Dataset source path is empty.
    #[snafu(display("Dataset '{dataset}': source path cannot be empty"))]
    EmptySourcePath { dataset: String },

    /// Dataset target table is empty.
    #[snafu(display("Dataset '{dataset}': target table cannot be empty"))]
    EmptyTable { dataset: String },

    /// Sink URL is empty.
    #[snafu(display("Sink URL cannot be empty"))]
    EmptySinkUrl,

    /// A pool or queue was configured with zero capacity.
    #[snafu(display("'{field}' must be greater than zero"))]
    ZeroCapacity { field: &'static str },

    /// The same component was defined in more than one config file.
    #[snafu(display("Duplicate components across config files: {}", keys.join(", ")))]
    DuplicateComponents { keys: Vec<String> },

    /// Environment variable interpolation failed.
    #[snafu(display("Environment variable interpolation failed:\n{message}"))]
    EnvInterpolation { message: String },

    /// Failed to parse YAML configuration.
    #[snafu(display("Failed to parse YAML configuration"))]
    YamlParse { source: serde_yaml::Error },

    /// Failed to read configuration file.
    #[snafu(display("Failed to read configuration file"))]
    ReadFile { source: std::io::Error },

    /// Failed to read configuration directory.
    #[snafu(display("Failed to read configuration directory {}", path.display()))]
    ReadDir {
        path: std::path::PathBuf,
        source: std::io::Error,
    },

    /// Configuration file has an unsupported extension.
    #[snafu(display("Unsupported config format: {}", path.display()))]
    UnsupportedFormat { path: std::path::PathBuf },

    /// Multiple config sources failed to load.
    #[snafu(display("Failed to load configuration:\n{}", errors.join("\n")))]
    MultipleErrors { errors: Vec<String> },
}

// ============ Metrics Errors ============

/// Errors that can occur during metrics initialization.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum MetricsError {
    /// Failed to initialize Prometheus recorder.
    #[snafu(display("Failed to initialize Prometheus recorder"))]
    PrometheusInit {
        source: metrics_exporter_prometheus::BuildError,
    },

    /// Metrics were initialized twice.
    #[snafu(display("Metrics already initialized"))]
    AlreadyInitialized,

    /// Metrics were used before initialization.
    #[snafu(display("Metrics not initialized"))]
    NotInitialized,
}

// ============ Quarantine Errors ============

/// Errors that can occur while writing quarantine records.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
// Prefix is intentional to avoid snafu selector conflicts (e.g., WriteSnafu)
#[allow(clippy::enum_variant_names)]
pub enum QuarantineError {
    /// Failed to write a quarantine file.
    #[snafu(display("Failed to write quarantine file"))]
    QuarantineWrite { source: std::io::Error },

    /// Failed to serialize a quarantine record.
    #[snafu(display("Failed to serialize quarantine record"))]
    QuarantineSerialize { source: serde_json::Error },

    /// Failed to create the quarantine directory.
    #[snafu(display("Failed to create quarantine directory"))]
    QuarantineDir { source: std::io::Error },
}
