//! Common configuration types shared across the workspace.

mod component_key;
mod loader;
mod path;
mod vars;

pub use component_key::ComponentKey;
pub use loader::{Mergeable, load_from_paths};
pub use path::{CliArgs, ConfigPath, is_yaml_file};
pub use vars::{InterpolationResult, interpolate};

use serde::{Deserialize, Serialize};

/// Byte size constants (binary/IEC units).
pub const KB: usize = 1024;
pub const MB: usize = 1024 * KB;

/// Metrics configuration for Prometheus endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Whether metrics collection is enabled (default: true).
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,
    /// Address to bind the metrics HTTP server (default: "0.0.0.0:9090").
    #[serde(default = "default_metrics_address")]
    pub address: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            address: default_metrics_address(),
        }
    }
}

impl MetricsConfig {
    /// Merge settings from a later config file; non-default values win.
    pub fn merge_from(&mut self, other: MetricsConfig) {
        if other.enabled != default_metrics_enabled() {
            self.enabled = other.enabled;
        }
        if other.address != default_metrics_address() {
            self.address = other.address;
        }
    }
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_metrics_address() -> String {
    "0.0.0.0:9090".to_string()
}
