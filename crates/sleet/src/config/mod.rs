//! Configuration for the sleet ingestion pipeline.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::ConfigError;
use sleet_common::config::{
    ComponentKey, ConfigPath, MB, Mergeable, MetricsConfig, interpolate, load_from_paths,
};
use sleet_common::error::{
    EmptySinkUrlSnafu, EmptySourcePathSnafu, EmptyTableSnafu, EnvInterpolationSnafu,
    NoDatasetsSnafu, YamlParseSnafu, ZeroCapacitySnafu,
};
use snafu::prelude::*;

/// Identifier for one configured dataset (the dataset tag).
pub type DatasetKey = ComponentKey;

/// Entity-key derivation from source filenames.
///
/// The key is the file stem with an optional prefix and suffix stripped,
/// optionally zero-padded when numeric (e.g. `CIK0000320193.json` with
/// `strip_prefix: CIK` yields `0000320193`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KeyConfig {
    /// Prefix stripped from the file name before key extraction.
    #[serde(default)]
    pub strip_prefix: Option<String>,
    /// Suffix stripped from the file name (defaults to the extension).
    #[serde(default)]
    pub strip_suffix: Option<String>,
    /// Zero-pad numeric keys to this width.
    #[serde(default)]
    pub zero_pad: Option<usize>,
}

/// Chunked-file grouping for datasets whose documents are split across
/// sibling files (`<stem><suffix>-NNN.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkConfig {
    /// Marker that identifies a chunk sibling of a main file
    /// (e.g. "-submissions" groups `CIK1-submissions-001.json` under
    /// `CIK1.json`).
    pub suffix: String,
    /// Dot-separated path in the main document whose list fields
    /// receive the chunk contents (e.g. "filings.recent").
    pub merge_path: String,
}

/// Configuration for one dataset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetConfig {
    /// Root directory of the dataset's JSON files.
    pub source: String,
    /// Target table for bulk merges.
    pub table: String,
    /// Entity-key derivation.
    #[serde(default)]
    pub key: KeyConfig,
    /// Optional chunked-file grouping.
    #[serde(default)]
    pub chunks: Option<ChunkConfig>,
    /// Top-level fields a document must carry non-empty values for.
    /// Documents missing one are counted skips.
    #[serde(default)]
    pub required: Vec<String>,
    /// Skip entities already present in the sink (restart support).
    #[serde(default)]
    pub resume: bool,
    /// Optional field-name mapping file (YAML, raw -> normalized).
    #[serde(default)]
    pub mapping_path: Option<String>,
}

/// Worker pool sizes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolsConfig {
    /// IO worker count (file reads).
    #[serde(default = "default_io_workers")]
    pub io_workers: usize,
    /// Parse worker count.
    #[serde(default = "default_parse_workers")]
    pub parse_workers: usize,
    /// Aggregator shard count (dataset tags are hashed across shards).
    #[serde(default = "default_aggregator_shards")]
    pub aggregator_shards: usize,
    /// Bulk loader worker count; also sizes the sink connection pool.
    #[serde(default = "default_loader_workers")]
    pub loader_workers: usize,
}

impl Default for PoolsConfig {
    fn default() -> Self {
        Self {
            io_workers: default_io_workers(),
            parse_workers: default_parse_workers(),
            aggregator_shards: default_aggregator_shards(),
            loader_workers: default_loader_workers(),
        }
    }
}

fn default_io_workers() -> usize {
    8
}

fn default_parse_workers() -> usize {
    8
}

fn default_aggregator_shards() -> usize {
    2
}

fn default_loader_workers() -> usize {
    4
}

/// Per-stage bounded queue capacities.
///
/// These bound total in-flight memory: a full queue blocks its
/// producer, which is the pipeline's only backpressure mechanism.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuesConfig {
    /// Enumerator -> IO workers.
    #[serde(default = "default_file_units")]
    pub file_units: usize,
    /// IO workers -> Parse workers.
    #[serde(default = "default_raw_payloads")]
    pub raw_payloads: usize,
    /// Parse workers -> each aggregator shard.
    #[serde(default = "default_parsed_records")]
    pub parsed_records: usize,
    /// Aggregator shards -> loader pool.
    #[serde(default = "default_sealed_batches")]
    pub sealed_batches: usize,
    /// Seconds a blocked producer waits before a stall warning.
    #[serde(default = "default_stall_warn_secs")]
    pub stall_warn_secs: u64,
}

impl Default for QueuesConfig {
    fn default() -> Self {
        Self {
            file_units: default_file_units(),
            raw_payloads: default_raw_payloads(),
            parsed_records: default_parsed_records(),
            sealed_batches: default_sealed_batches(),
            stall_warn_secs: default_stall_warn_secs(),
        }
    }
}

fn default_file_units() -> usize {
    1024
}

fn default_raw_payloads() -> usize {
    64
}

fn default_parsed_records() -> usize {
    256
}

fn default_sealed_batches() -> usize {
    8
}

fn default_stall_warn_secs() -> u64 {
    30
}

impl QueuesConfig {
    pub fn stall_warn(&self) -> Duration {
        Duration::from_secs(self.stall_warn_secs)
    }
}

/// Batch sealing thresholds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchConfig {
    /// Seal when a batch reaches this many rows.
    #[serde(default = "default_max_rows")]
    pub max_rows: usize,
    /// Seal when a batch's byte estimate reaches this many megabytes.
    #[serde(default = "default_max_bytes_mb")]
    pub max_bytes_mb: usize,
    /// Seal when a batch has been open this long (bounds staleness
    /// under low-throughput tags).
    #[serde(default = "default_max_open_secs")]
    pub max_open_secs: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_rows: default_max_rows(),
            max_bytes_mb: default_max_bytes_mb(),
            max_open_secs: default_max_open_secs(),
        }
    }
}

fn default_max_rows() -> usize {
    1000
}

fn default_max_bytes_mb() -> usize {
    1500
}

fn default_max_open_secs() -> u64 {
    30
}

impl BatchConfig {
    pub fn max_bytes(&self) -> usize {
        self.max_bytes_mb * MB
    }

    pub fn max_open(&self) -> Duration {
        Duration::from_secs(self.max_open_secs)
    }
}

/// Retry budgets and backoff for reads and loads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total read attempts per file (including the first).
    #[serde(default = "default_read_attempts")]
    pub read_attempts: u32,
    /// Base backoff between read attempts, in milliseconds.
    #[serde(default = "default_read_backoff_ms")]
    pub read_backoff_ms: u64,
    /// Total load attempts per batch (including the first).
    #[serde(default = "default_load_attempts")]
    pub load_attempts: u32,
    /// Base backoff between load attempts, in milliseconds.
    #[serde(default = "default_load_backoff_ms")]
    pub load_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            read_attempts: default_read_attempts(),
            read_backoff_ms: default_read_backoff_ms(),
            load_attempts: default_load_attempts(),
            load_backoff_ms: default_load_backoff_ms(),
        }
    }
}

fn default_read_attempts() -> u32 {
    3
}

fn default_read_backoff_ms() -> u64 {
    200
}

fn default_load_attempts() -> u32 {
    3
}

fn default_load_backoff_ms() -> u64 {
    1000
}

impl RetryConfig {
    pub fn read_backoff(&self) -> Duration {
        Duration::from_millis(self.read_backoff_ms)
    }

    pub fn load_backoff(&self) -> Duration {
        Duration::from_millis(self.load_backoff_ms)
    }
}

/// Sink connection configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SinkConfig {
    /// Database connection URL.
    #[serde(default)]
    pub url: String,
}

/// Error handling configuration for resilient pipeline execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorHandlingConfig {
    /// Maximum failed files before stopping the run (0 = unlimited).
    #[serde(default)]
    pub max_failures: usize,
    /// Directory for quarantine NDJSON files (failed files and
    /// quarantined batches). Quarantine is disabled when unset.
    #[serde(default)]
    pub quarantine_path: Option<String>,
    /// Warn when the skipped-file ratio exceeds this fraction.
    #[serde(default = "default_skip_ratio_warn")]
    pub skip_ratio_warn: f64,
}

impl Default for ErrorHandlingConfig {
    fn default() -> Self {
        Self {
            max_failures: 0,
            quarantine_path: None,
            skip_ratio_warn: default_skip_ratio_warn(),
        }
    }
}

fn default_skip_ratio_warn() -> f64 {
    0.1
}

/// Main configuration for sleet.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Datasets to ingest, keyed by dataset tag.
    #[serde(default)]
    pub datasets: IndexMap<DatasetKey, DatasetConfig>,
    /// Sink connection.
    #[serde(default)]
    pub sink: SinkConfig,
    /// Worker pool sizes.
    #[serde(default)]
    pub pools: PoolsConfig,
    /// Stage queue capacities.
    #[serde(default)]
    pub queues: QueuesConfig,
    /// Batch sealing thresholds.
    #[serde(default)]
    pub batch: BatchConfig,
    /// Retry budgets and backoff.
    #[serde(default)]
    pub retry: RetryConfig,
    /// Error handling configuration.
    #[serde(default)]
    pub error_handling: ErrorHandlingConfig,
    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl Config {
    /// Load and merge configuration from files and directories.
    pub fn from_paths(paths: &[ConfigPath]) -> Result<Self, ConfigError> {
        let config: Config = load_from_paths(paths)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a YAML string.
    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        // Interpolate environment variables
        let result = interpolate(contents);
        if !result.is_ok() {
            return EnvInterpolationSnafu {
                message: result.errors.join("\n"),
            }
            .fail();
        }

        // Parse YAML
        let config: Config = serde_yaml::from_str(&result.text).context(YamlParseSnafu)?;

        // Validate
        config.validate()?;

        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.datasets.is_empty() {
            return NoDatasetsSnafu.fail();
        }
        for (key, dataset) in &self.datasets {
            if dataset.source.is_empty() {
                return EmptySourcePathSnafu {
                    dataset: key.to_string(),
                }
                .fail();
            }
            if dataset.table.is_empty() {
                return EmptyTableSnafu {
                    dataset: key.to_string(),
                }
                .fail();
            }
        }
        if self.sink.url.is_empty() {
            return EmptySinkUrlSnafu.fail();
        }

        let capacities: [(&'static str, usize); 9] = [
            ("pools.io_workers", self.pools.io_workers),
            ("pools.parse_workers", self.pools.parse_workers),
            ("pools.aggregator_shards", self.pools.aggregator_shards),
            ("pools.loader_workers", self.pools.loader_workers),
            ("queues.file_units", self.queues.file_units),
            ("queues.raw_payloads", self.queues.raw_payloads),
            ("queues.parsed_records", self.queues.parsed_records),
            ("queues.sealed_batches", self.queues.sealed_batches),
            ("batch.max_rows", self.batch.max_rows),
        ];
        for (field, value) in capacities {
            if value == 0 {
                return ZeroCapacitySnafu { field }.fail();
            }
        }
        Ok(())
    }
}

impl Mergeable for Config {
    type Key = DatasetKey;
    type Component = DatasetConfig;

    fn components(&self) -> &IndexMap<DatasetKey, DatasetConfig> {
        &self.datasets
    }

    fn components_mut(&mut self) -> &mut IndexMap<DatasetKey, DatasetConfig> {
        &mut self.datasets
    }

    fn metrics(&self) -> &MetricsConfig {
        &self.metrics
    }

    fn metrics_mut(&mut self) -> &mut MetricsConfig {
        &mut self.metrics
    }

    fn parse_yaml(contents: &str) -> Result<Self, ConfigError> {
        // Validation happens after the full merge, not per file.
        serde_yaml::from_str(contents).context(YamlParseSnafu)
    }

    fn merge_settings(&mut self, other: &mut Self) {
        // Later files override sections they set to non-default values.
        if other.sink != SinkConfig::default() {
            self.sink = std::mem::take(&mut other.sink);
        }
        if other.pools != PoolsConfig::default() {
            self.pools = other.pools.clone();
        }
        if other.queues != QueuesConfig::default() {
            self.queues = other.queues.clone();
        }
        if other.batch != BatchConfig::default() {
            self.batch = other.batch.clone();
        }
        if other.retry != RetryConfig::default() {
            self.retry = other.retry.clone();
        }
        if other.error_handling != ErrorHandlingConfig::default() {
            self.error_handling = other.error_handling.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
datasets:
  submissions:
    source: /data/submissions
    table: submissions
sink:
  url: postgres://localhost/lake
"#;

    #[test]
    fn test_parse_minimal() {
        let config = Config::parse(MINIMAL).unwrap();
        assert_eq!(config.datasets.len(), 1);
        let dataset = &config.datasets[&DatasetKey::new("submissions")];
        assert_eq!(dataset.source, "/data/submissions");
        assert_eq!(dataset.table, "submissions");
        assert!(!dataset.resume);
        assert!(dataset.chunks.is_none());
    }

    #[test]
    fn test_defaults() {
        let config = Config::parse(MINIMAL).unwrap();
        assert_eq!(config.pools.io_workers, 8);
        assert_eq!(config.pools.parse_workers, 8);
        assert_eq!(config.pools.aggregator_shards, 2);
        assert_eq!(config.pools.loader_workers, 4);
        assert_eq!(config.queues.file_units, 1024);
        assert_eq!(config.batch.max_rows, 1000);
        assert_eq!(config.batch.max_bytes(), 1500 * MB);
        assert_eq!(config.retry.read_attempts, 3);
        assert_eq!(config.retry.load_attempts, 3);
        assert!((config.error_handling.skip_ratio_warn - 0.1).abs() < f64::EPSILON);
        assert!(config.metrics.enabled);
    }

    #[test]
    fn test_parse_full() {
        let yaml = r#"
datasets:
  submissions:
    source: /data/submissions
    table: submissions
    key:
      strip_prefix: CIK
      zero_pad: 10
    chunks:
      suffix: "-submissions"
      merge_path: filings.recent
    resume: true
  facts:
    source: /data/facts
    table: company_facts
    required: [entityName, facts]
sink:
  url: postgres://localhost/lake
pools:
  io_workers: 16
  aggregator_shards: 4
batch:
  max_rows: 500
  max_bytes_mb: 256
"#;
        let config = Config::parse(yaml).unwrap();
        assert_eq!(config.datasets.len(), 2);
        let submissions = &config.datasets[&DatasetKey::new("submissions")];
        assert_eq!(submissions.key.strip_prefix.as_deref(), Some("CIK"));
        assert_eq!(submissions.key.zero_pad, Some(10));
        let chunks = submissions.chunks.as_ref().unwrap();
        assert_eq!(chunks.suffix, "-submissions");
        assert_eq!(chunks.merge_path, "filings.recent");
        assert!(submissions.resume);
        assert!(submissions.required.is_empty());
        let facts = &config.datasets[&DatasetKey::new("facts")];
        assert_eq!(facts.required, vec!["entityName", "facts"]);
        assert_eq!(config.pools.io_workers, 16);
        assert_eq!(config.pools.aggregator_shards, 4);
        assert_eq!(config.batch.max_rows, 500);
    }

    #[test]
    fn test_no_datasets_rejected() {
        let yaml = "sink:\n  url: postgres://localhost/lake\n";
        assert!(Config::parse(yaml).is_err());
    }

    #[test]
    fn test_empty_sink_url_rejected() {
        let yaml = r#"
datasets:
  facts:
    source: /data/facts
    table: facts
"#;
        assert!(Config::parse(yaml).is_err());
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let yaml = r#"
datasets:
  facts:
    source: /data/facts
    table: facts
sink:
  url: postgres://localhost/lake
queues:
  raw_payloads: 0
"#;
        assert!(Config::parse(yaml).is_err());
    }

    #[test]
    fn test_env_interpolation() {
        std::env::set_var("SLEET_TEST_DB_URL", "postgres://db/lake");
        let yaml = r#"
datasets:
  facts:
    source: /data/facts
    table: facts
sink:
  url: ${SLEET_TEST_DB_URL}
"#;
        let config = Config::parse(yaml).unwrap();
        assert_eq!(config.sink.url, "postgres://db/lake");
    }

    #[test]
    fn test_merge_rejects_duplicate_datasets() {
        let mut base = Config::parse_yaml(MINIMAL).unwrap();
        let other = Config::parse_yaml(MINIMAL).unwrap();
        assert!(base.merge(other).is_err());
    }

    #[test]
    fn test_merge_combines_datasets_and_settings() {
        let mut base = Config::parse_yaml(MINIMAL).unwrap();
        let other = Config::parse_yaml(
            r#"
datasets:
  facts:
    source: /data/facts
    table: facts
batch:
  max_rows: 250
"#,
        )
        .unwrap();
        base.merge(other).unwrap();
        assert_eq!(base.datasets.len(), 2);
        assert_eq!(base.batch.max_rows, 250);
        // Untouched sections keep the earlier file's values.
        assert_eq!(base.sink.url, "postgres://localhost/lake");
    }
}
