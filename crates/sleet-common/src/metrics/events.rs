//! Internal events for metrics emission.
//!
//! Each event struct represents a measurable occurrence in the pipeline.
//! Events implement the `InternalEvent` trait which emits the corresponding
//! Prometheus metric.
//!
//! ## Dataset Labels
//!
//! For multi-dataset runs, metrics include a `dataset` label so each
//! dataset tag can be observed independently (e.g., `"submissions"`,
//! `"company-facts"`).

use metrics::{counter, gauge, histogram};
use std::time::Duration;
use tracing::trace;

/// Trait for internal events that can be emitted as metrics.
pub trait InternalEvent {
    /// Emit this event as a metric.
    fn emit(self);
}

/// Event emitted when source files are discovered by the enumerator.
pub struct FilesEnumerated {
    pub count: u64,
    /// Dataset label for multi-dataset runs.
    pub dataset: String,
}

impl InternalEvent for FilesEnumerated {
    fn emit(self) {
        trace!(count = self.count, dataset = %self.dataset, "Files enumerated");
        counter!("sleet_files_enumerated_total", "dataset" => self.dataset).increment(self.count);
    }
}

/// Event emitted when raw bytes are read from a source file.
pub struct BytesRead {
    pub bytes: u64,
    /// Dataset label for multi-dataset runs.
    pub dataset: String,
}

impl InternalEvent for BytesRead {
    fn emit(self) {
        trace!(bytes = self.bytes, dataset = %self.dataset, "Bytes read");
        counter!("sleet_bytes_read_total", "dataset" => self.dataset).increment(self.bytes);
    }
}

/// Event emitted when records pass structural validation and mapping.
pub struct RecordsParsed {
    pub count: u64,
    /// Dataset label for multi-dataset runs.
    pub dataset: String,
}

impl InternalEvent for RecordsParsed {
    fn emit(self) {
        trace!(count = self.count, dataset = %self.dataset, "Records parsed");
        counter!("sleet_records_parsed_total", "dataset" => self.dataset).increment(self.count);
    }
}

/// Terminal status of a processed file.
#[derive(Debug, Clone, Copy)]
pub enum FileStatus {
    Loaded,
    Skipped,
    Failed,
}

impl FileStatus {
    fn as_str(&self) -> &'static str {
        match self {
            FileStatus::Loaded => "loaded",
            FileStatus::Skipped => "skipped",
            FileStatus::Failed => "failed",
        }
    }
}

/// Stage at which a file failure occurred.
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureStage {
    Enumerate,
    Read,
    Parse,
    Load,
}

impl FailureStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureStage::Enumerate => "enumerate",
            FailureStage::Read => "read",
            FailureStage::Parse => "parse",
            FailureStage::Load => "load",
        }
    }
}

/// Event emitted when a file fails processing.
pub struct FileFailed {
    pub stage: FailureStage,
    /// Dataset label for multi-dataset runs.
    pub dataset: String,
}

impl InternalEvent for FileFailed {
    fn emit(self) {
        trace!(stage = self.stage.as_str(), dataset = %self.dataset, "File failed");
        counter!("sleet_files_failed_total", "stage" => self.stage.as_str(), "dataset" => self.dataset).increment(1);
    }
}

/// Event emitted when input files reach a terminal outcome.
pub struct FileProcessed {
    pub status: FileStatus,
    /// Physical files covered (chunk siblings count individually).
    pub count: u64,
    /// Dataset label for multi-dataset runs.
    pub dataset: String,
}

impl InternalEvent for FileProcessed {
    fn emit(self) {
        trace!(status = self.status.as_str(), count = self.count, dataset = %self.dataset, "Files processed");
        counter!("sleet_files_processed_total", "status" => self.status.as_str(), "dataset" => self.dataset).increment(self.count);
    }
}

/// Reason an aggregator sealed a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SealReason {
    Rows,
    Bytes,
    Age,
    Drain,
}

impl SealReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SealReason::Rows => "rows",
            SealReason::Bytes => "bytes",
            SealReason::Age => "age",
            SealReason::Drain => "drain",
        }
    }
}

/// Event emitted when an aggregator seals a batch.
pub struct BatchSealed {
    pub reason: SealReason,
    pub rows: u64,
    /// Dataset label for multi-dataset runs.
    pub dataset: String,
}

impl InternalEvent for BatchSealed {
    fn emit(self) {
        trace!(reason = self.reason.as_str(), rows = self.rows, dataset = %self.dataset, "Batch sealed");
        counter!("sleet_batches_sealed_total", "reason" => self.reason.as_str(), "dataset" => self.dataset).increment(1);
    }
}

/// Event emitted when a batch is durably loaded into the sink.
pub struct BatchLoaded {
    pub rows: u64,
    /// Dataset label for multi-dataset runs.
    pub dataset: String,
}

impl InternalEvent for BatchLoaded {
    fn emit(self) {
        trace!(rows = self.rows, dataset = %self.dataset, "Batch loaded");
        counter!("sleet_batches_loaded_total", "dataset" => self.dataset.clone()).increment(1);
        counter!("sleet_rows_loaded_total", "dataset" => self.dataset).increment(self.rows);
    }
}

/// Event emitted when a transient sink failure triggers a load retry.
pub struct LoadRetried {
    pub attempt: u32,
    /// Dataset label for multi-dataset runs.
    pub dataset: String,
}

impl InternalEvent for LoadRetried {
    fn emit(self) {
        trace!(attempt = self.attempt, dataset = %self.dataset, "Load retried");
        counter!("sleet_load_retries_total", "dataset" => self.dataset).increment(1);
    }
}

/// Event emitted when a batch is quarantined after exhausting retries
/// or hitting a permanent sink rejection.
pub struct BatchQuarantined {
    pub rows: u64,
    /// Dataset label for multi-dataset runs.
    pub dataset: String,
}

impl InternalEvent for BatchQuarantined {
    fn emit(self) {
        trace!(rows = self.rows, dataset = %self.dataset, "Batch quarantined");
        counter!("sleet_batches_quarantined_total", "dataset" => self.dataset).increment(1);
    }
}

// ============================================================================
// Histogram events for timing
// ============================================================================

/// Event emitted when a file read completes.
pub struct FileReadCompleted {
    pub duration: Duration,
    /// Dataset label for multi-dataset runs.
    pub dataset: String,
}

impl InternalEvent for FileReadCompleted {
    fn emit(self) {
        trace!(
            duration_ms = self.duration.as_millis(),
            dataset = %self.dataset,
            "File read completed"
        );
        histogram!("sleet_file_read_duration_seconds", "dataset" => self.dataset)
            .record(self.duration.as_secs_f64());
    }
}

/// Event emitted when a payload parse completes.
pub struct ParseCompleted {
    pub duration: Duration,
    /// Dataset label for multi-dataset runs.
    pub dataset: String,
}

impl InternalEvent for ParseCompleted {
    fn emit(self) {
        trace!(
            duration_ms = self.duration.as_millis(),
            dataset = %self.dataset,
            "Parse completed"
        );
        histogram!("sleet_parse_duration_seconds", "dataset" => self.dataset)
            .record(self.duration.as_secs_f64());
    }
}

/// Event emitted when a bulk load statement completes.
pub struct LoadCompleted {
    pub duration: Duration,
    /// Dataset label for multi-dataset runs.
    pub dataset: String,
}

impl InternalEvent for LoadCompleted {
    fn emit(self) {
        trace!(
            duration_ms = self.duration.as_millis(),
            dataset = %self.dataset,
            "Load completed"
        );
        histogram!("sleet_load_duration_seconds", "dataset" => self.dataset)
            .record(self.duration.as_secs_f64());
    }
}

// ============================================================================
// Gauge events for concurrency and backpressure
// ============================================================================

/// Event emitted when a stage queue's depth changes.
pub struct QueueDepth {
    pub depth: usize,
    /// Stable queue name (e.g., "file_units", "raw_payloads").
    pub queue: &'static str,
}

impl InternalEvent for QueueDepth {
    fn emit(self) {
        trace!(depth = self.depth, queue = self.queue, "Queue depth");
        gauge!("sleet_queue_depth", "queue" => self.queue).set(self.depth as f64);
    }
}

/// Event emitted when a producer has been blocked on a full queue for
/// longer than the stall threshold.
pub struct QueueStalled {
    /// Stable queue name (e.g., "file_units", "raw_payloads").
    pub queue: &'static str,
    pub waited: Duration,
}

impl InternalEvent for QueueStalled {
    fn emit(self) {
        trace!(queue = self.queue, waited_ms = self.waited.as_millis(), "Queue stalled");
        counter!("sleet_queue_stalls_total", "queue" => self.queue).increment(1);
    }
}

/// Event emitted when the number of open (unsealed) batches changes.
pub struct OpenBatches {
    pub count: usize,
    /// Aggregator shard index.
    pub shard: usize,
}

impl InternalEvent for OpenBatches {
    fn emit(self) {
        trace!(count = self.count, shard = self.shard, "Open batches");
        gauge!("sleet_open_batches", "shard" => self.shard.to_string()).set(self.count as f64);
    }
}

/// Event emitted when the number of in-flight loads changes.
pub struct ActiveLoads {
    pub count: usize,
}

impl InternalEvent for ActiveLoads {
    fn emit(self) {
        trace!(count = self.count, "Active loads");
        gauge!("sleet_active_loads").set(self.count as f64);
    }
}

// ============================================================================
// Resume / recovery events
// ============================================================================

/// Event emitted when already-loaded entities are skipped at enumeration
/// time on a resumed run.
pub struct ResumedEntitiesSkipped {
    pub count: u64,
    /// Dataset label for multi-dataset runs.
    pub dataset: String,
}

impl InternalEvent for ResumedEntitiesSkipped {
    fn emit(self) {
        trace!(count = self.count, dataset = %self.dataset, "Resumed entities skipped");
        counter!("sleet_resumed_entities_skipped_total", "dataset" => self.dataset)
            .increment(self.count);
    }
}
