//! Core data model flowing between pipeline stages.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use serde_json::Value;

use crate::config::DatasetKey;

/// One input unit: a main file plus any grouped chunk siblings.
///
/// Created by the enumerator, consumed exactly once by an IO worker.
/// Every unit must reach exactly one terminal outcome (loaded, skipped,
/// or failed); `physical_files` keeps the file counters honest when
/// chunks are grouped.
#[derive(Debug, Clone)]
pub struct FileUnit {
    pub dataset: DatasetKey,
    /// Entity key derived from the main file name.
    pub entity_key: String,
    /// The main document file.
    pub path: PathBuf,
    /// Chunk siblings, in merge order.
    pub chunk_paths: Vec<PathBuf>,
    /// Total size across main and chunk files, when known.
    pub size: u64,
}

impl FileUnit {
    pub fn physical_files(&self) -> u64 {
        1 + self.chunk_paths.len() as u64
    }
}

/// Raw bytes for one FileUnit, owned by the IO worker that produced it
/// until handed to a parse worker.
#[derive(Debug)]
pub struct RawPayload {
    pub unit: FileUnit,
    /// Main file contents.
    pub body: Bytes,
    /// Chunk contents, parallel to `unit.chunk_paths`.
    pub chunk_bodies: Vec<Bytes>,
}

/// A validated, normalized record ready for batching. Immutable once
/// produced.
#[derive(Debug, Clone)]
pub struct ParsedRecord {
    pub dataset: DatasetKey,
    pub entity_key: String,
    /// The merged, key-normalized document body.
    pub document: Value,
    /// Serialized-size estimate used for the batch byte budget.
    pub approx_bytes: usize,
    /// Physical source files this record accounts for.
    pub physical_files: u64,
}

/// A sealed batch, handed atomically from an aggregator shard to one
/// loader worker. Never mutated after sealing.
#[derive(Debug)]
pub struct SealedBatch {
    pub dataset: DatasetKey,
    /// Target table for the bulk merge.
    pub table: String,
    /// Monotonic per-dataset sequence number.
    pub sequence: u64,
    pub records: Vec<ParsedRecord>,
    /// Byte estimate at seal time.
    pub bytes: usize,
}

impl SealedBatch {
    pub fn rows(&self) -> u64 {
        self.records.len() as u64
    }

    pub fn physical_files(&self) -> u64 {
        self.records.iter().map(|r| r.physical_files).sum()
    }
}

/// Terminal status of one batch load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadStatus {
    /// Batch committed; all rows merged.
    Loaded,
    /// Batch permanently rejected or out of transient retries; its
    /// records were diverted to quarantine.
    Quarantined { reason: String },
    /// Sink unreachable after the top-level retry budget. Fails the run.
    SinkUnavailable { reason: String },
}

/// Outcome of one batch load, consumed only by the run coordinator.
#[derive(Debug)]
pub struct LoadOutcome {
    pub dataset: DatasetKey,
    pub sequence: u64,
    pub rows_written: u64,
    /// Rows in the batch that were not written (whole batch on failure).
    pub rows_rejected: u64,
    /// Physical source files accounted for by this batch.
    pub physical_files: u64,
    /// Transient retries spent before the terminal status.
    pub retries: u32,
    pub status: LoadStatus,
}

/// Process-wide counters, updated via atomic increments from any stage
/// and finalized into a `RunSummary` by the coordinator.
#[derive(Debug, Default)]
pub struct RunCounters {
    pub files_enumerated: AtomicU64,
    pub files_resumed_skipped: AtomicU64,
    pub files_read: AtomicU64,
    pub bytes_read: AtomicU64,
    pub files_parsed: AtomicU64,
    pub files_skipped: AtomicU64,
    pub files_failed: AtomicU64,
    /// Files whose records reached a committed batch. Bumped by the
    /// coordinator from LoadOutcomes.
    pub files_loaded: AtomicU64,
    pub batches_sealed: AtomicU64,
    pub batches_loaded: AtomicU64,
    pub batches_quarantined: AtomicU64,
    pub rows_loaded: AtomicU64,
    pub rows_quarantined: AtomicU64,
    pub load_retries: AtomicU64,
}

impl RunCounters {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add(counter: &AtomicU64, value: u64) {
        counter.fetch_add(value, Ordering::Relaxed);
    }

    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }

    /// Files that have reached a terminal outcome so far.
    pub fn files_terminal(&self) -> u64 {
        Self::get(&self.files_loaded)
            + Self::get(&self.files_skipped)
            + Self::get(&self.files_failed)
    }
}

/// Final run accounting, produced once by the coordinator at shutdown.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub files_enumerated: u64,
    pub files_resumed_skipped: u64,
    pub files_read: u64,
    pub bytes_read: u64,
    pub files_parsed: u64,
    pub files_skipped: u64,
    pub files_failed: u64,
    pub files_loaded: u64,
    pub batches_sealed: u64,
    pub batches_loaded: u64,
    pub batches_quarantined: u64,
    pub rows_loaded: u64,
    pub rows_quarantined: u64,
    pub load_retries: u64,
    pub elapsed: Duration,
    /// Per-dataset sequence gaps detected by the coordinator (sealed
    /// batches that never produced a LoadOutcome).
    pub sequence_gaps: u64,
}

impl RunSummary {
    pub fn from_counters(counters: &RunCounters, elapsed: Duration, sequence_gaps: u64) -> Self {
        Self {
            files_enumerated: RunCounters::get(&counters.files_enumerated),
            files_resumed_skipped: RunCounters::get(&counters.files_resumed_skipped),
            files_read: RunCounters::get(&counters.files_read),
            bytes_read: RunCounters::get(&counters.bytes_read),
            files_parsed: RunCounters::get(&counters.files_parsed),
            files_skipped: RunCounters::get(&counters.files_skipped),
            files_failed: RunCounters::get(&counters.files_failed),
            files_loaded: RunCounters::get(&counters.files_loaded),
            batches_sealed: RunCounters::get(&counters.batches_sealed),
            batches_loaded: RunCounters::get(&counters.batches_loaded),
            batches_quarantined: RunCounters::get(&counters.batches_quarantined),
            rows_loaded: RunCounters::get(&counters.rows_loaded),
            rows_quarantined: RunCounters::get(&counters.rows_quarantined),
            load_retries: RunCounters::get(&counters.load_retries),
            elapsed,
            sequence_gaps,
        }
    }

    /// True when every failure counter is zero.
    pub fn is_clean(&self) -> bool {
        self.files_failed == 0 && self.batches_quarantined == 0 && self.sequence_gaps == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_unit_physical_files() {
        let unit = FileUnit {
            dataset: DatasetKey::new("submissions"),
            entity_key: "0000320193".to_string(),
            path: PathBuf::from("/data/CIK0000320193.json"),
            chunk_paths: vec![
                PathBuf::from("/data/CIK0000320193-submissions-001.json"),
                PathBuf::from("/data/CIK0000320193-submissions-002.json"),
            ],
            size: 0,
        };
        assert_eq!(unit.physical_files(), 3);
    }

    #[test]
    fn test_summary_from_counters() {
        let counters = RunCounters::new();
        RunCounters::add(&counters.files_enumerated, 10);
        RunCounters::add(&counters.rows_loaded, 8);
        RunCounters::add(&counters.files_skipped, 2);

        let summary = RunSummary::from_counters(&counters, Duration::from_secs(1), 0);
        assert_eq!(summary.files_enumerated, 10);
        assert_eq!(summary.rows_loaded, 8);
        assert_eq!(summary.files_skipped, 2);
        assert!(summary.is_clean());
    }

    #[test]
    fn test_summary_not_clean_with_failures() {
        let counters = RunCounters::new();
        RunCounters::add(&counters.files_failed, 1);
        let summary = RunSummary::from_counters(&counters, Duration::ZERO, 0);
        assert!(!summary.is_clean());
    }
}
