//! Quarantine record types.
//!
//! Contains the data structures for representing failed files,
//! quarantined batch rows, and aggregated failure statistics.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use sleet_common::metrics::events::FailureStage;

/// A record representing a failed file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedFile {
    /// Path to the file that failed.
    pub path: String,
    /// Dataset tag.
    pub dataset: String,
    /// Error message describing the failure.
    pub error: String,
    /// Stage at which the failure occurred.
    pub stage: FailureStage,
    /// Timestamp when the failure was recorded.
    pub timestamp: DateTime<Utc>,
}

/// One row from a quarantined batch, written so the batch can be
/// inspected and replayed later.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuarantinedRow {
    /// Dataset tag.
    pub dataset: String,
    /// Target table the batch was destined for.
    pub table: String,
    /// Batch sequence number within the dataset.
    pub sequence: u64,
    /// Entity key of the row.
    pub entity_key: String,
    /// The row's document body.
    pub document: serde_json::Value,
    /// Error that quarantined the batch.
    pub error: String,
    /// Timestamp when the batch was quarantined.
    pub timestamp: DateTime<Utc>,
}

/// Statistics about failures by stage.
#[derive(Debug, Clone, Default)]
pub struct FailureStats {
    pub enumerate: usize,
    pub read: usize,
    pub parse: usize,
    pub load: usize,
}

impl FailureStats {
    /// Increment the count for a specific stage.
    pub fn increment(&mut self, stage: FailureStage) {
        match stage {
            FailureStage::Enumerate => self.enumerate += 1,
            FailureStage::Read => self.read += 1,
            FailureStage::Parse => self.parse += 1,
            FailureStage::Load => self.load += 1,
        }
    }

    /// Get total failure count.
    pub fn total(&self) -> usize {
        self.enumerate + self.read + self.parse + self.load
    }
}
