//! Bulk sink trait and implementations.
//!
//! The pipeline talks to its storage target through `BulkSink` only:
//! set-based merge writes keyed by entity key, plus the key listing
//! used for resumed runs. `postgres` is the production sink; `memory`
//! backs tests and dry runs.

mod memory;
mod postgres;

pub use memory::{FailureScript, MemorySink};
pub use postgres::PostgresSink;

use std::collections::HashSet;

use async_trait::async_trait;

use crate::error::SinkError;
use crate::pipeline::types::SealedBatch;

/// A relational sink capable of idempotent bulk merges.
#[async_trait]
pub trait BulkSink: Send + Sync {
    /// Ensure the target table exists before loading begins.
    async fn ensure_table(&self, table: &str) -> Result<(), SinkError>;

    /// Merge a sealed batch into its target table.
    ///
    /// Insert-or-update keyed by entity key. The write must be atomic
    /// for the whole batch: on any error, no subset of the batch's rows
    /// may remain committed. Returns the number of rows merged.
    ///
    /// Implementations must be exclusive between concurrent batches of
    /// the same table while allowing different tables to load fully in
    /// parallel.
    async fn bulk_merge(&self, batch: &SealedBatch) -> Result<u64, SinkError>;

    /// Entity keys already present in a table, used to filter
    /// enumeration on resumed runs.
    async fn existing_keys(&self, table: &str) -> Result<HashSet<String>, SinkError>;
}
