//! In-memory sink for tests and dry runs.
//!
//! Mirrors the Postgres sink's merge semantics (last write per entity
//! key wins) with optional scripted failures so retry and quarantine
//! paths can be exercised deterministically.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::error::SinkError;
use crate::pipeline::types::SealedBatch;

use super::BulkSink;

/// Scripted failures, consumed in order by matching merge attempts.
#[derive(Debug, Default)]
pub struct FailureScript {
    /// Fail the Nth merge attempt (1-based, counted across all tables)
    /// with the given error.
    steps: Mutex<HashMap<u64, SinkErrorKind>>,
}

#[derive(Debug, Clone, Copy)]
enum SinkErrorKind {
    Transient,
    Permanent,
    Unavailable,
}

impl FailureScript {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn fail_transient(&self, attempt: u64) {
        self.steps
            .lock()
            .await
            .insert(attempt, SinkErrorKind::Transient);
    }

    pub async fn fail_permanent(&self, attempt: u64) {
        self.steps
            .lock()
            .await
            .insert(attempt, SinkErrorKind::Permanent);
    }

    pub async fn fail_unavailable(&self, attempt: u64) {
        self.steps
            .lock()
            .await
            .insert(attempt, SinkErrorKind::Unavailable);
    }

    async fn check(&self, attempt: u64) -> Result<(), SinkError> {
        let kind = self.steps.lock().await.remove(&attempt);
        match kind {
            None => Ok(()),
            Some(SinkErrorKind::Transient) => Err(SinkError::Transient {
                message: format!("scripted transient failure at attempt {attempt}"),
            }),
            Some(SinkErrorKind::Permanent) => Err(SinkError::Permanent {
                message: format!("scripted permanent failure at attempt {attempt}"),
            }),
            Some(SinkErrorKind::Unavailable) => Err(SinkError::Unavailable {
                message: format!("scripted unavailable failure at attempt {attempt}"),
            }),
        }
    }
}

/// In-memory bulk sink: per-table entity-key -> document maps.
#[derive(Default)]
pub struct MemorySink {
    tables: Mutex<HashMap<String, HashMap<String, Value>>>,
    script: Arc<FailureScript>,
    merge_attempts: AtomicU64,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_script(script: Arc<FailureScript>) -> Self {
        Self {
            script,
            ..Self::default()
        }
    }

    /// Total merge attempts observed, including scripted failures.
    pub fn merge_attempts(&self) -> u64 {
        self.merge_attempts.load(Ordering::Relaxed)
    }

    /// Row count for one table.
    pub async fn row_count(&self, table: &str) -> u64 {
        self.tables
            .lock()
            .await
            .get(table)
            .map(|rows| rows.len() as u64)
            .unwrap_or(0)
    }

    /// Fetch one stored document.
    pub async fn document(&self, table: &str, entity_key: &str) -> Option<Value> {
        self.tables
            .lock()
            .await
            .get(table)
            .and_then(|rows| rows.get(entity_key))
            .cloned()
    }
}

#[async_trait]
impl BulkSink for MemorySink {
    async fn ensure_table(&self, table: &str) -> Result<(), SinkError> {
        self.tables
            .lock()
            .await
            .entry(table.to_string())
            .or_default();
        Ok(())
    }

    async fn bulk_merge(&self, batch: &SealedBatch) -> Result<u64, SinkError> {
        let attempt = self.merge_attempts.fetch_add(1, Ordering::SeqCst) + 1;
        self.script.check(attempt).await?;

        let mut tables = self.tables.lock().await;
        let rows = tables.entry(batch.table.clone()).or_default();

        // Whole-batch commit under one lock; matches the transactional
        // sink's no-partial-write guarantee.
        let mut merged: HashSet<&str> = HashSet::with_capacity(batch.records.len());
        for record in &batch.records {
            rows.insert(record.entity_key.clone(), record.document.clone());
            merged.insert(record.entity_key.as_str());
        }
        Ok(merged.len() as u64)
    }

    async fn existing_keys(&self, table: &str) -> Result<HashSet<String>, SinkError> {
        Ok(self
            .tables
            .lock()
            .await
            .get(table)
            .map(|rows| rows.keys().cloned().collect())
            .unwrap_or_default())
    }
}
