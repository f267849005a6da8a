//! Quarantine writer.
//!
//! Records failed files and permanently-rejected batches to NDJSON
//! files for later inspection and replay. One pair of files per run,
//! timestamp-suffixed, written under the configured quarantine
//! directory.

use chrono::Utc;
use snafu::prelude::*;
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

use sleet_common::error::{
    QuarantineDirSnafu, QuarantineError, QuarantineSerializeSnafu, QuarantineWriteSnafu,
};
use sleet_common::metrics::events::FailureStage;

use crate::config::ErrorHandlingConfig;
use crate::pipeline::types::SealedBatch;

use super::types::{FailedFile, FailureStats, QuarantinedRow};

const FLUSH_THRESHOLD: usize = 100;

/// Writes failure and quarantine records as NDJSON.
pub struct QuarantineWriter {
    failures_path: PathBuf,
    batches_path: PathBuf,
    failures: Mutex<Vec<FailedFile>>,
    rows: Mutex<Vec<QuarantinedRow>>,
    stats: Mutex<FailureStats>,
}

impl QuarantineWriter {
    /// Create a writer from configuration.
    ///
    /// Returns `None` if no quarantine path is configured.
    pub async fn from_config(
        config: &ErrorHandlingConfig,
    ) -> Result<Option<Self>, QuarantineError> {
        let Some(dir) = &config.quarantine_path else {
            return Ok(None);
        };

        let dir = PathBuf::from(dir);
        tokio::fs::create_dir_all(&dir)
            .await
            .context(QuarantineDirSnafu)?;

        // One file pair per run
        let timestamp = Utc::now().format("%Y%m%d-%H%M%S");
        let failures_path = dir.join(format!("failures-{timestamp}.ndjson"));
        let batches_path = dir.join(format!("batches-{timestamp}.ndjson"));

        info!(
            "Quarantine enabled: {} / {}",
            failures_path.display(),
            batches_path.display()
        );

        Ok(Some(Self {
            failures_path,
            batches_path,
            failures: Mutex::new(Vec::new()),
            rows: Mutex::new(Vec::new()),
            stats: Mutex::new(FailureStats::default()),
        }))
    }

    /// Record a file failure.
    pub async fn record_failure(&self, path: &str, dataset: &str, error: &str, stage: FailureStage) {
        let failed = FailedFile {
            path: path.to_string(),
            dataset: dataset.to_string(),
            error: error.to_string(),
            stage,
            timestamp: Utc::now(),
        };

        debug!("Recording quarantine failure: {} at stage {}", path, stage.as_str());

        {
            let mut stats = self.stats.lock().await;
            stats.increment(stage);
        }

        let should_flush = {
            let mut buffer = self.failures.lock().await;
            buffer.push(failed);
            buffer.len() >= FLUSH_THRESHOLD
        };

        if should_flush {
            if let Err(e) = self.flush().await {
                error!("Failed to flush quarantine records: {}", e);
            }
        }
    }

    /// Divert a permanently-failed batch's rows to quarantine.
    pub async fn record_batch(&self, batch: &SealedBatch, error: &str) {
        let timestamp = Utc::now();
        let quarantined: Vec<QuarantinedRow> = batch
            .records
            .iter()
            .map(|record| QuarantinedRow {
                dataset: batch.dataset.to_string(),
                table: batch.table.clone(),
                sequence: batch.sequence,
                entity_key: record.entity_key.clone(),
                document: record.document.clone(),
                error: error.to_string(),
                timestamp,
            })
            .collect();

        debug!(
            dataset = %batch.dataset,
            sequence = batch.sequence,
            rows = quarantined.len(),
            "Quarantining batch"
        );

        {
            let mut stats = self.stats.lock().await;
            stats.increment(FailureStage::Load);
        }

        let should_flush = {
            let mut buffer = self.rows.lock().await;
            buffer.extend(quarantined);
            buffer.len() >= FLUSH_THRESHOLD
        };

        if should_flush {
            if let Err(e) = self.flush().await {
                error!("Failed to flush quarantine records: {}", e);
            }
        }
    }

    /// Flush buffered records to disk.
    pub async fn flush(&self) -> Result<(), QuarantineError> {
        let failures = {
            let mut buffer = self.failures.lock().await;
            std::mem::take(&mut *buffer)
        };
        let rows = {
            let mut buffer = self.rows.lock().await;
            std::mem::take(&mut *buffer)
        };

        if !failures.is_empty() {
            append_ndjson(&self.failures_path, &failures).await?;
            debug!("Flushed {} failure records", failures.len());
        }
        if !rows.is_empty() {
            append_ndjson(&self.batches_path, &rows).await?;
            debug!("Flushed {} quarantined rows", rows.len());
        }
        Ok(())
    }

    /// Finalize, flushing any remaining records and logging totals.
    pub async fn finalize(&self) -> Result<(), QuarantineError> {
        self.flush().await?;
        let stats = self.stats.lock().await;
        info!(
            "Quarantine finalized: {} total failures (enumerate={}, read={}, parse={}, load={})",
            stats.total(),
            stats.enumerate,
            stats.read,
            stats.parse,
            stats.load
        );
        Ok(())
    }
}

async fn append_ndjson<T: serde::Serialize>(
    path: &PathBuf,
    records: &[T],
) -> Result<(), QuarantineError> {
    let mut ndjson = String::new();
    for record in records {
        let line = serde_json::to_string(record).context(QuarantineSerializeSnafu)?;
        ndjson.push_str(&line);
        ndjson.push('\n');
    }

    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .context(QuarantineWriteSnafu)?;
    file.write_all(ndjson.as_bytes())
        .await
        .context(QuarantineWriteSnafu)?;
    file.flush().await.context(QuarantineWriteSnafu)?;
    Ok(())
}
