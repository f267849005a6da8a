//! Failure tracking with quarantine integration.
//!
//! Provides a shared interface for recording failed files during
//! pipeline execution, with automatic quarantine recording and
//! max_failures enforcement.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio_util::sync::CancellationToken;
use tracing::error;

use sleet_common::emit;
use sleet_common::metrics::events::{FailureStage, FileFailed, FileProcessed, FileStatus};

use crate::error::{MaxFailuresSnafu, PipelineError};

use super::QuarantineWriter;

/// Tracks failures across worker pools and enforces max_failures.
///
/// Shared by reference between all workers; counting is atomic so no
/// stage ever blocks another through the tracker.
pub struct FailureTracker {
    count: AtomicUsize,
    max_failures: usize,
    quarantine: Option<Arc<QuarantineWriter>>,
    cancel: Option<CancellationToken>,
}

impl FailureTracker {
    /// Create a new failure tracker.
    ///
    /// # Arguments
    /// * `max_failures` - Maximum failures before stopping (0 = unlimited)
    /// * `quarantine` - Optional quarantine writer for recording failures
    pub fn new(max_failures: usize, quarantine: Option<Arc<QuarantineWriter>>) -> Self {
        Self {
            count: AtomicUsize::new(0),
            max_failures,
            quarantine,
            cancel: None,
        }
    }

    /// Cancel this token when max_failures is reached, so enumeration
    /// stops and the pipeline drains instead of deadlocking behind a
    /// still-producing enumerator.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Record a failed file, emit metrics, and check the max_failures
    /// limit.
    ///
    /// Returns `Err` if max_failures has been reached (after flushing
    /// the quarantine writer).
    pub async fn record_failure(
        &self,
        path: &str,
        dataset: &str,
        error: &str,
        stage: FailureStage,
    ) -> Result<(), PipelineError> {
        let count = self.count.fetch_add(1, Ordering::SeqCst) + 1;
        emit!(FileProcessed {
            status: FileStatus::Failed,
            count: 1,
            dataset: dataset.to_string(),
        });
        emit!(FileFailed {
            stage,
            dataset: dataset.to_string(),
        });

        if let Some(quarantine) = &self.quarantine {
            quarantine.record_failure(path, dataset, error, stage).await;
        }

        if self.max_failures > 0 && count >= self.max_failures {
            error!("Max failures ({}) reached, stopping pipeline", count);
            if let Some(cancel) = &self.cancel {
                cancel.cancel();
            }
            self.finalize_quarantine().await;
            return MaxFailuresSnafu { count }.fail();
        }

        Ok(())
    }

    /// Finalize the quarantine writer, logging any errors.
    pub async fn finalize_quarantine(&self) {
        if let Some(quarantine) = &self.quarantine {
            if let Err(e) = quarantine.finalize().await {
                error!("Failed to finalize quarantine: {}", e);
            }
        }
    }

    /// Returns true if any failures were recorded.
    pub fn has_failures(&self) -> bool {
        self.count() > 0
    }

    /// Returns the failure count.
    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }
}
