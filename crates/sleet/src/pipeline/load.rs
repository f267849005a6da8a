//! Bulk loader pool.
//!
//! K workers take sealed batches and perform set-based bulk merges
//! against the sink. Transient sink errors retry the whole batch with
//! jittered backoff; permanent errors quarantine the batch and the run
//! continues; an unreachable sink that survives the top-level retry
//! budget fails the run by cancelling enumeration and letting the
//! pipeline drain.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use sleet_common::emit;
use sleet_common::metrics::events::{
    ActiveLoads, BatchLoaded, BatchQuarantined, LoadCompleted, LoadRetried,
};
use sleet_common::queue::{StageReceiver, StageSender};

use crate::config::RetryConfig;
use crate::error::SinkError;
use crate::pipeline::types::{LoadOutcome, LoadStatus, RunCounters, SealedBatch};
use crate::quarantine::QuarantineWriter;
use crate::sink::BulkSink;
use crate::source::reader::backoff_with_jitter;

/// Spawn the bulk loader pool.
pub fn spawn_pool(
    workers: usize,
    batch_rx: StageReceiver<SealedBatch>,
    outcome_tx: StageSender<LoadOutcome>,
    sink: Arc<dyn BulkSink>,
    retry: RetryConfig,
    counters: Arc<RunCounters>,
    quarantine: Option<Arc<QuarantineWriter>>,
    cancel: CancellationToken,
) -> Vec<JoinHandle<()>> {
    let active = Arc::new(AtomicUsize::new(0));
    (0..workers)
        .map(|worker| {
            let batch_rx = batch_rx.clone();
            let outcome_tx = outcome_tx.clone();
            let sink = Arc::clone(&sink);
            let retry = retry.clone();
            let counters = Arc::clone(&counters);
            let quarantine = quarantine.clone();
            let cancel = cancel.clone();
            let active = Arc::clone(&active);
            tokio::spawn(async move {
                run_worker(
                    worker, batch_rx, outcome_tx, sink, retry, counters, quarantine, cancel, active,
                )
                .await;
            })
        })
        .collect()
}

#[allow(clippy::too_many_arguments)]
async fn run_worker(
    worker: usize,
    batch_rx: StageReceiver<SealedBatch>,
    outcome_tx: StageSender<LoadOutcome>,
    sink: Arc<dyn BulkSink>,
    retry: RetryConfig,
    counters: Arc<RunCounters>,
    quarantine: Option<Arc<QuarantineWriter>>,
    cancel: CancellationToken,
    active: Arc<AtomicUsize>,
) {
    while let Some(batch) = batch_rx.recv().await {
        emit!(ActiveLoads {
            count: active.fetch_add(1, Ordering::Relaxed) + 1,
        });
        let outcome = load_batch(&batch, sink.as_ref(), &retry, &counters, &quarantine).await;
        emit!(ActiveLoads {
            count: active.fetch_sub(1, Ordering::Relaxed) - 1,
        });

        let fatal = matches!(outcome.status, LoadStatus::SinkUnavailable { .. });
        if outcome_tx.send(outcome).await.is_err() {
            debug!("[load:{worker}] Coordinator gone, stopping");
            return;
        }
        if fatal {
            // Stop enumeration; in-flight work drains, no new loads here.
            error!("[load:{worker}] Sink unavailable, failing the run");
            cancel.cancel();
            return;
        }
    }
    debug!("[load:{worker}] Upstream closed, worker exiting");
}

/// Drive one batch to a terminal status.
async fn load_batch(
    batch: &SealedBatch,
    sink: &dyn BulkSink,
    retry: &RetryConfig,
    counters: &RunCounters,
    quarantine: &Option<Arc<QuarantineWriter>>,
) -> LoadOutcome {
    let rows = batch.rows();
    let physical_files = batch.physical_files();
    let start = Instant::now();
    let mut retries = 0u32;

    let status = loop {
        match sink.bulk_merge(batch).await {
            Ok(written) => {
                RunCounters::add(&counters.batches_loaded, 1);
                RunCounters::add(&counters.rows_loaded, written);
                emit!(BatchLoaded {
                    rows: written,
                    dataset: batch.dataset.to_string(),
                });
                emit!(LoadCompleted {
                    duration: start.elapsed(),
                    dataset: batch.dataset.to_string(),
                });
                return LoadOutcome {
                    dataset: batch.dataset.clone(),
                    sequence: batch.sequence,
                    rows_written: written,
                    rows_rejected: 0,
                    physical_files,
                    retries,
                    status: LoadStatus::Loaded,
                };
            }
            Err(e @ SinkError::Permanent { .. }) => {
                break LoadStatus::Quarantined {
                    reason: e.to_string(),
                };
            }
            Err(e) => {
                // Transient and unavailable both retry; they diverge
                // only once the budget is spent.
                let attempt = retries + 1;
                if attempt >= retry.load_attempts {
                    break match e {
                        SinkError::Unavailable { message } => {
                            LoadStatus::SinkUnavailable { reason: message }
                        }
                        other => LoadStatus::Quarantined {
                            reason: format!("retries exhausted: {other}"),
                        },
                    };
                }
                retries = attempt;
                RunCounters::add(&counters.load_retries, 1);
                emit!(LoadRetried {
                    attempt,
                    dataset: batch.dataset.to_string(),
                });
                let backoff = backoff_with_jitter(retry.load_backoff(), attempt);
                warn!(
                    dataset = %batch.dataset,
                    sequence = batch.sequence,
                    attempt,
                    backoff_ms = backoff.as_millis() as u64,
                    "Batch load failed, retrying: {e}"
                );
                tokio::time::sleep(backoff).await;
            }
        }
    };

    // Terminal failure path.
    match &status {
        LoadStatus::Quarantined { reason } => {
            RunCounters::add(&counters.batches_quarantined, 1);
            RunCounters::add(&counters.rows_quarantined, rows);
            emit!(BatchQuarantined {
                rows,
                dataset: batch.dataset.to_string(),
            });
            warn!(
                dataset = %batch.dataset,
                sequence = batch.sequence,
                rows,
                "Quarantining batch: {reason}"
            );
            if let Some(quarantine) = quarantine {
                quarantine.record_batch(batch, reason).await;
            }
        }
        LoadStatus::SinkUnavailable { reason } => {
            error!(
                dataset = %batch.dataset,
                sequence = batch.sequence,
                "Sink unavailable after {} attempts: {reason}",
                retry.load_attempts
            );
        }
        LoadStatus::Loaded => unreachable!("loaded batches return early"),
    }

    LoadOutcome {
        dataset: batch.dataset.clone(),
        sequence: batch.sequence,
        rows_written: 0,
        rows_rejected: rows,
        physical_files,
        retries,
        status,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DatasetKey;
    use crate::pipeline::types::ParsedRecord;
    use crate::sink::{FailureScript, MemorySink};
    use serde_json::json;
    use sleet_common::metrics;

    fn batch(sequence: u64, keys: &[&str]) -> SealedBatch {
        let records: Vec<ParsedRecord> = keys
            .iter()
            .map(|key| ParsedRecord {
                dataset: DatasetKey::new("facts"),
                entity_key: key.to_string(),
                document: json!({"k": key}),
                approx_bytes: 16,
                physical_files: 1,
            })
            .collect();
        SealedBatch {
            dataset: DatasetKey::new("facts"),
            table: "facts".to_string(),
            sequence,
            bytes: records.len() * 16,
            records,
        }
    }

    fn retry_fast() -> RetryConfig {
        RetryConfig {
            load_attempts: 3,
            load_backoff_ms: 1,
            ..RetryConfig::default()
        }
    }

    #[tokio::test]
    async fn test_load_success() {
        metrics::init_test();
        let sink = MemorySink::new();
        let counters = RunCounters::new();
        let outcome = load_batch(&batch(0, &["a", "b"]), &sink, &retry_fast(), &counters, &None).await;

        assert_eq!(outcome.status, LoadStatus::Loaded);
        assert_eq!(outcome.rows_written, 2);
        assert_eq!(outcome.retries, 0);
        assert_eq!(RunCounters::get(&counters.rows_loaded), 2);
    }

    #[tokio::test]
    async fn test_transient_error_retries_then_succeeds() {
        metrics::init_test();
        let script = Arc::new(FailureScript::new());
        script.fail_transient(1).await;
        let sink = MemorySink::with_script(script);
        let counters = RunCounters::new();

        let outcome = load_batch(&batch(0, &["a"]), &sink, &retry_fast(), &counters, &None).await;

        assert_eq!(outcome.status, LoadStatus::Loaded);
        assert_eq!(outcome.retries, 1);
        assert_eq!(RunCounters::get(&counters.load_retries), 1);
        assert_eq!(sink.row_count("facts").await, 1);
    }

    #[tokio::test]
    async fn test_permanent_error_quarantines() {
        metrics::init_test();
        let script = Arc::new(FailureScript::new());
        script.fail_permanent(1).await;
        let sink = MemorySink::with_script(script);
        let counters = RunCounters::new();

        let outcome = load_batch(&batch(4, &["a", "b"]), &sink, &retry_fast(), &counters, &None).await;

        assert!(matches!(outcome.status, LoadStatus::Quarantined { .. }));
        assert_eq!(outcome.rows_rejected, 2);
        assert_eq!(RunCounters::get(&counters.batches_quarantined), 1);
        assert_eq!(RunCounters::get(&counters.rows_quarantined), 2);
        // No partial write survives.
        assert_eq!(sink.row_count("facts").await, 0);
    }

    #[tokio::test]
    async fn test_exhausted_transient_retries_quarantine() {
        metrics::init_test();
        let script = Arc::new(FailureScript::new());
        script.fail_transient(1).await;
        script.fail_transient(2).await;
        script.fail_transient(3).await;
        let sink = MemorySink::with_script(script);
        let counters = RunCounters::new();

        let outcome = load_batch(&batch(0, &["a"]), &sink, &retry_fast(), &counters, &None).await;

        assert!(matches!(outcome.status, LoadStatus::Quarantined { .. }));
        assert_eq!(outcome.retries, 2);
    }

    #[tokio::test]
    async fn test_unavailable_sink_is_fatal_after_budget() {
        metrics::init_test();
        let script = Arc::new(FailureScript::new());
        script.fail_unavailable(1).await;
        script.fail_unavailable(2).await;
        script.fail_unavailable(3).await;
        let sink = MemorySink::with_script(script);
        let counters = RunCounters::new();

        let outcome = load_batch(&batch(0, &["a"]), &sink, &retry_fast(), &counters, &None).await;

        assert!(matches!(outcome.status, LoadStatus::SinkUnavailable { .. }));
    }

    #[tokio::test]
    async fn test_unavailable_then_recovered_loads() {
        metrics::init_test();
        let script = Arc::new(FailureScript::new());
        script.fail_unavailable(1).await;
        let sink = MemorySink::with_script(script);
        let counters = RunCounters::new();

        let outcome = load_batch(&batch(0, &["a"]), &sink, &retry_fast(), &counters, &None).await;

        assert_eq!(outcome.status, LoadStatus::Loaded);
        assert_eq!(outcome.retries, 1);
    }
}
