//! Sharded aggregator stage.
//!
//! Each shard owns its intake queue and the open batches for the
//! dataset tags hashed onto it, so every tag has exactly one writer and
//! no cross-worker contention on a filling batch. A batch seals when it
//! reaches the row cap, the byte budget, or the max-open-time, and is
//! handed atomically to the loader queue. On drain (intake closed) all
//! partially-filled batches are flushed rather than discarded.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

use sleet_common::emit;
use sleet_common::metrics::events::{BatchSealed, OpenBatches, SealReason};
use sleet_common::queue::{StageReceiver, StageSender};

use crate::config::{BatchConfig, DatasetKey};
use crate::pipeline::types::{ParsedRecord, RunCounters, SealedBatch};

/// How often shards sweep open batches for the max-open-time threshold.
const AGE_SWEEP_INTERVAL: Duration = Duration::from_millis(500);

struct OpenBatch {
    records: Vec<ParsedRecord>,
    bytes: usize,
    opened_at: Instant,
}

impl OpenBatch {
    fn new() -> Self {
        Self {
            records: Vec::new(),
            bytes: 0,
            opened_at: Instant::now(),
        }
    }
}

/// Spawn one task per aggregator shard.
///
/// `tables` maps each dataset tag to its target table. Each task
/// resolves with the number of batches it sealed per tag, so the
/// coordinator can reconcile sealed batches against load outcomes.
pub fn spawn_shards(
    shard_rxs: Vec<StageReceiver<ParsedRecord>>,
    batch_tx: StageSender<SealedBatch>,
    config: BatchConfig,
    tables: Arc<HashMap<DatasetKey, String>>,
    counters: Arc<RunCounters>,
) -> Vec<JoinHandle<HashMap<DatasetKey, u64>>> {
    shard_rxs
        .into_iter()
        .enumerate()
        .map(|(shard, intake)| {
            let batch_tx = batch_tx.clone();
            let config = config.clone();
            let tables = Arc::clone(&tables);
            let counters = Arc::clone(&counters);
            tokio::spawn(async move {
                run_shard(shard, intake, batch_tx, config, tables, counters).await
            })
        })
        .collect()
}

async fn run_shard(
    shard: usize,
    intake: StageReceiver<ParsedRecord>,
    batch_tx: StageSender<SealedBatch>,
    config: BatchConfig,
    tables: Arc<HashMap<DatasetKey, String>>,
    counters: Arc<RunCounters>,
) -> HashMap<DatasetKey, u64> {
    let mut open: HashMap<DatasetKey, OpenBatch> = HashMap::new();
    // Monotonic per-tag sequence numbers; this shard is the only writer
    // for its tags, so plain counters suffice.
    let mut sequences: HashMap<DatasetKey, u64> = HashMap::new();
    let mut sweep = tokio::time::interval(AGE_SWEEP_INTERVAL);
    sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            maybe = intake.recv() => {
                let Some(record) = maybe else { break };
                let dataset = record.dataset.clone();
                let batch = open.entry(dataset.clone()).or_insert_with(OpenBatch::new);
                batch.bytes += record.approx_bytes;
                batch.records.push(record);

                let reason = if batch.records.len() >= config.max_rows {
                    Some(SealReason::Rows)
                } else if batch.bytes >= config.max_bytes() {
                    Some(SealReason::Bytes)
                } else {
                    None
                };

                if let Some(reason) = reason {
                    let Some(batch) = open.remove(&dataset) else { continue };
                    if !seal_and_send(
                        shard, &dataset, batch, reason, &mut sequences,
                        &batch_tx, &tables, &counters,
                    )
                    .await
                    {
                        return sequences;
                    }
                    emit!(OpenBatches { count: open.len(), shard });
                }
            }
            _ = sweep.tick() => {
                let aged: Vec<DatasetKey> = open
                    .iter()
                    .filter(|(_, batch)| batch.opened_at.elapsed() >= config.max_open())
                    .map(|(dataset, _)| dataset.clone())
                    .collect();
                for dataset in aged {
                    if let Some(batch) = open.remove(&dataset) {
                        if !seal_and_send(
                            shard, &dataset, batch, SealReason::Age, &mut sequences,
                            &batch_tx, &tables, &counters,
                        )
                        .await
                        {
                            return sequences;
                        }
                    }
                }
                emit!(OpenBatches { count: open.len(), shard });
            }
        }
    }

    // Drain: flush every partially-filled batch.
    debug!("[aggregate:{shard}] Intake closed, flushing {} open batches", open.len());
    for (dataset, batch) in open.drain() {
        if !seal_and_send(
            shard, &dataset, batch, SealReason::Drain, &mut sequences,
            &batch_tx, &tables, &counters,
        )
        .await
        {
            return sequences;
        }
    }
    emit!(OpenBatches { count: 0, shard });
    debug!("[aggregate:{shard}] Shard exiting");
    sequences
}

/// Seal a batch and hand it to the loader queue.
///
/// Returns false when the loader queue is closed.
#[allow(clippy::too_many_arguments)]
async fn seal_and_send(
    shard: usize,
    dataset: &DatasetKey,
    batch: OpenBatch,
    reason: SealReason,
    sequences: &mut HashMap<DatasetKey, u64>,
    batch_tx: &StageSender<SealedBatch>,
    tables: &HashMap<DatasetKey, String>,
    counters: &RunCounters,
) -> bool {
    if batch.records.is_empty() {
        return true;
    }

    let sequence = sequences.entry(dataset.clone()).or_insert(0);
    let sealed = SealedBatch {
        dataset: dataset.clone(),
        table: tables
            .get(dataset)
            .cloned()
            .unwrap_or_else(|| dataset.id().to_string()),
        sequence: *sequence,
        bytes: batch.bytes,
        records: batch.records,
    };
    *sequence += 1;

    RunCounters::add(&counters.batches_sealed, 1);
    emit!(BatchSealed {
        reason,
        rows: sealed.rows(),
        dataset: dataset.to_string(),
    });
    debug!(
        shard,
        dataset = %dataset,
        sequence = sealed.sequence,
        rows = sealed.rows(),
        bytes = sealed.bytes,
        reason = reason.as_str(),
        "Sealed batch"
    );

    if batch_tx.send(sealed).await.is_err() {
        debug!("[aggregate:{shard}] Loader queue closed, stopping");
        return false;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use sleet_common::metrics;
    use sleet_common::queue::StageQueue;

    fn record(dataset: &str, key: &str, approx_bytes: usize) -> ParsedRecord {
        ParsedRecord {
            dataset: DatasetKey::new(dataset),
            entity_key: key.to_string(),
            document: json!({"k": key}),
            approx_bytes,
            physical_files: 1,
        }
    }

    fn tables(entries: &[(&str, &str)]) -> Arc<HashMap<DatasetKey, String>> {
        Arc::new(
            entries
                .iter()
                .map(|(dataset, table)| (DatasetKey::new(*dataset), table.to_string()))
                .collect(),
        )
    }

    fn config(max_rows: usize, max_bytes_mb: usize, max_open_secs: u64) -> BatchConfig {
        BatchConfig {
            max_rows,
            max_bytes_mb,
            max_open_secs,
        }
    }

    #[tokio::test]
    async fn test_seals_on_row_count() {
        metrics::init_test();
        let (record_tx, record_rx) = StageQueue::new("records", 16).channel();
        let (batch_tx, batch_rx) = StageQueue::new("batches", 16).channel();
        let counters = RunCounters::new();

        let handles = spawn_shards(
            vec![record_rx],
            batch_tx,
            config(3, 1000, 3600),
            tables(&[("facts", "facts_table")]),
            Arc::clone(&counters),
        );

        for i in 0..7 {
            record_tx.send(record("facts", &i.to_string(), 10)).await.unwrap();
        }
        drop(record_tx);

        let first = batch_rx.recv().await.unwrap();
        assert_eq!(first.sequence, 0);
        assert_eq!(first.rows(), 3);
        assert_eq!(first.table, "facts_table");

        let second = batch_rx.recv().await.unwrap();
        assert_eq!(second.sequence, 1);
        assert_eq!(second.rows(), 3);

        // Remaining record is flushed on drain.
        let third = batch_rx.recv().await.unwrap();
        assert_eq!(third.sequence, 2);
        assert_eq!(third.rows(), 1);

        assert!(batch_rx.recv().await.is_none());
        let mut sealed: HashMap<DatasetKey, u64> = HashMap::new();
        for handle in handles {
            sealed.extend(handle.await.unwrap());
        }
        assert_eq!(sealed[&DatasetKey::new("facts")], 3);
        assert_eq!(RunCounters::get(&counters.batches_sealed), 3);
    }

    #[tokio::test]
    async fn test_seals_on_byte_budget() {
        metrics::init_test();
        let (record_tx, record_rx) = StageQueue::new("records", 16).channel();
        let (batch_tx, batch_rx) = StageQueue::new("batches", 16).channel();
        let counters = RunCounters::new();

        // 1 MB budget, rows never reached.
        let handles = spawn_shards(
            vec![record_rx],
            batch_tx,
            config(1000, 1, 3600),
            tables(&[("facts", "facts")]),
            counters,
        );

        // Two ~600 KB records cross the budget on the second append.
        record_tx.send(record("facts", "a", 600 * 1024)).await.unwrap();
        record_tx.send(record("facts", "b", 600 * 1024)).await.unwrap();
        drop(record_tx);

        let batch = batch_rx.recv().await.unwrap();
        assert_eq!(batch.rows(), 2);
        assert!(batch.bytes >= 1024 * 1024);
        assert!(batch_rx.recv().await.is_none());
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_seals_on_max_open_time() {
        metrics::init_test();
        let (record_tx, record_rx) = StageQueue::new("records", 16).channel();
        let (batch_tx, batch_rx) = StageQueue::new("batches", 16).channel();
        let counters = RunCounters::new();

        let _handles = spawn_shards(
            vec![record_rx],
            batch_tx,
            config(1000, 1000, 2),
            tables(&[("facts", "facts")]),
            counters,
        );

        record_tx.send(record("facts", "a", 10)).await.unwrap();

        // Well past max_open_secs; the sweep should seal the batch
        // without further input.
        tokio::time::sleep(Duration::from_secs(5)).await;

        let batch = batch_rx.recv().await.unwrap();
        assert_eq!(batch.rows(), 1);
        drop(record_tx);
    }

    #[tokio::test]
    async fn test_sequences_are_per_dataset() {
        metrics::init_test();
        let (record_tx, record_rx) = StageQueue::new("records", 16).channel();
        let (batch_tx, batch_rx) = StageQueue::new("batches", 16).channel();
        let counters = RunCounters::new();

        let handles = spawn_shards(
            vec![record_rx],
            batch_tx,
            config(1, 1000, 3600),
            tables(&[("a", "a"), ("b", "b")]),
            counters,
        );

        record_tx.send(record("a", "1", 1)).await.unwrap();
        record_tx.send(record("b", "1", 1)).await.unwrap();
        record_tx.send(record("a", "2", 1)).await.unwrap();
        drop(record_tx);

        let mut sequences: HashMap<String, Vec<u64>> = HashMap::new();
        while let Some(batch) = batch_rx.recv().await {
            sequences
                .entry(batch.dataset.id().to_string())
                .or_default()
                .push(batch.sequence);
        }
        assert_eq!(sequences["a"], vec![0, 1]);
        assert_eq!(sequences["b"], vec![0]);
        for handle in handles {
            handle.await.unwrap();
        }
    }
}
