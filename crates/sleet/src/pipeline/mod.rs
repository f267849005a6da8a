//! Pipeline assembly and execution.
//!
//! Wires the stages together: enumerator -> IO workers -> parse workers
//! -> aggregator shards -> loader pool -> coordinator, every hand-off a
//! bounded queue. Shutdown is a drain cascade: the enumerator drops the
//! first queue's sender (on exhaustion or cancellation) and each stage
//! exits when its intake closes, dropping its own senders in turn.

pub mod aggregate;
pub mod coordinator;
pub mod load;
pub mod parse;
pub mod types;

pub use coordinator::RunState;
pub use types::{RunCounters, RunSummary};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use sleet_common::queue::StageQueue;

use crate::config::{Config, DatasetKey};
use crate::error::PipelineError;
use crate::mapping::FieldMapping;
use crate::pipeline::parse::{ParseSpec, ParseSpecs};
use crate::quarantine::{FailureTracker, QuarantineWriter};
use crate::sink::BulkSink;
use crate::source::DatasetSource;
use crate::source::{enumerate, reader};

/// A fully-configured ingestion pipeline, run once.
pub struct Pipeline {
    config: Config,
    sink: Arc<dyn BulkSink>,
    cancel: CancellationToken,
}

impl Pipeline {
    pub fn new(config: Config, sink: Arc<dyn BulkSink>, cancel: CancellationToken) -> Self {
        Self {
            config,
            sink,
            cancel,
        }
    }

    /// Run the pipeline to completion.
    ///
    /// Resolves once every stage has drained and the coordinator has
    /// produced the final summary. Returns the terminal run state along
    /// with it; per-file and per-batch failures are counters in the
    /// summary, not errors here.
    pub async fn run(self) -> Result<(RunState, RunSummary), PipelineError> {
        let started_at = Instant::now();
        info!(
            datasets = self.config.datasets.len(),
            io_workers = self.config.pools.io_workers,
            parse_workers = self.config.pools.parse_workers,
            aggregator_shards = self.config.pools.aggregator_shards,
            loader_workers = self.config.pools.loader_workers,
            "Starting ingestion run"
        );

        let quarantine = QuarantineWriter::from_config(&self.config.error_handling)
            .await?
            .map(Arc::new);
        let tracker = Arc::new(
            FailureTracker::new(self.config.error_handling.max_failures, quarantine.clone())
                .with_cancellation(self.cancel.clone()),
        );
        let counters = RunCounters::new();

        // Stage queues. Capacities bound total in-flight memory; a full
        // queue blocks its producer.
        let stall = self.config.queues.stall_warn();
        let (file_tx, file_rx) = StageQueue::new("file_units", self.config.queues.file_units)
            .with_stall_warn(stall)
            .channel();
        let (payload_tx, payload_rx) =
            StageQueue::new("raw_payloads", self.config.queues.raw_payloads)
                .with_stall_warn(stall)
                .channel();
        let (batch_tx, batch_rx) =
            StageQueue::new("sealed_batches", self.config.queues.sealed_batches)
                .with_stall_warn(stall)
                .channel();
        let (outcome_tx, outcome_rx) =
            StageQueue::new("load_outcomes", self.config.queues.sealed_batches)
                .with_stall_warn(stall)
                .channel();
        let mut shard_txs = Vec::with_capacity(self.config.pools.aggregator_shards);
        let mut shard_rxs = Vec::with_capacity(self.config.pools.aggregator_shards);
        for _ in 0..self.config.pools.aggregator_shards {
            let (tx, rx) = StageQueue::new("parsed_records", self.config.queues.parsed_records)
                .with_stall_warn(stall)
                .channel();
            shard_txs.push(tx);
            shard_rxs.push(rx);
        }

        // The coordinator runs from here on; it sits in Starting while
        // the sink is prepared and the pools come up.
        let (start_tx, start_rx) = oneshot::channel();
        let (drain_tx, drain_rx) = oneshot::channel();
        let (sealed_tx, sealed_rx) = oneshot::channel();
        let coordinator = coordinator::spawn(
            outcome_rx,
            start_rx,
            drain_rx,
            sealed_rx,
            Arc::clone(&counters),
            self.config.error_handling.skip_ratio_warn,
            started_at,
        );

        // Prepare every dataset against the sink before any worker
        // starts: target tables must exist, and resumed datasets need
        // their already-loaded keys for enumeration-time filtering.
        let mut sources = Vec::with_capacity(self.config.datasets.len());
        let mut tables = HashMap::new();
        let mut specs = HashMap::new();
        for (key, dataset) in &self.config.datasets {
            self.sink.ensure_table(&dataset.table).await?;
            tables.insert(key.clone(), dataset.table.clone());

            let resume_keys = if dataset.resume {
                let keys = self.sink.existing_keys(&dataset.table).await?;
                info!(dataset = %key, existing = keys.len(), "Resuming; filtering loaded entities");
                Some(keys)
            } else {
                None
            };
            sources.push(DatasetSource {
                key: key.clone(),
                config: dataset.clone(),
                resume_keys,
            });

            let mapping = match &dataset.mapping_path {
                Some(path) => Arc::new(FieldMapping::from_file(path)?),
                None => Arc::new(FieldMapping::identity()),
            };
            specs.insert(
                key.clone(),
                ParseSpec {
                    mapping,
                    chunks: dataset.chunks.clone(),
                    required: dataset.required.clone(),
                },
            );
        }
        let tables = Arc::new(tables);
        let specs: ParseSpecs = Arc::new(specs);

        let enumerator = enumerate::spawn(
            sources,
            file_tx,
            self.cancel.clone(),
            Arc::clone(&counters),
            Arc::clone(&tracker),
        );
        let io_pool = reader::spawn_pool(
            self.config.pools.io_workers,
            file_rx,
            payload_tx,
            self.config.retry.clone(),
            Arc::clone(&counters),
            Arc::clone(&tracker),
        );
        let parse_pool = parse::spawn_pool(
            self.config.pools.parse_workers,
            payload_rx,
            shard_txs,
            specs,
            Arc::clone(&counters),
            quarantine.clone(),
        );
        let shards = aggregate::spawn_shards(
            shard_rxs,
            batch_tx,
            self.config.batch.clone(),
            tables,
            Arc::clone(&counters),
        );
        let loaders = load::spawn_pool(
            self.config.pools.loader_workers,
            batch_rx,
            outcome_tx,
            Arc::clone(&self.sink),
            self.config.retry.clone(),
            Arc::clone(&counters),
            quarantine.clone(),
            self.cancel.clone(),
        );
        let _ = start_tx.send(());

        // The drain cascade starts when the enumerator finishes; tell
        // the coordinator so its state machine can leave Running.
        enumerator.await?;
        let _ = drain_tx.send(());
        debug!("Enumeration complete, draining");

        join_pool(io_pool).await?;
        join_pool(parse_pool).await?;

        // Shards resolve with their per-dataset sealed tallies; the
        // coordinator reconciles these against load outcomes.
        let mut sealed_counts: HashMap<DatasetKey, u64> = HashMap::new();
        for shard in shards {
            for (dataset, count) in shard.await? {
                *sealed_counts.entry(dataset).or_default() += count;
            }
        }
        let _ = sealed_tx.send(sealed_counts);

        join_pool(loaders).await?;
        // All outcome senders are gone; the coordinator finalizes.
        let (state, summary) = coordinator.await?;

        if let Some(quarantine) = &quarantine {
            quarantine.finalize().await?;
        }
        Ok((state, summary))
    }
}

async fn join_pool(handles: Vec<JoinHandle<()>>) -> Result<(), PipelineError> {
    for handle in handles {
        handle.await?;
    }
    Ok(())
}
