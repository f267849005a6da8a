//! Run coordinator.
//!
//! The coordinator is the single consumer of load outcomes. It owns the
//! run state machine, reconciles per-dataset batch sequences against
//! outcomes received, keeps the terminal file counters honest, and
//! produces the final `RunSummary` when the outcome channel closes.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use sleet_common::emit;
use sleet_common::metrics::events::{FileProcessed, FileStatus};
use sleet_common::queue::StageReceiver;

use crate::config::DatasetKey;
use crate::pipeline::types::{LoadOutcome, LoadStatus, RunCounters, RunSummary};

/// How often run progress is logged while outcomes are flowing.
const PROGRESS_INTERVAL: Duration = Duration::from_secs(10);

/// Terminal files required before the skip-ratio alarm can fire.
const SKIP_RATIO_MIN_SAMPLE: u64 = 100;

/// Lifecycle of a single ingestion run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// Queues built, workers not yet consuming.
    Starting,
    /// All stages active.
    Running,
    /// Enumeration finished or cancelled; in-flight work completing.
    Draining,
    /// All outcomes accounted for, sink reachable throughout.
    Done,
    /// Sink declared unavailable; the run is incomplete.
    Failed,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Starting => "starting",
            RunState::Running => "running",
            RunState::Draining => "draining",
            RunState::Done => "done",
            RunState::Failed => "failed",
        }
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-dataset reconciliation of sealed sequences against outcomes.
#[derive(Default)]
struct SequenceLedger {
    max_seen: Option<u64>,
    received: u64,
}

impl SequenceLedger {
    fn observe(&mut self, sequence: u64) {
        self.max_seen = Some(self.max_seen.map_or(sequence, |m| m.max(sequence)));
        self.received += 1;
    }

    /// Sequences below the highest observed that never arrived.
    ///
    /// Fallback reconciliation for when the shard tallies are lost;
    /// batches sealed above the highest observed sequence are invisible
    /// to it.
    fn gaps(&self) -> u64 {
        match self.max_seen {
            Some(max) => (max + 1).saturating_sub(self.received),
            None => 0,
        }
    }
}

/// Spawn the coordinator task.
///
/// `start_rx` fires once every worker pool has been spawned and the
/// state machine moves to Running; `drain_rx` fires when enumeration
/// has finished and the drain cascade has begun. `sealed_rx` delivers
/// the aggregator shards' per-dataset sealed-batch tallies so outcomes
/// can be reconciled exactly. The task resolves when every loader has
/// dropped its outcome sender.
pub fn spawn(
    outcome_rx: StageReceiver<LoadOutcome>,
    start_rx: oneshot::Receiver<()>,
    drain_rx: oneshot::Receiver<()>,
    sealed_rx: oneshot::Receiver<HashMap<DatasetKey, u64>>,
    counters: Arc<RunCounters>,
    skip_ratio_warn: f64,
    started_at: Instant,
) -> JoinHandle<(RunState, RunSummary)> {
    tokio::spawn(async move {
        run(
            outcome_rx,
            start_rx,
            drain_rx,
            sealed_rx,
            counters,
            skip_ratio_warn,
            started_at,
        )
        .await
    })
}

async fn run(
    outcome_rx: StageReceiver<LoadOutcome>,
    start_rx: oneshot::Receiver<()>,
    drain_rx: oneshot::Receiver<()>,
    sealed_rx: oneshot::Receiver<HashMap<DatasetKey, u64>>,
    counters: Arc<RunCounters>,
    skip_ratio_warn: f64,
    started_at: Instant,
) -> (RunState, RunSummary) {
    let mut state = RunState::Starting;
    info!(state = %state, "Run state changed");

    let mut ledgers: HashMap<DatasetKey, SequenceLedger> = HashMap::new();
    let mut fatal = false;
    let mut skip_ratio_warned = false;

    let mut progress = tokio::time::interval(PROGRESS_INTERVAL);
    progress.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    progress.tick().await; // First tick fires immediately; discard it.

    let mut start_rx = start_rx;
    let mut drain_rx = drain_rx;
    loop {
        tokio::select! {
            maybe = outcome_rx.recv() => {
                let Some(outcome) = maybe else { break };
                record_outcome(&outcome, &mut ledgers, &counters, &mut fatal);
                check_skip_ratio(&counters, skip_ratio_warn, &mut skip_ratio_warned);
            }
            _ = &mut start_rx, if state == RunState::Starting => {
                state = RunState::Running;
                info!(state = %state, "Run state changed");
            }
            _ = &mut drain_rx, if state == RunState::Running => {
                state = RunState::Draining;
                info!(state = %state, "Run state changed");
            }
            _ = progress.tick() => {
                info!(
                    state = %state,
                    files_enumerated = RunCounters::get(&counters.files_enumerated),
                    files_terminal = counters.files_terminal(),
                    rows_loaded = RunCounters::get(&counters.rows_loaded),
                    batches_loaded = RunCounters::get(&counters.batches_loaded),
                    "Run progress"
                );
            }
        }
    }

    // The shard tallies arrive once all shards have flushed; reconcile
    // them against the outcomes received so trailing batches lost after
    // the highest observed sequence still count.
    let sequence_gaps: u64 = match sealed_rx.await {
        Ok(sealed) => sealed
            .iter()
            .map(|(dataset, count)| {
                let received = ledgers.get(dataset).map_or(0, |ledger| ledger.received);
                count.saturating_sub(received)
            })
            .sum(),
        Err(_) => ledgers.values().map(SequenceLedger::gaps).sum(),
    };
    if sequence_gaps > 0 {
        warn!(sequence_gaps, "Sealed batches never produced an outcome");
    }

    state = if fatal { RunState::Failed } else { RunState::Done };
    let summary = RunSummary::from_counters(&counters, started_at.elapsed(), sequence_gaps);
    info!(
        state = %state,
        files_enumerated = summary.files_enumerated,
        files_loaded = summary.files_loaded,
        files_skipped = summary.files_skipped,
        files_failed = summary.files_failed,
        rows_loaded = summary.rows_loaded,
        rows_quarantined = summary.rows_quarantined,
        load_retries = summary.load_retries,
        elapsed_secs = summary.elapsed.as_secs_f64(),
        "Run finished"
    );
    (state, summary)
}

fn record_outcome(
    outcome: &LoadOutcome,
    ledgers: &mut HashMap<DatasetKey, SequenceLedger>,
    counters: &RunCounters,
    fatal: &mut bool,
) {
    ledgers
        .entry(outcome.dataset.clone())
        .or_default()
        .observe(outcome.sequence);

    match &outcome.status {
        LoadStatus::Loaded => {
            RunCounters::add(&counters.files_loaded, outcome.physical_files);
            emit!(FileProcessed {
                status: FileStatus::Loaded,
                count: outcome.physical_files,
                dataset: outcome.dataset.to_string(),
            });
        }
        LoadStatus::Quarantined { .. } => {
            RunCounters::add(&counters.files_failed, outcome.physical_files);
            emit!(FileProcessed {
                status: FileStatus::Failed,
                count: outcome.physical_files,
                dataset: outcome.dataset.to_string(),
            });
        }
        LoadStatus::SinkUnavailable { reason } => {
            RunCounters::add(&counters.files_failed, outcome.physical_files);
            if !*fatal {
                warn!(dataset = %outcome.dataset, "Run failing: {reason}");
            }
            *fatal = true;
        }
    }
}

/// Warn once when the skip ratio crosses the configured threshold,
/// suggesting a systematic input problem rather than scattered bad
/// files. Requires a minimum sample so tiny runs don't alarm.
fn check_skip_ratio(counters: &RunCounters, threshold: f64, warned: &mut bool) {
    if *warned || threshold <= 0.0 {
        return;
    }
    let terminal = counters.files_terminal();
    if terminal < SKIP_RATIO_MIN_SAMPLE {
        return;
    }
    let skipped = RunCounters::get(&counters.files_skipped);
    let ratio = skipped as f64 / terminal as f64;
    if ratio > threshold {
        warn!(
            skipped,
            terminal,
            ratio = format!("{ratio:.3}"),
            "High skip ratio; inputs may be systematically malformed"
        );
        *warned = true;
    }
}
