//! IO worker pool.
//!
//! N workers pull `FileUnit`s and read raw bytes, never parsing.
//! Read failures are retried with jittered backoff up to the configured
//! budget, then counted as failed; a bad file is never fatal to the
//! pool. Workers exit when the enumerator's queue closes, dropping
//! their payload senders and propagating the drain.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use rand::Rng;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use sleet_common::emit;
use sleet_common::metrics::events::{BytesRead, FailureStage, FileReadCompleted};
use sleet_common::queue::{StageReceiver, StageSender};

use crate::config::RetryConfig;
use crate::error::{FileReadSnafu, ReadError};
use crate::pipeline::types::{FileUnit, RawPayload, RunCounters};
use crate::quarantine::FailureTracker;
use snafu::ResultExt;

/// Spawn the IO worker pool.
pub fn spawn_pool(
    workers: usize,
    file_rx: StageReceiver<FileUnit>,
    payload_tx: StageSender<RawPayload>,
    retry: RetryConfig,
    counters: Arc<RunCounters>,
    tracker: Arc<FailureTracker>,
) -> Vec<JoinHandle<()>> {
    (0..workers)
        .map(|worker| {
            let file_rx = file_rx.clone();
            let payload_tx = payload_tx.clone();
            let retry = retry.clone();
            let counters = Arc::clone(&counters);
            let tracker = Arc::clone(&tracker);
            tokio::spawn(async move {
                run_worker(worker, file_rx, payload_tx, retry, counters, tracker).await;
            })
        })
        .collect()
}

async fn run_worker(
    worker: usize,
    file_rx: StageReceiver<FileUnit>,
    payload_tx: StageSender<RawPayload>,
    retry: RetryConfig,
    counters: Arc<RunCounters>,
    tracker: Arc<FailureTracker>,
) {
    while let Some(unit) = file_rx.recv().await {
        let start = Instant::now();
        match read_unit(&unit, &retry).await {
            Ok(payload) => {
                let bytes =
                    payload.body.len() + payload.chunk_bodies.iter().map(Bytes::len).sum::<usize>();
                RunCounters::add(&counters.files_read, unit.physical_files());
                RunCounters::add(&counters.bytes_read, bytes as u64);
                emit!(BytesRead {
                    bytes: bytes as u64,
                    dataset: unit.dataset.to_string(),
                });
                emit!(FileReadCompleted {
                    duration: start.elapsed(),
                    dataset: unit.dataset.to_string(),
                });

                if payload_tx.send(payload).await.is_err() {
                    debug!("[read:{worker}] Downstream closed, stopping");
                    return;
                }
            }
            Err(e) => {
                RunCounters::add(&counters.files_failed, unit.physical_files());
                if tracker
                    .record_failure(
                        &unit.path.display().to_string(),
                        unit.dataset.id(),
                        &e.to_string(),
                        FailureStage::Read,
                    )
                    .await
                    .is_err()
                {
                    return;
                }
            }
        }
    }
    debug!("[read:{worker}] Upstream closed, worker exiting");
}

/// Read a unit's main file and all chunk siblings with bounded retry.
async fn read_unit(unit: &FileUnit, retry: &RetryConfig) -> Result<RawPayload, ReadError> {
    let body = read_with_retry(&unit.path, retry).await?;
    let mut chunk_bodies = Vec::with_capacity(unit.chunk_paths.len());
    for path in &unit.chunk_paths {
        chunk_bodies.push(read_with_retry(path, retry).await?);
    }
    Ok(RawPayload {
        unit: unit.clone(),
        body,
        chunk_bodies,
    })
}

async fn read_with_retry(path: &Path, retry: &RetryConfig) -> Result<Bytes, ReadError> {
    let mut attempt = 1;
    loop {
        match tokio::fs::read(path).await {
            Ok(contents) => return Ok(Bytes::from(contents)),
            Err(source) => {
                if attempt >= retry.read_attempts {
                    return Err(source).context(FileReadSnafu {
                        path: path.display().to_string(),
                    });
                }
                let backoff = backoff_with_jitter(retry.read_backoff(), attempt);
                warn!(
                    path = %path.display(),
                    attempt,
                    backoff_ms = backoff.as_millis() as u64,
                    "Read failed, retrying: {source}"
                );
                tokio::time::sleep(backoff).await;
                attempt += 1;
            }
        }
    }
}

/// Exponential backoff with up to 50% random jitter.
pub(crate) fn backoff_with_jitter(base: Duration, attempt: u32) -> Duration {
    let exp = base.saturating_mul(1 << (attempt - 1).min(16));
    let jitter = rand::thread_rng().gen_range(0.0..=0.5);
    exp.mul_f64(1.0 + jitter)
}
