//! Bounded stage queues.
//!
//! Every hand-off between pipeline stages goes through a `StageQueue`:
//! a named, bounded, multi-producer multi-consumer channel. A full queue
//! blocks the producer, which is the only backpressure mechanism in the
//! pipeline. Closing happens by dropping senders; receivers then drain
//! whatever is buffered and observe the close.

use std::time::Duration;

use tracing::warn;

use crate::emit;
use crate::metrics::events::{QueueDepth, QueueStalled};

/// Default time a producer may block on a full queue before a stall
/// warning is emitted.
pub const DEFAULT_STALL_WARN: Duration = Duration::from_secs(30);

/// Descriptor for a bounded stage queue.
#[derive(Debug, Clone)]
pub struct StageQueue {
    name: &'static str,
    capacity: usize,
    stall_warn: Duration,
}

impl StageQueue {
    pub fn new(name: &'static str, capacity: usize) -> Self {
        Self {
            name,
            capacity,
            stall_warn: DEFAULT_STALL_WARN,
        }
    }

    pub fn with_stall_warn(mut self, stall_warn: Duration) -> Self {
        self.stall_warn = stall_warn;
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Create the channel for this queue.
    pub fn channel<T>(&self) -> (StageSender<T>, StageReceiver<T>) {
        let (tx, rx) = async_channel::bounded(self.capacity);
        (
            StageSender {
                inner: tx,
                name: self.name,
                stall_warn: self.stall_warn,
            },
            StageReceiver {
                inner: rx,
                name: self.name,
            },
        )
    }
}

/// Error returned when the receiving side of a stage queue is gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueClosed;

impl std::fmt::Display for QueueClosed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "stage queue closed")
    }
}

impl std::error::Error for QueueClosed {}

/// Sending half of a stage queue. Cloneable for multi-producer stages.
#[derive(Debug)]
pub struct StageSender<T> {
    inner: async_channel::Sender<T>,
    name: &'static str,
    stall_warn: Duration,
}

// Manual Clone: derive would require T: Clone.
impl<T> Clone for StageSender<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            name: self.name,
            stall_warn: self.stall_warn,
        }
    }
}

impl<T> StageSender<T> {
    /// Send an item, waiting for capacity if the queue is full.
    ///
    /// If the wait exceeds the stall threshold, a warning and a stall
    /// counter are emitted once and the send keeps waiting. A stall is
    /// an operator signal, never an abort.
    ///
    /// Returns `Err(QueueClosed)` when every receiver has been dropped,
    /// which consumers treat as the shutdown cascade reaching them.
    pub async fn send(&self, item: T) -> Result<(), QueueClosed> {
        let start = tokio::time::Instant::now();
        let send = self.inner.send(item);
        tokio::pin!(send);

        let mut warned = false;
        loop {
            tokio::select! {
                result = &mut send => {
                    return match result {
                        Ok(()) => {
                            emit!(QueueDepth { depth: self.inner.len(), queue: self.name });
                            Ok(())
                        }
                        Err(_) => Err(QueueClosed),
                    };
                }
                _ = tokio::time::sleep(self.stall_warn), if !warned => {
                    warned = true;
                    let waited = start.elapsed();
                    warn!(
                        queue = self.name,
                        waited_secs = waited.as_secs(),
                        "Producer stalled on full queue; downstream is not keeping up"
                    );
                    emit!(QueueStalled { queue: self.name, waited });
                }
            }
        }
    }

    /// Current number of buffered items.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

/// Receiving half of a stage queue. Cloneable for multi-consumer stages.
#[derive(Debug)]
pub struct StageReceiver<T> {
    inner: async_channel::Receiver<T>,
    name: &'static str,
}

impl<T> Clone for StageReceiver<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            name: self.name,
        }
    }
}

impl<T> StageReceiver<T> {
    /// Receive the next item.
    ///
    /// Returns `None` once every sender has been dropped and the buffer
    /// is drained. Workers exit their loop on `None`, which drops their
    /// own downstream senders and propagates the close.
    pub async fn recv(&self) -> Option<T> {
        match self.inner.recv().await {
            Ok(item) => {
                emit!(QueueDepth { depth: self.inner.len(), queue: self.name });
                Some(item)
            }
            Err(async_channel::RecvError) => None,
        }
    }

    /// Current number of buffered items.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}
