//! Bounded handoff between connection threads and the dispatcher thread.
//!
//! Enqueue is non-blocking by design: the daemon must never push backpressure
//! onto a worker process, so a full queue simply drops the message and bumps
//! a counter. Dequeue blocks, since the dispatcher has nothing else to do.

use crate::frame::Message;
use crossbeam::channel::{self, Receiver, RecvError, Sender, TrySendError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Queue capacities below this are raised to [`DEFAULT_CAPACITY`]; a daemon
/// with a near-empty queue would drop messages constantly under any real load.
const MIN_CAPACITY: usize = 100;
const DEFAULT_CAPACITY: usize = 1000;

/// Counters shared between every producer (connection thread) and the queue
/// itself, read by the internal-metrics module.
#[derive(Debug)]
pub struct QueueMetrics {
    pub dropped: AtomicU64,
}

impl QueueMetrics {
    fn new() -> Self {
        Self {
            dropped: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// The producer side, cloned once per accepted connection.
#[derive(Clone)]
pub struct QueueHandle {
    tx: Sender<Message>,
    metrics: Arc<QueueMetrics>,
}

impl QueueHandle {
    /// Attempt to enqueue a message. Never blocks: on a full queue the
    /// message is dropped and the drop counter is incremented exactly once.
    pub fn try_enqueue(&self, message: Message) -> bool {
        match self.tx.try_send(message) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.metrics.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
            Err(TrySendError::Disconnected(_)) => {
                self.metrics.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    pub fn metrics(&self) -> &QueueMetrics {
        &self.metrics
    }
}

/// The single-consumer side, owned by the dispatcher thread.
pub struct QueueConsumer {
    rx: Receiver<Message>,
    metrics: Arc<QueueMetrics>,
}

impl QueueConsumer {
    /// Block until a message is available or the queue is closed (all
    /// `QueueHandle`s dropped), in which case `Err(RecvError)` is returned.
    pub fn dequeue(&self) -> Result<Message, RecvError> {
        self.rx.recv()
    }

    pub fn metrics(&self) -> &QueueMetrics {
        &self.metrics
    }
}

/// Build a bounded queue, clamping `capacity` to a sane floor.
pub fn bounded(capacity: usize) -> (QueueHandle, QueueConsumer) {
    let capacity = if capacity < MIN_CAPACITY {
        DEFAULT_CAPACITY
    } else {
        capacity
    };
    let (tx, rx) = channel::bounded(capacity);
    let metrics = Arc::new(QueueMetrics::new());
    (
        QueueHandle {
            tx,
            metrics: metrics.clone(),
        },
        QueueConsumer { rx, metrics },
    )
}
