use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use bytes::Bytes;
use tracing::debug;

use crate::error::{PeerError, Result};
use crate::registry::Registry;

/// FIFO of pending broadcasts, fed by any thread and drained by one dispatcher.
pub(crate) struct OutboundQueue {
    state: Mutex<QueueState>,
    not_empty: Condvar,
}

struct QueueState {
    pending: VecDeque<Bytes>,
    shutdown: bool,
}

impl OutboundQueue {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                pending: VecDeque::new(),
                shutdown: true,
            }),
            not_empty: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Accept messages again after a previous `close`.
    pub(crate) fn reopen(&self) {
        let mut state = self.lock();
        state.pending.clear();
        state.shutdown = false;
    }

    /// Stop accepting messages and wake the dispatcher.
    pub(crate) fn close(&self) {
        self.lock().shutdown = true;
        self.not_empty.notify_all();
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.lock().shutdown
    }

    /// Enqueue `message`. Returns false once the queue is closed.
    pub(crate) fn push(&self, message: Bytes) -> bool {
        let mut state = self.lock();
        if state.shutdown {
            return false;
        }
        state.pending.push_back(message);
        drop(state);
        self.not_empty.notify_one();
        true
    }

    /// Block until messages are pending, then take all of them.
    ///
    /// Returns `None` once the queue is closed; anything still pending is
    /// discarded.
    pub(crate) fn wait_batch(&self) -> Option<VecDeque<Bytes>> {
        let mut state = self.lock();
        loop {
            if state.shutdown {
                let discarded = std::mem::take(&mut state.pending);
                if !discarded.is_empty() {
                    debug!(count = discarded.len(), "discarding pending broadcasts");
                }
                return None;
            }
            if !state.pending.is_empty() {
                return Some(std::mem::take(&mut state.pending));
            }
            state = self
                .not_empty
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}

/// Start the broadcast dispatcher thread.
///
/// Each message is sent, in submission order, to every connection open at the
/// moment it is taken off the queue. Failed sends are logged and skipped.
/// Closing the queue abandons the rest of the current batch.
pub(crate) fn spawn_dispatcher(
    queue: Arc<OutboundQueue>,
    registry: Arc<Registry>,
    channel: &str,
) -> Result<JoinHandle<()>> {
    thread::Builder::new()
        .name(format!("simplepipe-dispatch-{channel}"))
        .spawn(move || {
            'batches: while let Some(batch) = queue.wait_batch() {
                for message in batch {
                    for connection in registry.open_connections() {
                        if queue.is_closed() {
                            break 'batches;
                        }
                        if let Err(err) = connection.send(&message) {
                            debug!(
                                connection = %connection.id(),
                                error = %err,
                                "broadcast to connection failed"
                            );
                        }
                    }
                }
            }
            debug!("dispatcher stopped");
        })
        .map_err(|source| PeerError::Spawn {
            what: "dispatcher",
            source,
        })
}
