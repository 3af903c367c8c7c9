use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::debug;

use crate::connection::{Connection, ConnectionId, ConnectionWorker};

/// Thread-safe pool of live connection workers, ordered by id.
///
/// Workers removed from the pool are dropped (and joined) only after the lock
/// is released, so a handler that calls back into the registry cannot
/// deadlock against a teardown.
#[derive(Default)]
pub(crate) struct Registry {
    workers: Mutex<BTreeMap<ConnectionId, ConnectionWorker>>,
}

impl Registry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<ConnectionId, ConnectionWorker>> {
        self.workers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn register(&self, worker: ConnectionWorker) {
        let id = worker.connection().id();
        let replaced = self.lock().insert(id, worker);
        debug!(connection = %id, "connection registered");
        drop(replaced);
    }

    /// Remove every connection whose read loop has fully exited.
    pub(crate) fn prune(&self) -> usize {
        let removed: Vec<ConnectionWorker> = {
            let mut workers = self.lock();
            let closed: Vec<ConnectionId> = workers
                .iter()
                .filter(|(_, worker)| worker.connection().is_closed())
                .map(|(id, _)| *id)
                .collect();
            closed
                .into_iter()
                .filter_map(|id| workers.remove(&id))
                .collect()
        };
        let count = removed.len();
        if count > 0 {
            debug!(count, "pruned closed connections");
        }
        count
    }

    /// Request every connection to close, keeping them registered.
    pub(crate) fn close_all(&self) {
        for worker in self.lock().values() {
            worker.connection().close();
        }
    }

    /// Close and drop every connection.
    pub(crate) fn reset_all(&self) {
        let workers = {
            let mut workers = self.lock();
            for worker in workers.values() {
                worker.connection().close();
            }
            std::mem::take(&mut *workers)
        };
        if !workers.is_empty() {
            debug!(count = workers.len(), "closing all connections");
        }
        drop(workers);
    }

    pub(crate) fn count_open(&self) -> usize {
        self.lock()
            .values()
            .filter(|worker| worker.connection().is_open())
            .count()
    }

    pub(crate) fn open_connections(&self) -> Vec<Connection> {
        self.lock()
            .values()
            .map(ConnectionWorker::connection)
            .filter(|connection| connection.is_open())
            .cloned()
            .collect()
    }

    pub(crate) fn get(&self, id: ConnectionId) -> Option<Connection> {
        self.lock()
            .get(&id)
            .map(|worker| worker.connection().clone())
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().len()
    }
}
