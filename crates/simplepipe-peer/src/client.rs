use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use simplepipe_transport::{connect, ChannelName};
use tracing::info;

use crate::config::ClientConfig;
use crate::connection::{Connection, ConnectionId, ConnectionWorker};
use crate::error::{PeerError, Result};
use crate::handler::Handler;

/// Single-connection client of a named channel.
///
/// Runs the same connection worker as a server-side connection, so the
/// handler sees the same open/message/error/close sequence.
pub struct Client {
    channel: ChannelName,
    config: ClientConfig,
    handler: Arc<dyn Handler>,
    worker: Mutex<Option<ConnectionWorker>>,
    next_id: AtomicU64,
}

impl Client {
    pub fn new(config: ClientConfig, handler: impl Handler) -> Result<Self> {
        let channel = config.channel_name()?;
        Ok(Self {
            channel,
            config,
            handler: Arc::new(handler),
            worker: Mutex::new(None),
            next_id: AtomicU64::new(1),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Option<ConnectionWorker>> {
        self.worker.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Attach to the server, waiting up to `connect_timeout` for it to
    /// appear or free up an instance.
    pub fn start(&self) -> Result<()> {
        let stale = {
            let mut worker = self.lock();
            if worker
                .as_ref()
                .is_some_and(|worker| !worker.connection().is_closed())
            {
                return Err(PeerError::AlreadyRunning);
            }
            worker.take()
        };
        drop(stale);

        let endpoint = connect(&self.channel, self.config.connect_timeout)?;
        let id = ConnectionId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        let worker = ConnectionWorker::spawn(
            id,
            endpoint,
            Arc::clone(&self.handler),
            self.config.buffer_size,
            self.config.poll_interval,
        )?;

        let mut slot = self.lock();
        if slot.is_some() {
            drop(slot);
            drop(worker);
            return Err(PeerError::AlreadyRunning);
        }
        *slot = Some(worker);
        info!(channel = %self.channel, "client connected");
        Ok(())
    }

    /// Close the connection and wait for its thread to exit. Idempotent.
    pub fn stop(&self) {
        let worker = self.lock().take();
        drop(worker);
    }

    /// Send one message to the server.
    pub fn send(&self, message: &[u8]) -> Result<()> {
        self.connection().ok_or(PeerError::Closed)?.send(message)
    }

    /// Request the connection to close without waiting.
    pub fn close(&self) {
        if let Some(connection) = self.connection() {
            connection.close();
        }
    }

    pub fn is_open(&self) -> bool {
        self.connection()
            .is_some_and(|connection| connection.is_open())
    }

    pub fn connection(&self) -> Option<Connection> {
        self.lock()
            .as_ref()
            .map(|worker| worker.connection().clone())
    }

    pub fn name(&self) -> &str {
        self.channel.as_str()
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("channel", &self.channel)
            .field("open", &self.is_open())
            .finish()
    }
}
