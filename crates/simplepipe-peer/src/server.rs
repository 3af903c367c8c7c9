use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use bytes::Bytes;
use simplepipe_transport::{connect_once, ChannelListener, ChannelName};
use tracing::{debug, info, warn};

use crate::acceptor::{AcceptState, Acceptor};
use crate::config::ServerConfig;
use crate::connection::{Connection, ConnectionId};
use crate::dispatcher::{spawn_dispatcher, OutboundQueue};
use crate::error::{PeerError, Result};
use crate::handler::Handler;
use crate::registry::Registry;

/// Serves one named channel to any number of clients.
///
/// `start()` spawns the accept loop and the broadcast dispatcher; each
/// attached client gets its own connection thread. `stop()` (also run on
/// drop) unblocks a pending accept by attaching a throwaway client, then
/// joins every thread and releases every connection.
pub struct Server {
    channel: ChannelName,
    config: ServerConfig,
    handler: Arc<dyn Handler>,
    registry: Arc<Registry>,
    queue: Arc<OutboundQueue>,
    accept: Arc<AcceptState>,
    running: Mutex<Option<Running>>,
    is_running: AtomicBool,
}

struct Running {
    acceptor: JoinHandle<()>,
    dispatcher: JoinHandle<()>,
}

impl Server {
    /// Create a stopped server. Fails if the channel name is unusable.
    pub fn new(config: ServerConfig, handler: impl Handler) -> Result<Self> {
        let channel = config.channel_name()?;
        Ok(Self {
            channel,
            config,
            handler: Arc::new(handler),
            registry: Arc::new(Registry::new()),
            queue: Arc::new(OutboundQueue::new()),
            accept: Arc::new(AcceptState::new()),
            running: Mutex::new(None),
            is_running: AtomicBool::new(false),
        })
    }

    /// Start serving.
    ///
    /// The first channel instance is created before this returns, so a name
    /// collision or creation failure is reported here.
    pub fn start(&self) -> Result<()> {
        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        if running.is_some() {
            return Err(PeerError::AlreadyRunning);
        }

        self.accept.reset_requested.store(false, Ordering::SeqCst);
        self.accept.errored.store(false, Ordering::SeqCst);

        let mut listener = ChannelListener::new(self.channel.clone(), self.config.listener_options());
        let first = listener.create_instance()?;

        self.queue.reopen();
        let dispatcher = match spawn_dispatcher(
            Arc::clone(&self.queue),
            Arc::clone(&self.registry),
            self.channel.as_str(),
        ) {
            Ok(handle) => handle,
            Err(err) => {
                self.queue.close();
                return Err(err);
            }
        };

        let acceptor = Acceptor {
            listener,
            first: Some(first),
            state: Arc::clone(&self.accept),
            registry: Arc::clone(&self.registry),
            handler: Arc::clone(&self.handler),
            buffer_size: self.config.buffer_size,
            poll_interval: self.config.poll_interval,
            policy: self.config.creation_failure,
        };
        let acceptor = match acceptor.spawn() {
            Ok(handle) => handle,
            Err(err) => {
                self.queue.close();
                let _ = dispatcher.join();
                return Err(err);
            }
        };

        *running = Some(Running {
            acceptor,
            dispatcher,
        });
        self.is_running.store(true, Ordering::SeqCst);
        info!(channel = %self.channel, address = ?self.channel.address(), "server started");
        Ok(())
    }

    /// Stop serving and close every connection. Idempotent.
    ///
    /// Returns once the accept loop, the dispatcher and every connection
    /// thread (other than the calling one) have exited.
    pub fn stop(&self) {
        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(Running {
            acceptor,
            dispatcher,
        }) = running.take()
        else {
            return;
        };

        self.accept.reset_requested.store(true, Ordering::SeqCst);
        while !acceptor.is_finished() {
            if self.accept.awaiting_attach.load(Ordering::SeqCst) {
                match connect_once(&self.channel) {
                    Ok(throwaway) => {
                        debug!(channel = %self.channel, "attached to unblock pending accept");
                        drop(throwaway);
                    }
                    Err(err) => {
                        warn!(channel = %self.channel, error = %err, "failed to unblock pending accept");
                    }
                }
            }
            thread::sleep(self.config.poll_interval);
        }
        let _ = acceptor.join();

        // A broadcast blocked on a client that is not reading only returns
        // once that connection's I/O is cancelled.
        self.queue.close();
        self.registry.close_all();
        let _ = dispatcher.join();

        self.registry.reset_all();
        self.is_running.store(false, Ordering::SeqCst);
        info!(channel = %self.channel, "server stopped");
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    /// Whether the accept loop last failed to create a channel instance.
    pub fn has_error(&self) -> bool {
        self.accept.errored.load(Ordering::SeqCst)
    }

    /// Number of open connections. Closed connections are pruned first.
    pub fn connection_count(&self) -> usize {
        self.registry.prune();
        self.registry.count_open()
    }

    /// Snapshot of the open connections, in id order.
    pub fn connections(&self) -> Vec<Connection> {
        self.registry.open_connections()
    }

    /// Queue `message` for every open connection.
    ///
    /// Returns false, without queueing, when nothing is connected or the
    /// server is not running.
    pub fn send_all(&self, message: impl Into<Bytes>) -> bool {
        self.broadcaster().send_all(message)
    }

    /// A cloneable handle for broadcasting from handlers and other threads.
    pub fn broadcaster(&self) -> Broadcaster {
        Broadcaster {
            registry: Arc::clone(&self.registry),
            queue: Arc::clone(&self.queue),
        }
    }

    /// Send `message` to one connection.
    pub fn send_to(&self, id: ConnectionId, message: &[u8]) -> Result<()> {
        self.registry
            .get(id)
            .ok_or(PeerError::UnknownConnection(id.get()))?
            .send(message)
    }

    /// Close one connection. Returns false if no such connection exists.
    pub fn close_connection(&self, id: ConnectionId) -> bool {
        match self.registry.get(id) {
            Some(connection) => {
                connection.close();
                true
            }
            None => false,
        }
    }

    /// The published channel name.
    pub fn name(&self) -> &str {
        self.channel.as_str()
    }

    pub fn channel(&self) -> &ChannelName {
        &self.channel
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("channel", &self.channel)
            .field("running", &self.is_running())
            .field("connections", &self.registry.len())
            .finish()
    }
}

/// Broadcast side of a [`Server`], detached from its lifetime.
#[derive(Clone)]
pub struct Broadcaster {
    registry: Arc<Registry>,
    queue: Arc<OutboundQueue>,
}

impl Broadcaster {
    /// Same as [`Server::send_all`].
    pub fn send_all(&self, message: impl Into<Bytes>) -> bool {
        if self.registry.count_open() == 0 {
            return false;
        }
        self.queue.push(message.into())
    }
}

impl std::fmt::Debug for Broadcaster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broadcaster").finish_non_exhaustive()
    }
}
