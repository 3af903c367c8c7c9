use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use simplepipe_transport::{ChannelListener, ChannelName, PendingInstance, TransportError};
use tracing::{debug, info, warn};

use crate::config::CreationFailurePolicy;
use crate::connection::{ConnectionId, ConnectionWorker};
use crate::error::{PeerError, Result};
use crate::handler::Handler;
use crate::registry::Registry;

/// Flags shared between the accept loop and the server that drives it.
#[derive(Debug)]
pub(crate) struct AcceptState {
    pub(crate) reset_requested: AtomicBool,
    /// True only while the accept loop is inside (or about to enter) the OS
    /// attach wait.
    pub(crate) awaiting_attach: AtomicBool,
    pub(crate) errored: AtomicBool,
    next_id: AtomicU64,
}

impl AcceptState {
    pub(crate) fn new() -> Self {
        Self {
            reset_requested: AtomicBool::new(false),
            awaiting_attach: AtomicBool::new(false),
            errored: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
        }
    }

    fn next_id(&self) -> ConnectionId {
        ConnectionId::new(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    fn reset_requested(&self) -> bool {
        self.reset_requested.load(Ordering::SeqCst)
    }
}

/// The accept loop: create an instance, wait for a client, hand the attached
/// endpoint to a new connection worker, repeat.
pub(crate) struct Acceptor {
    pub(crate) listener: ChannelListener,
    /// Instance created by `Server::start`, used for the first wait.
    pub(crate) first: Option<PendingInstance>,
    pub(crate) state: Arc<AcceptState>,
    pub(crate) registry: Arc<Registry>,
    pub(crate) handler: Arc<dyn Handler>,
    pub(crate) buffer_size: usize,
    pub(crate) poll_interval: Duration,
    pub(crate) policy: CreationFailurePolicy,
}

impl Acceptor {
    pub(crate) fn spawn(self) -> Result<JoinHandle<()>> {
        thread::Builder::new()
            .name(format!("simplepipe-accept-{}", self.listener.name()))
            .spawn(move || self.run())
            .map_err(|source| PeerError::Spawn {
                what: "acceptor",
                source,
            })
    }

    fn run(mut self) {
        let channel = self.listener.name().clone();
        debug!(%channel, "accept loop started");
        let mut next = self.first.take();

        while !self.state.reset_requested() {
            let instance = match next.take() {
                Some(instance) => instance,
                None => match self.listener.create_instance() {
                    Ok(instance) => instance,
                    Err(err) => {
                        if self.creation_failed(&channel, &err) {
                            continue;
                        }
                        break;
                    }
                },
            };

            // Publish the flag before re-checking reset; `Server::stop` does
            // the mirror image, so one side always sees the other.
            self.state.awaiting_attach.store(true, Ordering::SeqCst);
            if self.state.reset_requested() {
                self.state.awaiting_attach.store(false, Ordering::SeqCst);
                break;
            }
            let attached = instance.wait_for_attach();
            self.state.awaiting_attach.store(false, Ordering::SeqCst);

            if self.state.reset_requested() {
                drop(attached);
                break;
            }

            match attached {
                Ok(endpoint) => {
                    if self.state.errored.swap(false, Ordering::SeqCst) {
                        info!(%channel, "channel instance creation recovered");
                    }
                    let id = self.state.next_id();
                    match ConnectionWorker::spawn(
                        id,
                        endpoint,
                        Arc::clone(&self.handler),
                        self.buffer_size,
                        self.poll_interval,
                    ) {
                        Ok(worker) => self.registry.register(worker),
                        Err(err) => {
                            warn!(%channel, connection = %id, error = %err, "failed to start connection")
                        }
                    }
                }
                Err(err @ TransportError::Create { .. }) => {
                    if !self.creation_failed(&channel, &err) {
                        break;
                    }
                }
                Err(err) => {
                    debug!(%channel, error = %err, "client attach failed");
                    thread::sleep(self.poll_interval);
                }
            }

            self.registry.prune();
        }

        debug!(%channel, "accept loop stopped");
    }

    /// Flag a failed instance creation and apply the policy. Returns whether
    /// the loop should keep going.
    fn creation_failed(&self, channel: &ChannelName, err: &TransportError) -> bool {
        warn!(%channel, error = %err, "failed to create channel instance");
        self.state.errored.store(true, Ordering::SeqCst);
        self.registry.prune();
        match self.policy {
            CreationFailurePolicy::Terminate => {
                warn!(%channel, "accept loop terminated after creation failure");
                false
            }
            CreationFailurePolicy::Retry { backoff } => {
                self.pause(backoff);
                true
            }
        }
    }

    /// Sleep for `duration`, waking early if a reset is requested.
    fn pause(&self, duration: Duration) {
        let deadline = Instant::now() + duration;
        let slice = self.poll_interval.max(Duration::from_millis(1));
        while !self.state.reset_requested() {
            let now = Instant::now();
            if now >= deadline {
                return;
            }
            thread::sleep(slice.min(deadline - now));
        }
    }
}
