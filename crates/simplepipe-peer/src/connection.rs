use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use simplepipe_transport::{Endpoint, Readiness, Received};
use tracing::{debug, warn};

use crate::error::{PeerError, Result};
use crate::handler::Handler;

/// Identifier of one connection, unique for the lifetime of its server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub(crate) fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Shared handle to one live channel connection.
///
/// Cheap to clone. Handlers receive it by reference and may keep a clone to
/// send from any thread.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

struct ConnectionInner {
    id: ConnectionId,
    /// Taken out exactly once by `release`. I/O works on a clone of the `Arc`,
    /// so cancelling never waits behind a blocked read or write.
    endpoint: Mutex<Option<Arc<Endpoint>>>,
    handler: Arc<dyn Handler>,
    buffer_size: usize,
    reset_requested: AtomicBool,
    errored: AtomicBool,
    open: AtomicBool,
    closed: AtomicBool,
    failure: Mutex<Option<PeerError>>,
}

/// Outcome of one pass through the read loop.
enum ReadStep {
    Idle,
    Message(usize),
}

impl Connection {
    fn new(
        id: ConnectionId,
        endpoint: Endpoint,
        handler: Arc<dyn Handler>,
        buffer_size: usize,
    ) -> Self {
        Self {
            inner: Arc::new(ConnectionInner {
                id,
                endpoint: Mutex::new(Some(Arc::new(endpoint))),
                handler,
                buffer_size,
                reset_requested: AtomicBool::new(false),
                errored: AtomicBool::new(false),
                open: AtomicBool::new(true),
                closed: AtomicBool::new(false),
                failure: Mutex::new(None),
            }),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    /// Largest message this connection sends or receives.
    pub fn buffer_size(&self) -> usize {
        self.inner.buffer_size
    }

    /// Send `message` to the peer as one message, blocking until written.
    ///
    /// Empty and oversized messages are rejected without affecting the
    /// connection. A failed write is terminal: the connection reports it to
    /// `on_error` (unless the peer simply went away) and closes.
    pub fn send(&self, message: &[u8]) -> Result<()> {
        if self.inner.reset_requested.load(Ordering::SeqCst)
            || self.inner.errored.load(Ordering::SeqCst)
        {
            return Err(PeerError::Closed);
        }
        if message.is_empty() {
            return Err(PeerError::EmptyMessage);
        }
        if message.len() > self.inner.buffer_size {
            return Err(PeerError::MessageTooLarge {
                size: message.len(),
                max: self.inner.buffer_size,
            });
        }

        let Some(endpoint) = self.endpoint() else {
            return Err(PeerError::Closed);
        };
        let written = endpoint.send(message);
        drop(endpoint);

        match written {
            Ok(n) if n == message.len() => Ok(()),
            Ok(n) => {
                let err = PeerError::WriteIncomplete {
                    written: n,
                    expected: message.len(),
                };
                self.record_failure(PeerError::WriteIncomplete {
                    written: n,
                    expected: message.len(),
                });
                Err(err)
            }
            Err(_) if self.inner.reset_requested.load(Ordering::SeqCst) => Err(PeerError::Closed),
            Err(err) => {
                self.record_failure(PeerError::from_io(copy_io_error(&err)));
                Err(PeerError::from_io(err))
            }
        }
    }

    /// Request the connection to close. Idempotent and non-blocking.
    ///
    /// Pending reads and writes are cancelled; the read loop then releases
    /// the channel and fires `on_close`.
    pub fn close(&self) {
        if !self.inner.reset_requested.swap(true, Ordering::SeqCst) {
            debug!(connection = %self.inner.id, "close requested");
        }
        self.cancel_io();
    }

    /// Whether the read loop is still running.
    pub fn is_open(&self) -> bool {
        self.inner.open.load(Ordering::SeqCst)
    }

    /// Whether the read loop has exited and the channel has been released.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Whether the connection ended on a terminal failure.
    pub fn has_error(&self) -> bool {
        self.inner.errored.load(Ordering::SeqCst)
    }

    fn endpoint(&self) -> Option<Arc<Endpoint>> {
        self.inner
            .endpoint
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn cancel_io(&self) {
        if let Some(endpoint) = self.endpoint() {
            endpoint.cancel_io();
        }
    }

    /// Mark the connection failed. Only the first failure is kept.
    fn record_failure(&self, err: PeerError) {
        if self.inner.errored.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(connection = %self.inner.id, error = %err, "connection failed");
        *self
            .inner
            .failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(err);
        self.cancel_io();
    }

    fn read_step(&self, buf: &mut [u8], poll_interval: Duration) -> Result<ReadStep> {
        let Some(endpoint) = self.endpoint() else {
            return Err(PeerError::Closed);
        };

        match endpoint.poll_readable(poll_interval).map_err(PeerError::from_io)? {
            Readiness::Idle => Ok(ReadStep::Idle),
            Readiness::Hangup => Err(PeerError::Disconnected),
            Readiness::Readable => match endpoint.recv(buf).map_err(PeerError::from_io)? {
                Received::Message(n) => Ok(ReadStep::Message(n)),
                Received::Truncated { .. } => Err(PeerError::MessageTruncated {
                    capacity: buf.len(),
                }),
                Received::Closed => Err(PeerError::Disconnected),
            },
        }
    }

    /// Run one handler callback. A panic is contained and ends the connection.
    fn notify(&self, event: &'static str, call: impl FnOnce()) {
        if panic::catch_unwind(AssertUnwindSafe(call)).is_err() {
            warn!(connection = %self.inner.id, event, "handler panicked");
            self.record_failure(PeerError::HandlerPanicked { event });
        }
    }

    fn run(&self, poll_interval: Duration) {
        let inner = &self.inner;
        debug!(connection = %inner.id, "connection opened");
        self.notify("open", || inner.handler.on_open(self));

        let mut buf = vec![0u8; inner.buffer_size];
        while !inner.reset_requested.load(Ordering::SeqCst) && !inner.errored.load(Ordering::SeqCst)
        {
            match self.read_step(&mut buf, poll_interval) {
                Ok(ReadStep::Idle) => {}
                Ok(ReadStep::Message(n)) => {
                    self.notify("message", || inner.handler.on_message(self, &buf[..n]))
                }
                Err(_) if inner.reset_requested.load(Ordering::SeqCst) => break,
                Err(err) => self.record_failure(err),
            }
        }

        let failure = inner
            .failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(err) = failure {
            if !err.is_disconnect() {
                self.notify("error", || inner.handler.on_error(self, &err));
            }
        }

        inner.open.store(false, Ordering::SeqCst);
        self.release();
        debug!(connection = %inner.id, "connection closed");
        self.notify("close", || inner.handler.on_close(self));
        inner.closed.store(true, Ordering::SeqCst);
    }

    fn release(&self) {
        let endpoint = self
            .inner
            .endpoint
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(endpoint) = endpoint else {
            return;
        };
        if !self.inner.reset_requested.load(Ordering::SeqCst) {
            if let Err(err) = endpoint.flush() {
                debug!(connection = %self.inner.id, error = %err, "flush before close failed");
            }
        }
        drop(endpoint);
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("open", &self.is_open())
            .field("closed", &self.is_closed())
            .field("errored", &self.has_error())
            .finish()
    }
}

/// Owns one connection's read-loop thread.
///
/// Dropping the worker closes the connection and joins the thread, except
/// when the drop happens on that very thread, in which case it detaches.
pub(crate) struct ConnectionWorker {
    connection: Connection,
    thread: Option<JoinHandle<()>>,
}

impl ConnectionWorker {
    pub(crate) fn spawn(
        id: ConnectionId,
        endpoint: Endpoint,
        handler: Arc<dyn Handler>,
        buffer_size: usize,
        poll_interval: Duration,
    ) -> Result<Self> {
        let connection = Connection::new(id, endpoint, handler, buffer_size);
        let runner = connection.clone();
        let thread = thread::Builder::new()
            .name(format!("simplepipe-conn-{id}"))
            .spawn(move || runner.run(poll_interval))
            .map_err(|source| PeerError::Spawn {
                what: "connection",
                source,
            })?;

        Ok(Self {
            connection,
            thread: Some(thread),
        })
    }

    pub(crate) fn connection(&self) -> &Connection {
        &self.connection
    }
}

impl Drop for ConnectionWorker {
    fn drop(&mut self) {
        self.connection.close();
        let Some(thread) = self.thread.take() else {
            return;
        };
        if thread.thread().id() == thread::current().id() {
            debug!(connection = %self.connection.id(), "worker dropped from its own thread; detaching");
            return;
        }
        let _ = thread.join();
    }
}

fn copy_io_error(err: &io::Error) -> io::Error {
    match err.raw_os_error() {
        Some(code) => io::Error::from_raw_os_error(code),
        None => io::Error::new(err.kind(), err.to_string()),
    }
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use std::path::PathBuf;
    use std::sync::mpsc;
    use std::time::Instant;

    use simplepipe_transport::{connect_once, ChannelListener, ChannelName, ListenerOptions};

    use super::*;
    use crate::handler::HandlerSet;

    fn test_dir(tag: &str) -> PathBuf {
        let dir = PathBuf::from(format!(
            "/tmp/spc-{tag}-{}-{}",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .expect("time should be after epoch")
                .as_nanos()
        ));
        std::fs::create_dir_all(&dir).expect("temp dir should be creatable");
        dir
    }

    /// Returns (listener, server endpoint, client endpoint).
    fn attached_pair(dir: &std::path::Path) -> (ChannelListener, Endpoint, Endpoint) {
        let name = ChannelName::in_dir("pair", dir).expect("name should be valid");
        let mut listener = ChannelListener::new(name.clone(), ListenerOptions::default());
        let pending = listener
            .create_instance()
            .expect("instance should be created");
        let waiter = thread::spawn(move || pending.wait_for_attach());
        let client = connect_once(&name).expect("client should attach");
        let server = waiter
            .join()
            .expect("waiter should finish")
            .expect("attach should succeed");
        (listener, server, client)
    }

    fn spawn_worker(endpoint: Endpoint, handler: HandlerSet, buffer_size: usize) -> ConnectionWorker {
        ConnectionWorker::spawn(
            ConnectionId::new(1),
            endpoint,
            Arc::new(handler),
            buffer_size,
            Duration::from_millis(5),
        )
        .expect("worker should spawn")
    }

    #[test]
    fn rejects_empty_and_oversized_messages() {
        let dir = test_dir("limits");
        let (_listener, server, _client) = attached_pair(&dir);
        let worker = spawn_worker(server, HandlerSet::new(), 8);
        let conn = worker.connection().clone();

        assert!(matches!(conn.send(b""), Err(PeerError::EmptyMessage)));
        assert!(matches!(
            conn.send(&[0u8; 9]),
            Err(PeerError::MessageTooLarge { size: 9, max: 8 })
        ));
        assert!(conn.send(&[0u8; 8]).is_ok(), "limit-sized message should send");
        assert!(!conn.has_error());

        drop(worker);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn messages_reach_handler_in_order() {
        let dir = test_dir("order");
        let (_listener, server, client) = attached_pair(&dir);
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let handler = HandlerSet::new().on_message(move |_, msg| {
            let _ = tx.lock().unwrap().send(msg.to_vec());
        });
        let worker = spawn_worker(server, handler, 64);

        for i in 0..10u8 {
            client.send(&[i; 3]).expect("client send should succeed");
        }
        for i in 0..10u8 {
            let msg = rx
                .recv_timeout(Duration::from_secs(2))
                .expect("message should arrive");
            assert_eq!(msg, vec![i; 3]);
        }

        drop(worker);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn close_is_idempotent_and_fires_on_close_once() {
        let dir = test_dir("close");
        let (_listener, server, _client) = attached_pair(&dir);
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let handler = HandlerSet::new()
            .on_message(|_, _| {})
            .on_close(move |_| {
                let _ = tx.lock().unwrap().send(());
            });
        let worker = spawn_worker(server, handler, 64);
        let conn = worker.connection().clone();

        conn.close();
        conn.close();
        rx.recv_timeout(Duration::from_secs(2))
            .expect("on_close should fire");
        drop(worker);

        assert!(conn.is_closed());
        assert!(!conn.is_open());
        assert!(!conn.has_error());
        assert!(matches!(conn.send(b"late"), Err(PeerError::Closed)));
        assert!(rx.try_recv().is_err(), "on_close should fire exactly once");
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn peer_disconnect_closes_without_error() {
        let dir = test_dir("disc");
        let (_listener, server, client) = attached_pair(&dir);
        let (tx, rx) = mpsc::channel();
        let errors = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let error_count = Arc::clone(&errors);
        let tx = Mutex::new(tx);
        let handler = HandlerSet::new()
            .on_error(move |_, _| {
                error_count.fetch_add(1, Ordering::SeqCst);
            })
            .on_close(move |_| {
                let _ = tx.lock().unwrap().send(());
            });
        let worker = spawn_worker(server, handler, 64);

        drop(client);
        rx.recv_timeout(Duration::from_secs(2))
            .expect("on_close should fire after peer drop");
        assert_eq!(errors.load(Ordering::SeqCst), 0);
        assert!(worker.connection().is_closed() || !worker.connection().is_open());

        drop(worker);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn dropping_worker_inside_handler_does_not_deadlock() {
        let dir = test_dir("selfdrop");
        let (_listener, server, client) = attached_pair(&dir);
        let slot: Arc<Mutex<Option<ConnectionWorker>>> = Arc::new(Mutex::new(None));
        let in_handler = Arc::clone(&slot);
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let handler = HandlerSet::new()
            .on_message(move |_, _| {
                let worker = in_handler.lock().unwrap().take();
                drop(worker);
            })
            .on_close(move |_| {
                let _ = tx.lock().unwrap().send(());
            });
        *slot.lock().unwrap() = Some(spawn_worker(server, handler, 64));

        client.send(b"stop").expect("client send should succeed");
        rx.recv_timeout(Duration::from_secs(2))
            .expect("worker should close after detaching");
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn close_interrupts_a_send_blocked_on_a_silent_peer() {
        let dir = test_dir("stall");
        let (_listener, server, _client) = attached_pair(&dir);
        let worker = spawn_worker(server, HandlerSet::new(), 2048);
        let conn = worker.connection().clone();

        let sender = {
            let conn = conn.clone();
            thread::spawn(move || {
                let chunk = [7u8; 2048];
                loop {
                    if let Err(err) = conn.send(&chunk) {
                        return err;
                    }
                }
            })
        };
        thread::sleep(Duration::from_millis(100));

        let started = Instant::now();
        conn.close();
        assert!(
            started.elapsed() < Duration::from_millis(500),
            "close should not wait for the blocked send"
        );
        let err = sender.join().expect("sender should finish");
        assert!(matches!(err, PeerError::Closed));

        drop(worker);
        assert!(conn.is_closed());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn panicking_handler_still_closes_the_connection() {
        let dir = test_dir("panic");
        let (_listener, server, client) = attached_pair(&dir);
        let (tx, rx) = mpsc::channel();
        let error_tx = Mutex::new(tx.clone());
        let close_tx = Mutex::new(tx);
        let handler = HandlerSet::new()
            .on_message(|_, _| panic!("handler failure"))
            .on_error(move |_, err| {
                let _ = error_tx.lock().unwrap().send(err.to_string());
            })
            .on_close(move |_| {
                let _ = close_tx.lock().unwrap().send("closed".to_string());
            });
        let worker = spawn_worker(server, handler, 64);
        let conn = worker.connection().clone();

        client.send(b"x").expect("client send should succeed");
        let first = rx
            .recv_timeout(Duration::from_secs(2))
            .expect("on_error should fire");
        assert_eq!(first, "message handler panicked");
        let second = rx
            .recv_timeout(Duration::from_secs(2))
            .expect("on_close should fire");
        assert_eq!(second, "closed");

        drop(worker);
        assert!(conn.is_closed());
        assert!(!conn.is_open());
        assert!(conn.has_error());
        assert!(rx.try_recv().is_err(), "on_close should fire exactly once");
        let _ = std::fs::remove_dir_all(&dir);
    }
}
