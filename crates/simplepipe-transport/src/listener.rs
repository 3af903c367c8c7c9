use std::io;
use std::path::PathBuf;
#[cfg(unix)]
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::endpoint::{is_resource_exhaustion, Endpoint};
use crate::error::{Result, TransportError};
use crate::name::ChannelName;

/// Delay between attempts while [`connect`] waits for an instance.
const CONNECT_RETRY_INTERVAL: Duration = Duration::from_millis(10);

/// Windows `ERROR_PIPE_BUSY`: every instance is attached to another client.
#[cfg(windows)]
const ERROR_PIPE_BUSY: i32 = 231;

/// Options applied to every instance a [`ChannelListener`] creates.
#[derive(Debug, Clone)]
pub struct ListenerOptions {
    /// Size of the per-instance inbound and outbound buffers, in bytes.
    pub buffer_size: usize,
    /// How long a client waits for an instance to become available.
    pub connect_timeout: Duration,
    /// Permission mode of the socket file. Ignored on Windows.
    pub socket_mode: u32,
}

impl Default for ListenerOptions {
    fn default() -> Self {
        Self {
            buffer_size: 2048,
            connect_timeout: Duration::from_millis(50),
            socket_mode: 0o600,
        }
    }
}

/// Server side of a named channel: creates instances for clients to attach to.
///
/// On Unix, the first instance binds the listening socket; later instances
/// share it. On Windows, every instance is a fresh pipe instance of the same
/// name.
pub struct ChannelListener {
    name: ChannelName,
    options: ListenerOptions,
    #[cfg(unix)]
    socket: Option<Arc<crate::uds::ListenSocket>>,
}

impl ChannelListener {
    pub fn new(name: ChannelName, options: ListenerOptions) -> Self {
        Self {
            name,
            options,
            #[cfg(unix)]
            socket: None,
        }
    }

    /// Create one instance of the channel that a single client can attach to.
    pub fn create_instance(&mut self) -> Result<PendingInstance> {
        #[cfg(unix)]
        {
            let socket = match self.socket.clone() {
                Some(socket) => socket,
                None => {
                    let socket = crate::uds::ListenSocket::bind(
                        self.name.address(),
                        self.options.socket_mode,
                    )
                    .map_err(|source| self.create_error(source))?;
                    let socket = Arc::new(socket);
                    self.socket = Some(Arc::clone(&socket));
                    socket
                }
            };
            Ok(PendingInstance {
                address: self.name.address().to_path_buf(),
                inner: PendingInner::Unix(socket),
            })
        }

        #[cfg(windows)]
        {
            let instance = crate::pipe::PipeInstance::create(
                self.name.address(),
                self.options.buffer_size,
                self.options.connect_timeout,
            )
            .map_err(|source| self.create_error(source))?;
            debug!(channel = %self.name, "created pipe instance");
            Ok(PendingInstance {
                address: self.name.address().to_path_buf(),
                inner: PendingInner::Windows(instance),
            })
        }
    }

    pub fn name(&self) -> &ChannelName {
        &self.name
    }

    pub fn options(&self) -> &ListenerOptions {
        &self.options
    }

    fn create_error(&self, source: io::Error) -> TransportError {
        TransportError::Create {
            path: self.name.address().to_path_buf(),
            source,
        }
    }
}

impl std::fmt::Debug for ChannelListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelListener")
            .field("name", &self.name)
            .field("options", &self.options)
            .finish()
    }
}

/// A created instance waiting for a client.
pub struct PendingInstance {
    address: PathBuf,
    inner: PendingInner,
}

enum PendingInner {
    #[cfg(unix)]
    Unix(Arc<crate::uds::ListenSocket>),
    #[cfg(windows)]
    Windows(crate::pipe::PipeInstance),
}

impl PendingInstance {
    /// Block until a client attaches, then return the server-side endpoint.
    ///
    /// The only way to interrupt the wait is to attach to the instance, for
    /// example with [`connect_once`].
    ///
    /// Running out of descriptors or memory while attaching is reported as
    /// [`TransportError::Create`]; any other failure is
    /// [`TransportError::Accept`].
    pub fn wait_for_attach(self) -> Result<Endpoint> {
        let address = self.address;
        let attached = match self.inner {
            #[cfg(unix)]
            PendingInner::Unix(socket) => socket.accept().map(Endpoint::from_unix),
            #[cfg(windows)]
            PendingInner::Windows(instance) => {
                instance.wait_for_attach().map(Endpoint::from_pipe)
            }
        };
        attached.map_err(|source| {
            if is_resource_exhaustion(&source) {
                TransportError::Create {
                    path: address,
                    source,
                }
            } else {
                TransportError::Accept(source)
            }
        })
    }
}

/// Make a single attempt to attach to the channel `name`.
pub fn connect_once(name: &ChannelName) -> Result<Endpoint> {
    let address = name.address();
    #[cfg(unix)]
    let attached = crate::uds::SeqPacket::connect(address).map(Endpoint::from_unix);
    #[cfg(windows)]
    let attached = crate::pipe::PipeHandle::connect(address).map(Endpoint::from_pipe);

    attached.map_err(|source| TransportError::Connect {
        path: address.to_path_buf(),
        source,
    })
}

/// Attach to the channel `name`, waiting up to `timeout` for a server
/// instance to become available.
pub fn connect(name: &ChannelName, timeout: Duration) -> Result<Endpoint> {
    let deadline = Instant::now() + timeout;
    loop {
        match connect_once(name) {
            Ok(endpoint) => {
                debug!(channel = %name, "attached to channel");
                return Ok(endpoint);
            }
            Err(err) if is_retryable(&err) && Instant::now() < deadline => {
                std::thread::sleep(CONNECT_RETRY_INTERVAL);
            }
            Err(err) => return Err(err),
        }
    }
}

fn is_retryable(err: &TransportError) -> bool {
    let Some(io) = err.io_error() else {
        return false;
    };
    if matches!(
        io.kind(),
        io::ErrorKind::NotFound | io::ErrorKind::ConnectionRefused
    ) {
        return true;
    }
    #[cfg(windows)]
    if io.raw_os_error() == Some(ERROR_PIPE_BUSY) {
        return true;
    }
    false
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use std::path::PathBuf;
    use std::thread;

    use super::*;
    use crate::endpoint::Received;

    fn test_dir(tag: &str) -> PathBuf {
        let dir = PathBuf::from(format!(
            "/tmp/spl-{tag}-{}-{}",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .expect("time should be after epoch")
                .as_nanos()
        ));
        std::fs::create_dir_all(&dir).expect("temp dir should be creatable");
        dir
    }

    #[test]
    fn client_attaches_to_pending_instance() {
        let dir = test_dir("attach");
        let name = ChannelName::in_dir("attach", &dir).expect("name should be valid");
        let mut listener = ChannelListener::new(name.clone(), ListenerOptions::default());
        let pending = listener
            .create_instance()
            .expect("instance should be created");

        let server = thread::spawn(move || {
            let endpoint = pending.wait_for_attach().expect("client should attach");
            let mut buf = [0u8; 64];
            let received = endpoint.recv(&mut buf).expect("recv should succeed");
            assert_eq!(received, Received::Message(5));
            assert_eq!(&buf[..5], b"hello");
        });

        let client =
            connect(&name, Duration::from_secs(1)).expect("client should connect");
        client.send(b"hello").expect("send should succeed");
        server.join().expect("server thread should finish");

        drop(listener);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn connect_once_unblocks_waiting_instance() {
        let dir = test_dir("unblock");
        let name = ChannelName::in_dir("unblock", &dir).expect("name should be valid");
        let mut listener = ChannelListener::new(name.clone(), ListenerOptions::default());
        let pending = listener
            .create_instance()
            .expect("instance should be created");

        let waiter = thread::spawn(move || pending.wait_for_attach().is_ok());
        let throwaway = connect_once(&name).expect("throwaway attach should succeed");
        assert!(waiter.join().expect("waiter should finish"));
        drop(throwaway);

        drop(listener);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn connect_without_server_times_out() {
        let dir = test_dir("absent");
        let name = ChannelName::in_dir("absent", &dir).expect("name should be valid");

        let start = Instant::now();
        let err = connect(&name, Duration::from_millis(50))
            .err()
            .expect("connect should fail without a server");
        assert!(matches!(err, TransportError::Connect { .. }));
        assert!(start.elapsed() >= Duration::from_millis(50));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn second_listener_on_same_name_fails() {
        let dir = test_dir("collide");
        let name = ChannelName::in_dir("collide", &dir).expect("name should be valid");
        let mut first = ChannelListener::new(name.clone(), ListenerOptions::default());
        let _pending = first.create_instance().expect("first bind should succeed");

        let mut second = ChannelListener::new(name, ListenerOptions::default());
        let err = second
            .create_instance()
            .err()
            .expect("second listener should not bind");
        assert!(matches!(err, TransportError::Create { .. }));

        drop(first);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn instances_share_one_socket() {
        let dir = test_dir("shared");
        let name = ChannelName::in_dir("shared", &dir).expect("name should be valid");
        let mut listener = ChannelListener::new(name, ListenerOptions::default());
        let first = listener.create_instance();
        let second = listener.create_instance();
        assert!(first.is_ok());
        assert!(second.is_ok());

        drop(first);
        drop(second);
        drop(listener);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
