/// Errors that can occur in server, client and connection operations.
#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    /// Transport-level error (bad name, instance creation, connect, attach).
    #[error("transport error: {0}")]
    Transport(#[from] simplepipe_transport::TransportError),

    /// `start()` was called on a server or client that is already running.
    #[error("already running")]
    AlreadyRunning,

    /// A worker thread could not be spawned.
    #[error("failed to spawn {what} thread: {source}")]
    Spawn {
        what: &'static str,
        source: std::io::Error,
    },

    /// The peer closed its end or the channel broke.
    #[error("peer disconnected")]
    Disconnected,

    /// The OS accepted only part of an outbound message.
    #[error("incomplete write: {written} of {expected} bytes")]
    WriteIncomplete { written: usize, expected: usize },

    /// An outbound message exceeds the connection's buffer size.
    #[error("message of {size} bytes exceeds buffer size {max}")]
    MessageTooLarge { size: usize, max: usize },

    /// An inbound message did not fit the receive buffer and was cut short.
    #[error("inbound message truncated to buffer size {capacity}")]
    MessageTruncated { capacity: usize },

    /// Zero-length messages cannot be framed.
    #[error("empty message")]
    EmptyMessage,

    /// The connection was closed, failed, or released.
    #[error("connection closed")]
    Closed,

    /// A handler callback panicked; the connection was closed.
    #[error("{event} handler panicked")]
    HandlerPanicked { event: &'static str },

    /// No live connection has this id.
    #[error("unknown connection {0}")]
    UnknownConnection(u64),

    /// Any other OS failure on the connection.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl PeerError {
    /// Whether this error means the peer went away.
    pub fn is_disconnect(&self) -> bool {
        match self {
            PeerError::Disconnected => true,
            PeerError::Io(err) => simplepipe_transport::endpoint::is_disconnect(err),
            _ => false,
        }
    }

    /// The underlying OS error code, when there is one.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            PeerError::Io(err) => err.raw_os_error(),
            PeerError::Spawn { source, .. } => source.raw_os_error(),
            PeerError::Transport(err) => err.io_error().and_then(std::io::Error::raw_os_error),
            _ => None,
        }
    }

    /// Classify an endpoint I/O failure.
    pub(crate) fn from_io(err: std::io::Error) -> Self {
        if simplepipe_transport::endpoint::is_disconnect(&err) {
            PeerError::Disconnected
        } else {
            PeerError::Io(err)
        }
    }
}

pub type Result<T> = std::result::Result<T, PeerError>;
