use std::path::PathBuf;

/// Errors that can occur in channel transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The channel name is not usable (empty, path separator, NUL byte).
    #[error("invalid channel name {name:?}: {reason}")]
    InvalidName { name: String, reason: &'static str },

    /// The platform-internal channel address is too long.
    #[error("channel address too long ({len} bytes, max {max}): {path}")]
    NameTooLong {
        path: PathBuf,
        len: usize,
        max: usize,
    },

    /// Failed to create a channel instance (resource exhaustion, name collision).
    #[error("failed to create channel instance {path}: {source}")]
    Create {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Failed to connect to the specified channel.
    #[error("failed to connect to {path}: {source}")]
    Connect {
        path: PathBuf,
        source: std::io::Error,
    },

    /// A client failed to complete attachment to a waiting instance.
    #[error("failed to attach client: {0}")]
    Accept(std::io::Error),

    /// An I/O error occurred on an endpoint.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// The underlying I/O error, when there is one.
    pub fn io_error(&self) -> Option<&std::io::Error> {
        match self {
            TransportError::Create { source, .. } | TransportError::Connect { source, .. } => {
                Some(source)
            }
            TransportError::Accept(source) | TransportError::Io(source) => Some(source),
            TransportError::InvalidName { .. } | TransportError::NameTooLong { .. } => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, TransportError>;
