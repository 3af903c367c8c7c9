use std::fmt;
use std::io;

use simplepipe_peer::PeerError;
use simplepipe_transport::TransportError;

pub const SUCCESS: i32 = 0;
pub const FAILURE: i32 = 1;
pub const TRANSPORT_ERROR: i32 = 3;
pub const PERMISSION_DENIED: i32 = 50;
pub const DATA_INVALID: i32 = 60;
pub const USAGE: i32 = 64;
pub const TIMEOUT: i32 = 124;
pub const INTERNAL: i32 = 125;

pub type CliResult<T> = Result<T, CliError>;

#[derive(Debug)]
pub struct CliError {
    pub code: i32,
    pub message: String,
}

impl CliError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for CliError {}

pub fn io_error(context: &str, err: io::Error) -> CliError {
    let code = match err.kind() {
        io::ErrorKind::PermissionDenied => PERMISSION_DENIED,
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => TIMEOUT,
        io::ErrorKind::ConnectionRefused | io::ErrorKind::NotFound => TIMEOUT,
        io::ErrorKind::AddrInUse | io::ErrorKind::AlreadyExists => TRANSPORT_ERROR,
        _ => INTERNAL,
    };
    CliError::new(code, format!("{context}: {err}"))
}

pub fn transport_error(context: &str, err: TransportError) -> CliError {
    match err {
        TransportError::InvalidName { .. } | TransportError::NameTooLong { .. } => {
            CliError::new(USAGE, format!("{context}: {err}"))
        }
        TransportError::Create { source, .. }
        | TransportError::Connect { source, .. }
        | TransportError::Accept(source)
        | TransportError::Io(source) => io_error(context, source),
    }
}

pub fn peer_error(context: &str, err: PeerError) -> CliError {
    match err {
        PeerError::Transport(err) => transport_error(context, err),
        PeerError::Io(source) => io_error(context, source),
        PeerError::MessageTooLarge { .. }
        | PeerError::MessageTruncated { .. }
        | PeerError::EmptyMessage => CliError::new(DATA_INVALID, format!("{context}: {err}")),
        PeerError::Disconnected | PeerError::Closed | PeerError::WriteIncomplete { .. } => {
            CliError::new(FAILURE, format!("{context}: {err}"))
        }
        other => CliError::new(INTERNAL, format!("{context}: {other}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_server_maps_to_timeout() {
        let err = peer_error(
            "connect failed",
            PeerError::Transport(TransportError::Connect {
                path: "/tmp/none.sock".into(),
                source: io::Error::from(io::ErrorKind::NotFound),
            }),
        );
        assert_eq!(err.code, TIMEOUT);
        assert!(err.message.starts_with("connect failed: "));
    }

    #[test]
    fn invalid_name_maps_to_usage() {
        let err = transport_error(
            "bad name",
            TransportError::InvalidName {
                name: "a/b".to_string(),
                reason: "name must not contain a path separator",
            },
        );
        assert_eq!(err.code, USAGE);
    }

    #[test]
    fn oversized_message_maps_to_data_invalid() {
        let err = peer_error(
            "send failed",
            PeerError::MessageTooLarge {
                size: 10,
                max: 4,
            },
        );
        assert_eq!(err.code, DATA_INVALID);
    }
}
