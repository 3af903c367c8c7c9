//! Named, duplex, message-framed local channel endpoints.
//!
//! Provides a unified interface over the platform's message-preserving local
//! channel:
//! - `SOCK_SEQPACKET` Unix domain sockets (Linux)
//! - Message-mode named pipes (Windows)
//!
//! This is the lowest layer of simplepipe. A server creates channel instances
//! through a [`ChannelListener`] and waits for clients to attach; a client
//! attaches with [`connect`]. Both sides end up holding an [`Endpoint`].

pub mod endpoint;
pub mod error;
pub mod listener;
pub mod name;

#[cfg(unix)]
mod uds;

#[cfg(windows)]
mod pipe;

pub use endpoint::{Endpoint, Readiness, Received};
pub use error::{Result, TransportError};
pub use listener::{connect, connect_once, ChannelListener, ListenerOptions, PendingInstance};
pub use name::ChannelName;
