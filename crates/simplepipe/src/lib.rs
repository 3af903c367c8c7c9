//! Named, duplex, message-framed local IPC.
//!
//! A server publishes a channel name and accepts any number of clients; each
//! `send` arrives at the other side as exactly one message. Messages can also
//! be broadcast to every connected client.
//!
//! # Crate Structure
//!
//! - [`transport`]: channel names and OS endpoints (seqpacket sockets, named pipes)
//! - [`peer`]: [`peer::Server`], [`peer::Client`] and connection handlers (behind `peer` feature)

/// Re-export transport types.
pub mod transport {
    pub use simplepipe_transport::*;
}

/// Re-export server and client types (requires `peer` feature).
#[cfg(feature = "peer")]
pub mod peer {
    pub use simplepipe_peer::*;
}
