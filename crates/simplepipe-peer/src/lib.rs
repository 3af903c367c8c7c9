//! Named-channel server and client built on `simplepipe-transport`.
//!
//! A [`Server`] accepts any number of clients under one channel name and
//! runs one thread per connection; a [`Client`] holds a single connection.
//! Both report connection events to a [`Handler`].

mod acceptor;
pub mod client;
pub mod config;
pub mod connection;
mod dispatcher;
pub mod error;
pub mod handler;
mod registry;
pub mod server;

pub use client::Client;
pub use config::{ClientConfig, CreationFailurePolicy, ServerConfig, DEFAULT_BUFFER_SIZE};
pub use connection::{Connection, ConnectionId};
pub use error::{PeerError, Result};
pub use handler::{Handler, HandlerSet};
pub use server::{Broadcaster, Server};
