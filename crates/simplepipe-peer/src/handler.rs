use std::sync::Arc;

use crate::connection::Connection;
use crate::error::PeerError;

/// Reactions to connection events.
///
/// Every callback runs on the connection's own read-loop thread. For one
/// connection the order is always `on_open`, any number of `on_message`, at
/// most one `on_error`, then `on_close`.
pub trait Handler: Send + Sync + 'static {
    fn on_open(&self, _connection: &Connection) {}

    /// One inbound message, exactly as the peer sent it.
    fn on_message(&self, connection: &Connection, message: &[u8]);

    fn on_close(&self, _connection: &Connection) {}

    /// A terminal failure. Plain disconnects are not reported here.
    fn on_error(&self, _connection: &Connection, _error: &PeerError) {}
}

type EventFn = Arc<dyn Fn(&Connection) + Send + Sync>;
type MessageFn = Arc<dyn Fn(&Connection, &[u8]) + Send + Sync>;
type ErrorFn = Arc<dyn Fn(&Connection, &PeerError) + Send + Sync>;

/// A [`Handler`] assembled from closures. Unset callbacks do nothing.
///
/// ```
/// use simplepipe_peer::HandlerSet;
///
/// let handler = HandlerSet::new()
///     .on_message(|conn, msg| {
///         let _ = conn.send(msg);
///     })
///     .on_close(|conn| println!("connection {} closed", conn.id()));
/// # let _ = handler;
/// ```
#[derive(Clone, Default)]
pub struct HandlerSet {
    open: Option<EventFn>,
    message: Option<MessageFn>,
    close: Option<EventFn>,
    error: Option<ErrorFn>,
}

impl HandlerSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_open(mut self, f: impl Fn(&Connection) + Send + Sync + 'static) -> Self {
        self.open = Some(Arc::new(f));
        self
    }

    pub fn on_message(mut self, f: impl Fn(&Connection, &[u8]) + Send + Sync + 'static) -> Self {
        self.message = Some(Arc::new(f));
        self
    }

    pub fn on_close(mut self, f: impl Fn(&Connection) + Send + Sync + 'static) -> Self {
        self.close = Some(Arc::new(f));
        self
    }

    pub fn on_error(
        mut self,
        f: impl Fn(&Connection, &PeerError) + Send + Sync + 'static,
    ) -> Self {
        self.error = Some(Arc::new(f));
        self
    }
}

impl Handler for HandlerSet {
    fn on_open(&self, connection: &Connection) {
        if let Some(f) = &self.open {
            f(connection);
        }
    }

    fn on_message(&self, connection: &Connection, message: &[u8]) {
        if let Some(f) = &self.message {
            f(connection, message);
        }
    }

    fn on_close(&self, connection: &Connection) {
        if let Some(f) = &self.close {
            f(connection);
        }
    }

    fn on_error(&self, connection: &Connection, error: &PeerError) {
        if let Some(f) = &self.error {
            f(connection, error);
        }
    }
}

impl std::fmt::Debug for HandlerSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerSet")
            .field("on_open", &self.open.is_some())
            .field("on_message", &self.message.is_some())
            .field("on_close", &self.close.is_some())
            .field("on_error", &self.error.is_some())
            .finish()
    }
}
