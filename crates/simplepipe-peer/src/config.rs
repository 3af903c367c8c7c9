use std::path::PathBuf;
use std::time::Duration;

use simplepipe_transport::{ChannelName, ListenerOptions};

use crate::error::Result;

/// Default per-connection read and write buffer size, in bytes.
pub const DEFAULT_BUFFER_SIZE: usize = 2048;

/// Default wait between readiness checks in a connection's read loop.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// What the accept loop does when it cannot create a channel instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreationFailurePolicy {
    /// Stop accepting. The server keeps serving existing connections and
    /// reports the failure through `has_error()`.
    Terminate,
    /// Wait `backoff`, then try again.
    Retry { backoff: Duration },
}

impl Default for CreationFailurePolicy {
    fn default() -> Self {
        Self::Retry {
            backoff: Duration::from_millis(100),
        }
    }
}

/// Server behavior configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Published channel name.
    pub name: String,
    /// Directory holding the socket file. `None` means the system temp dir.
    /// Ignored on Windows.
    pub directory: Option<PathBuf>,
    /// Maximum message size, inbound and outbound.
    pub buffer_size: usize,
    /// Default wait a client gets while every instance is busy (Windows).
    pub connect_timeout: Duration,
    /// Readiness wait in each read loop, and the stop handshake retry interval.
    pub poll_interval: Duration,
    pub creation_failure: CreationFailurePolicy,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: "server".to_string(),
            directory: None,
            buffer_size: DEFAULT_BUFFER_SIZE,
            connect_timeout: Duration::from_millis(50),
            poll_interval: DEFAULT_POLL_INTERVAL,
            creation_failure: CreationFailurePolicy::default(),
        }
    }
}

impl ServerConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_directory(mut self, directory: impl Into<PathBuf>) -> Self {
        self.directory = Some(directory.into());
        self
    }

    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_creation_failure(mut self, policy: CreationFailurePolicy) -> Self {
        self.creation_failure = policy;
        self
    }

    pub(crate) fn channel_name(&self) -> Result<ChannelName> {
        resolve(&self.name, self.directory.as_ref())
    }

    pub(crate) fn listener_options(&self) -> ListenerOptions {
        ListenerOptions {
            buffer_size: self.buffer_size,
            connect_timeout: self.connect_timeout,
            ..ListenerOptions::default()
        }
    }
}

/// Client behavior configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Channel name to attach to.
    pub name: String,
    /// Directory holding the socket file. Ignored on Windows.
    pub directory: Option<PathBuf>,
    /// Maximum message size, inbound and outbound.
    pub buffer_size: usize,
    /// How long `start()` keeps retrying while the server is absent or busy.
    pub connect_timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            name: "server".to_string(),
            directory: None,
            buffer_size: DEFAULT_BUFFER_SIZE,
            connect_timeout: Duration::from_secs(5),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

impl ClientConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_directory(mut self, directory: impl Into<PathBuf>) -> Self {
        self.directory = Some(directory.into());
        self
    }

    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub(crate) fn channel_name(&self) -> Result<ChannelName> {
        resolve(&self.name, self.directory.as_ref())
    }
}

fn resolve(name: &str, directory: Option<&PathBuf>) -> Result<ChannelName> {
    let name = match directory {
        Some(dir) => ChannelName::in_dir(name, dir)?,
        None => ChannelName::new(name)?,
    };
    Ok(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.name, "server");
        assert_eq!(config.buffer_size, 2048);
        assert_eq!(config.connect_timeout, Duration::from_millis(50));
        assert_eq!(
            config.creation_failure,
            CreationFailurePolicy::Retry {
                backoff: Duration::from_millis(100)
            }
        );
    }

    #[test]
    fn builders_override_fields() {
        let config = ServerConfig::new("pipeA")
            .with_buffer_size(64)
            .with_poll_interval(Duration::from_millis(1))
            .with_creation_failure(CreationFailurePolicy::Terminate);
        assert_eq!(config.name, "pipeA");
        assert_eq!(config.buffer_size, 64);
        assert_eq!(config.poll_interval, Duration::from_millis(1));
        assert_eq!(config.creation_failure, CreationFailurePolicy::Terminate);
        assert_eq!(config.listener_options().buffer_size, 64);
    }

    #[test]
    fn invalid_name_is_rejected_on_resolve() {
        let config = ClientConfig::new("a/b");
        assert!(config.channel_name().is_err());
    }

    #[cfg(unix)]
    #[test]
    fn directory_places_socket_file() {
        let config = ClientConfig::new("pipeA").with_directory("/tmp/sp-config");
        let name = config.channel_name().expect("name should resolve");
        assert_eq!(
            name.address(),
            std::path::Path::new("/tmp/sp-config/pipeA.sock")
        );
    }
}
