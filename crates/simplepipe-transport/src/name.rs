use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::{Result, TransportError};

/// A validated channel name and the platform address it resolves to.
///
/// The published name is what clients and servers agree on. The address is
/// the internal name handed to the OS:
/// - Unix: `<dir>/<name>.sock`, where `dir` defaults to the system temp dir.
/// - Windows: `\\.\pipe\<name>`.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ChannelName {
    name: String,
    address: PathBuf,
}

impl ChannelName {
    /// Upper bound on the internal address length, on every platform.
    pub const MAX_ADDRESS_LEN: usize = 256;

    /// Unix `sockaddr_un.sun_path` is 108 bytes on Linux, 104 on macOS,
    /// one of which is the terminating NUL.
    #[cfg(target_os = "linux")]
    const SUN_PATH_LEN: usize = 108;
    #[cfg(all(unix, not(target_os = "linux")))]
    const SUN_PATH_LEN: usize = 104;

    /// Resolve `name` in the default location.
    pub fn new(name: &str) -> Result<Self> {
        Self::in_dir(name, std::env::temp_dir())
    }

    /// Resolve `name` inside `dir`.
    ///
    /// Named pipes live in a flat kernel namespace, so `dir` is ignored on
    /// Windows.
    pub fn in_dir(name: &str, dir: impl AsRef<Path>) -> Result<Self> {
        validate(name)?;
        let address = address_for(name, dir.as_ref());

        let len = address.as_os_str().len();
        let max = Self::max_address_len();
        if len > max {
            return Err(TransportError::NameTooLong {
                path: address,
                len,
                max,
            });
        }

        Ok(Self {
            name: name.to_string(),
            address,
        })
    }

    /// The published channel name.
    pub fn as_str(&self) -> &str {
        &self.name
    }

    /// The platform-internal address.
    pub fn address(&self) -> &Path {
        &self.address
    }

    #[cfg(unix)]
    fn max_address_len() -> usize {
        Self::MAX_ADDRESS_LEN.min(Self::SUN_PATH_LEN - 1)
    }

    #[cfg(windows)]
    fn max_address_len() -> usize {
        Self::MAX_ADDRESS_LEN
    }
}

fn validate(name: &str) -> Result<()> {
    let reason = if name.is_empty() {
        "name must not be empty"
    } else if name.contains(['/', '\\']) {
        "name must not contain a path separator"
    } else if name.contains('\0') {
        "name must not contain a NUL byte"
    } else {
        return Ok(());
    };
    Err(TransportError::InvalidName {
        name: name.to_string(),
        reason,
    })
}

#[cfg(unix)]
fn address_for(name: &str, dir: &Path) -> PathBuf {
    dir.join(format!("{name}.sock"))
}

#[cfg(windows)]
fn address_for(name: &str, _dir: &Path) -> PathBuf {
    PathBuf::from(format!(r"\\.\pipe\{name}"))
}

impl fmt::Display for ChannelName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

impl fmt::Debug for ChannelName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelName")
            .field("name", &self.name)
            .field("address", &self.address)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_plain_name() {
        let name = ChannelName::in_dir("pipeA", "/tmp").expect("name should be valid");
        assert_eq!(name.as_str(), "pipeA");
        assert_eq!(name.to_string(), "pipeA");
    }

    #[cfg(unix)]
    #[test]
    fn unix_address_is_socket_file_in_dir() {
        let name = ChannelName::in_dir("pipeA", "/tmp/simplepipe").unwrap();
        assert_eq!(name.address(), Path::new("/tmp/simplepipe/pipeA.sock"));
    }

    #[test]
    fn rejects_path_separators() {
        for bad in ["a/b", "a\\b", "/abs"] {
            let err = ChannelName::in_dir(bad, "/tmp").unwrap_err();
            assert!(
                matches!(err, TransportError::InvalidName { .. }),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn rejects_empty_and_nul() {
        assert!(matches!(
            ChannelName::in_dir("", "/tmp"),
            Err(TransportError::InvalidName { .. })
        ));
        assert!(matches!(
            ChannelName::in_dir("a\0b", "/tmp"),
            Err(TransportError::InvalidName { .. })
        ));
    }

    #[test]
    fn rejects_overlong_address() {
        let long = "a".repeat(300);
        let result = ChannelName::in_dir(&long, "/tmp");
        assert!(matches!(result, Err(TransportError::NameTooLong { .. })));
    }

    #[cfg(unix)]
    #[test]
    fn unix_bound_is_tighter_than_generic_bound() {
        // Fits the 256-byte bound but not sun_path.
        let name = "n".repeat(150);
        let result = ChannelName::in_dir(&name, "/tmp");
        assert!(matches!(
            result,
            Err(TransportError::NameTooLong { max, .. }) if max < ChannelName::MAX_ADDRESS_LEN
        ));
    }
}
