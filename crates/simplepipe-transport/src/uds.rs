use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{FileTypeExt, MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::ptr;
use std::time::Duration;

use tracing::{debug, info};

use crate::endpoint::{Readiness, Received};

/// Pending connections the kernel queues while the acceptor is busy.
const LISTEN_BACKLOG: libc::c_int = 128;

// Apple targets have no MSG_NOSIGNAL (and no AF_UNIX seqpacket sockets either,
// so socket creation already fails there).
#[cfg(not(target_vendor = "apple"))]
const SEND_FLAGS: libc::c_int = libc::MSG_NOSIGNAL;
#[cfg(target_vendor = "apple")]
const SEND_FLAGS: libc::c_int = 0;

/// Listening `SOCK_SEQPACKET` Unix domain socket bound to a filesystem path.
///
/// The socket file is removed on drop, unless something else has replaced it
/// in the meantime.
pub(crate) struct ListenSocket {
    fd: OwnedFd,
    path: PathBuf,
    created_inode: Option<(u64, u64)>,
}

impl ListenSocket {
    /// Bind and listen on `path`.
    ///
    /// A stale socket file left behind by a dead server is removed first. A
    /// socket that still accepts connections is a name collision, and any
    /// non-socket file is never touched.
    pub(crate) fn bind(path: &Path, mode: u32) -> io::Result<Self> {
        if path.exists() {
            let metadata = std::fs::symlink_metadata(path)?;
            if !metadata.file_type().is_socket() {
                return Err(io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    "existing path is not a unix socket",
                ));
            }
            if SeqPacket::connect(path).is_ok() {
                return Err(io::Error::new(
                    io::ErrorKind::AddrInUse,
                    "channel name is already served by another listener",
                ));
            }
            debug!(?path, "removing stale socket");
            std::fs::remove_file(path)?;
        }

        let fd = new_socket()?;
        let (addr, len) = sockaddr_un(path)?;
        // SAFETY: `addr` is an initialized sockaddr_un and `len` covers its used prefix.
        cvt(unsafe {
            libc::bind(
                fd.as_raw_fd(),
                (&addr as *const libc::sockaddr_un).cast::<libc::sockaddr>(),
                len,
            )
        })?;

        std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))?;
        let created = std::fs::symlink_metadata(path)?;

        // SAFETY: `fd` is a bound socket owned by this function.
        cvt(unsafe { libc::listen(fd.as_raw_fd(), LISTEN_BACKLOG) })?;

        info!(?path, "listening on seqpacket socket");

        Ok(Self {
            fd,
            path: path.to_path_buf(),
            created_inode: Some((created.dev(), created.ino())),
        })
    }

    /// Block until a client attaches.
    pub(crate) fn accept(&self) -> io::Result<SeqPacket> {
        loop {
            // SAFETY: null address pointers are allowed when the peer address is not wanted.
            let rc = unsafe { libc::accept(self.fd.as_raw_fd(), ptr::null_mut(), ptr::null_mut()) };
            if rc == -1 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }
            // SAFETY: accept(2) returned a fresh descriptor nobody else owns.
            let fd = unsafe { OwnedFd::from_raw_fd(rc) };
            set_cloexec(&fd)?;
            debug!(path = ?self.path, "client attached");
            return Ok(SeqPacket { fd });
        }
    }
}

impl Drop for ListenSocket {
    fn drop(&mut self) {
        let Some((expected_dev, expected_ino)) = self.created_inode else {
            return;
        };
        if let Ok(metadata) = std::fs::symlink_metadata(&self.path) {
            if metadata.file_type().is_socket()
                && metadata.dev() == expected_dev
                && metadata.ino() == expected_ino
            {
                debug!(path = ?self.path, "cleaning up socket file");
                let _ = std::fs::remove_file(&self.path);
            } else {
                debug!(
                    path = ?self.path,
                    "socket path identity changed; skipping cleanup"
                );
            }
        }
    }
}

/// One attached, connection-oriented, message-preserving socket.
pub(crate) struct SeqPacket {
    fd: OwnedFd,
}

impl SeqPacket {
    /// Attach to a listening socket at `path`.
    pub(crate) fn connect(path: &Path) -> io::Result<Self> {
        let fd = new_socket()?;
        let (addr, len) = sockaddr_un(path)?;
        // SAFETY: `addr` is an initialized sockaddr_un and `len` covers its used prefix.
        cvt(unsafe {
            libc::connect(
                fd.as_raw_fd(),
                (&addr as *const libc::sockaddr_un).cast::<libc::sockaddr>(),
                len,
            )
        })?;
        Ok(Self { fd })
    }

    pub(crate) fn poll_readable(&self, timeout: Duration) -> io::Result<Readiness> {
        let mut pfd = libc::pollfd {
            fd: self.fd.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        let timeout_ms = timeout.as_millis().clamp(1, libc::c_int::MAX as u128) as libc::c_int;

        // SAFETY: `pfd` is a valid array of one pollfd for the duration of the call.
        let rc = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
        if rc == -1 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(Readiness::Idle);
            }
            return Err(err);
        }
        if rc == 0 {
            return Ok(Readiness::Idle);
        }

        if pfd.revents & libc::POLLNVAL != 0 {
            return Err(io::Error::from_raw_os_error(libc::EBADF));
        }
        // POLLERR is reported by the following recv.
        if pfd.revents & (libc::POLLIN | libc::POLLERR) != 0 {
            return Ok(Readiness::Readable);
        }
        if pfd.revents & libc::POLLHUP != 0 {
            return Ok(Readiness::Hangup);
        }
        Ok(Readiness::Idle)
    }

    pub(crate) fn recv(&self, buf: &mut [u8]) -> io::Result<Received> {
        let mut iov = libc::iovec {
            iov_base: buf.as_mut_ptr().cast::<libc::c_void>(),
            iov_len: buf.len(),
        };
        // SAFETY: msghdr is a plain C struct; all-zero means no name and no control data.
        let mut msg: libc::msghdr = unsafe { mem::zeroed() };
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;

        loop {
            // SAFETY: `msg` points at `iov`, which points at `buf`; both outlive the call.
            let rc = unsafe { libc::recvmsg(self.fd.as_raw_fd(), &mut msg, 0) };
            if rc == -1 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }
            let len = rc as usize;
            if len == 0 {
                return Ok(Received::Closed);
            }
            if msg.msg_flags & libc::MSG_TRUNC != 0 {
                return Ok(Received::Truncated { len });
            }
            return Ok(Received::Message(len));
        }
    }

    pub(crate) fn send(&self, buf: &[u8]) -> io::Result<usize> {
        loop {
            // SAFETY: `buf` is valid for `buf.len()` bytes for the duration of the call.
            let rc = unsafe {
                libc::send(
                    self.fd.as_raw_fd(),
                    buf.as_ptr().cast::<libc::c_void>(),
                    buf.len(),
                    SEND_FLAGS,
                )
            };
            if rc == -1 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }
            return Ok(rc as usize);
        }
    }

    /// Sent messages are already queued at the peer; nothing to drain.
    pub(crate) fn flush(&self) -> io::Result<()> {
        Ok(())
    }

    /// Shut down both directions, waking any thread blocked in poll, recv or send.
    pub(crate) fn cancel(&self) {
        // SAFETY: `fd` is a valid socket; shutdown(2) on it has no memory effects.
        let _ = unsafe { libc::shutdown(self.fd.as_raw_fd(), libc::SHUT_RDWR) };
    }

    pub(crate) fn os_handle(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

fn cvt(rc: libc::c_int) -> io::Result<libc::c_int> {
    if rc == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(rc)
    }
}

fn new_socket() -> io::Result<OwnedFd> {
    // SAFETY: socket(2) with constant arguments has no memory effects.
    let raw = cvt(unsafe { libc::socket(libc::AF_UNIX, libc::SOCK_SEQPACKET, 0) })?;
    // SAFETY: socket(2) returned a fresh descriptor nobody else owns.
    let fd = unsafe { OwnedFd::from_raw_fd(raw) };
    set_cloexec(&fd)?;
    Ok(fd)
}

fn set_cloexec(fd: &OwnedFd) -> io::Result<()> {
    // SAFETY: `fd` is an open descriptor owned by the caller.
    cvt(unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_SETFD, libc::FD_CLOEXEC) })?;
    Ok(())
}

fn sockaddr_un(path: &Path) -> io::Result<(libc::sockaddr_un, libc::socklen_t)> {
    // SAFETY: sockaddr_un is a plain C struct for which all-zero bytes are valid.
    let mut addr: libc::sockaddr_un = unsafe { mem::zeroed() };
    addr.sun_family = libc::AF_UNIX as libc::sa_family_t;

    let bytes = path.as_os_str().as_bytes();
    if bytes.len() >= addr.sun_path.len() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "socket path too long",
        ));
    }
    for (dst, src) in addr.sun_path.iter_mut().zip(bytes) {
        *dst = *src as libc::c_char;
    }

    let offset = addr.sun_path.as_ptr() as usize - (&addr as *const libc::sockaddr_un as usize);
    let len = offset + bytes.len() + 1;
    Ok((addr, len as libc::socklen_t))
}
