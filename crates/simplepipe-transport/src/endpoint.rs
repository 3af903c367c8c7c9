use std::io;
use std::time::Duration;

/// Result of waiting for inbound data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// At least one message (or an EOF/error indication) can be read.
    Readable,
    /// Nothing arrived within the wait interval.
    Idle,
    /// The peer is gone and nothing is left to read.
    Hangup,
}

/// Result of one receive call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Received {
    /// A whole message of this many bytes was placed in the buffer.
    Message(usize),
    /// The message did not fit; only `len` bytes were kept, the rest is lost.
    Truncated { len: usize },
    /// The peer closed its end.
    Closed,
}

/// One attached instance of a named channel.
///
/// Every `send` is delivered to the peer as one discrete message. All
/// operations take `&self`, so one thread can sit in the read loop while
/// others write; [`Endpoint::cancel_io`] interrupts both.
///
/// On Unix, this wraps a `SOCK_SEQPACKET` Unix domain socket.
/// On Windows, this wraps a message-mode named pipe handle.
pub struct Endpoint {
    inner: EndpointInner,
}

enum EndpointInner {
    #[cfg(unix)]
    Unix(crate::uds::SeqPacket),
    #[cfg(windows)]
    Windows(crate::pipe::PipeHandle),
}

impl Endpoint {
    #[cfg(unix)]
    pub(crate) fn from_unix(socket: crate::uds::SeqPacket) -> Self {
        Self {
            inner: EndpointInner::Unix(socket),
        }
    }

    #[cfg(windows)]
    pub(crate) fn from_pipe(pipe: crate::pipe::PipeHandle) -> Self {
        Self {
            inner: EndpointInner::Windows(pipe),
        }
    }

    /// Wait up to `timeout` for inbound data.
    pub fn poll_readable(&self, timeout: Duration) -> io::Result<Readiness> {
        match &self.inner {
            #[cfg(unix)]
            EndpointInner::Unix(socket) => socket.poll_readable(timeout),
            #[cfg(windows)]
            EndpointInner::Windows(pipe) => pipe.poll_readable(timeout),
        }
    }

    /// Receive one message into `buf`.
    pub fn recv(&self, buf: &mut [u8]) -> io::Result<Received> {
        match &self.inner {
            #[cfg(unix)]
            EndpointInner::Unix(socket) => socket.recv(buf),
            #[cfg(windows)]
            EndpointInner::Windows(pipe) => pipe.recv(buf),
        }
    }

    /// Write `message` as one message (blocking). Returns the bytes written.
    pub fn send(&self, message: &[u8]) -> io::Result<usize> {
        match &self.inner {
            #[cfg(unix)]
            EndpointInner::Unix(socket) => socket.send(message),
            #[cfg(windows)]
            EndpointInner::Windows(pipe) => pipe.send(message),
        }
    }

    /// Flush outbound data before a graceful close.
    pub fn flush(&self) -> io::Result<()> {
        match &self.inner {
            #[cfg(unix)]
            EndpointInner::Unix(socket) => socket.flush(),
            #[cfg(windows)]
            EndpointInner::Windows(pipe) => pipe.flush(),
        }
    }

    /// Interrupt in-flight reads and writes on this endpoint.
    pub fn cancel_io(&self) {
        match &self.inner {
            #[cfg(unix)]
            EndpointInner::Unix(socket) => socket.cancel(),
            #[cfg(windows)]
            EndpointInner::Windows(pipe) => pipe.cancel(),
        }
    }
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.inner {
            #[cfg(unix)]
            EndpointInner::Unix(socket) => f
                .debug_struct("Endpoint")
                .field("type", &"seqpacket")
                .field("fd", &socket.os_handle())
                .finish(),
            #[cfg(windows)]
            EndpointInner::Windows(pipe) => f
                .debug_struct("Endpoint")
                .field("type", &"named-pipe")
                .field("handle", &pipe.os_handle())
                .finish(),
        }
    }
}

/// Whether `err` means the peer is gone or the channel is broken.
///
/// These are the expected ways for a connection to end and are reported as
/// a disconnect rather than as a failure.
pub fn is_disconnect(err: &io::Error) -> bool {
    if matches!(
        err.kind(),
        io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset | io::ErrorKind::NotConnected
    ) {
        return true;
    }
    is_disconnect_code(err.raw_os_error())
}

#[cfg(unix)]
fn is_disconnect_code(code: Option<i32>) -> bool {
    matches!(code, Some(libc::ESHUTDOWN) | Some(libc::EPIPE) | Some(libc::ECONNRESET))
}

#[cfg(windows)]
fn is_disconnect_code(code: Option<i32>) -> bool {
    use windows_sys::Win32::Foundation::{
        ERROR_BROKEN_PIPE, ERROR_NO_DATA, ERROR_PIPE_NOT_CONNECTED,
    };
    matches!(
        code.map(|c| c as u32),
        Some(ERROR_BROKEN_PIPE) | Some(ERROR_PIPE_NOT_CONNECTED) | Some(ERROR_NO_DATA)
    )
}

/// Whether `err` means the system ran out of descriptors, handles or memory.
///
/// An attach that fails this way could not create the server-side end of the
/// channel, so it is a creation failure rather than a client problem.
pub fn is_resource_exhaustion(err: &io::Error) -> bool {
    if err.kind() == io::ErrorKind::OutOfMemory {
        return true;
    }
    is_exhaustion_code(err.raw_os_error())
}

#[cfg(unix)]
fn is_exhaustion_code(code: Option<i32>) -> bool {
    matches!(
        code,
        Some(libc::EMFILE) | Some(libc::ENFILE) | Some(libc::ENOBUFS) | Some(libc::ENOMEM)
    )
}

#[cfg(windows)]
fn is_exhaustion_code(code: Option<i32>) -> bool {
    use windows_sys::Win32::Foundation::{
        ERROR_NOT_ENOUGH_MEMORY, ERROR_NO_SYSTEM_RESOURCES, ERROR_OUTOFMEMORY,
        ERROR_TOO_MANY_OPEN_FILES,
    };
    matches!(
        code.map(|c| c as u32),
        Some(ERROR_NOT_ENOUGH_MEMORY)
            | Some(ERROR_OUTOFMEMORY)
            | Some(ERROR_NO_SYSTEM_RESOURCES)
            | Some(ERROR_TOO_MANY_OPEN_FILES)
    )
}
