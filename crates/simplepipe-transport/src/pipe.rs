use std::io;
use std::os::windows::ffi::OsStrExt;
use std::os::windows::io::{AsRawHandle, FromRawHandle, OwnedHandle};
use std::path::Path;
use std::ptr;
use std::time::Duration;

use tracing::debug;
use windows_sys::Win32::Foundation::{
    ERROR_MORE_DATA, ERROR_PIPE_CONNECTED, GENERIC_READ, GENERIC_WRITE, HANDLE,
    INVALID_HANDLE_VALUE,
};
use windows_sys::Win32::Storage::FileSystem::{
    CreateFileW, FlushFileBuffers, ReadFile, WriteFile, OPEN_EXISTING, PIPE_ACCESS_DUPLEX,
};
use windows_sys::Win32::System::Pipes::{
    ConnectNamedPipe, CreateNamedPipeW, DisconnectNamedPipe, PeekNamedPipe,
    SetNamedPipeHandleState, PIPE_READMODE_MESSAGE, PIPE_TYPE_MESSAGE, PIPE_UNLIMITED_INSTANCES,
    PIPE_WAIT,
};
use windows_sys::Win32::System::IO::CancelIoEx;

use crate::endpoint::{Readiness, Received};

/// A created named pipe instance that no client has attached to yet.
pub(crate) struct PipeInstance {
    handle: OwnedHandle,
}

impl PipeInstance {
    /// Create one duplex, message-mode instance of the pipe at `address`.
    pub(crate) fn create(
        address: &Path,
        buffer_size: usize,
        connect_timeout: Duration,
    ) -> io::Result<Self> {
        let name = wide(address);
        let buffer_size = u32::try_from(buffer_size).unwrap_or(u32::MAX);
        let timeout_ms = u32::try_from(connect_timeout.as_millis()).unwrap_or(u32::MAX);

        // SAFETY: `name` is a NUL-terminated UTF-16 string that outlives the call;
        // a null security-attributes pointer selects the default descriptor.
        let handle = unsafe {
            CreateNamedPipeW(
                name.as_ptr(),
                PIPE_ACCESS_DUPLEX,
                PIPE_TYPE_MESSAGE | PIPE_READMODE_MESSAGE | PIPE_WAIT,
                PIPE_UNLIMITED_INSTANCES,
                buffer_size,
                buffer_size,
                timeout_ms,
                ptr::null(),
            )
        };
        if handle == INVALID_HANDLE_VALUE {
            return Err(io::Error::last_os_error());
        }

        Ok(Self {
            handle: own(handle),
        })
    }

    /// Block until a client attaches to this instance.
    pub(crate) fn wait_for_attach(self) -> io::Result<PipeHandle> {
        // SAFETY: the handle is a valid pipe instance; no OVERLAPPED is used.
        let ok = unsafe { ConnectNamedPipe(raw(&self.handle), ptr::null_mut()) };
        if ok == 0 {
            let err = io::Error::last_os_error();
            // A client that opened the pipe between create and connect is attached.
            if err.raw_os_error() != Some(ERROR_PIPE_CONNECTED as i32) {
                return Err(err);
            }
        }
        debug!("client attached");
        Ok(PipeHandle {
            handle: self.handle,
            server_side: true,
        })
    }
}

/// One attached end of a message-mode named pipe.
pub(crate) struct PipeHandle {
    handle: OwnedHandle,
    server_side: bool,
}

impl PipeHandle {
    /// Open the existing pipe at `address` as a client, in message read mode.
    pub(crate) fn connect(address: &Path) -> io::Result<Self> {
        let name = wide(address);
        // SAFETY: `name` is a NUL-terminated UTF-16 string that outlives the call.
        let handle = unsafe {
            CreateFileW(
                name.as_ptr(),
                GENERIC_READ | GENERIC_WRITE,
                0,
                ptr::null(),
                OPEN_EXISTING,
                0,
                ptr::null_mut(),
            )
        };
        if handle == INVALID_HANDLE_VALUE {
            return Err(io::Error::last_os_error());
        }
        let pipe = Self {
            handle: own(handle),
            server_side: false,
        };

        let mode = PIPE_READMODE_MESSAGE;
        // SAFETY: `mode` outlives the call; null pointers leave the other settings alone.
        let ok = unsafe {
            SetNamedPipeHandleState(raw(&pipe.handle), &mode, ptr::null(), ptr::null())
        };
        if ok == 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(pipe)
    }

    /// Pipes have no readiness notification for synchronous handles, so
    /// an empty pipe is re-checked after sleeping `timeout`.
    pub(crate) fn poll_readable(&self, timeout: Duration) -> io::Result<Readiness> {
        let mut available: u32 = 0;
        // SAFETY: only the byte-count out-pointer is supplied and it outlives the call.
        let ok = unsafe {
            PeekNamedPipe(
                raw(&self.handle),
                ptr::null_mut(),
                0,
                ptr::null_mut(),
                &mut available,
                ptr::null_mut(),
            )
        };
        if ok == 0 {
            let err = io::Error::last_os_error();
            if crate::endpoint::is_disconnect(&err) {
                return Ok(Readiness::Hangup);
            }
            return Err(err);
        }
        if available > 0 {
            return Ok(Readiness::Readable);
        }
        std::thread::sleep(timeout);
        Ok(Readiness::Idle)
    }

    pub(crate) fn recv(&self, buf: &mut [u8]) -> io::Result<Received> {
        let len = u32::try_from(buf.len()).unwrap_or(u32::MAX);
        let mut read: u32 = 0;
        // SAFETY: `buf` is valid for `len` bytes; no OVERLAPPED is used.
        let ok = unsafe {
            ReadFile(
                raw(&self.handle),
                buf.as_mut_ptr(),
                len,
                &mut read,
                ptr::null_mut(),
            )
        };
        if ok == 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(ERROR_MORE_DATA as i32) {
                return Ok(Received::Truncated {
                    len: read as usize,
                });
            }
            return Err(err);
        }
        if read == 0 {
            return Ok(Received::Closed);
        }
        Ok(Received::Message(read as usize))
    }

    pub(crate) fn send(&self, buf: &[u8]) -> io::Result<usize> {
        let len = u32::try_from(buf.len())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "message too large"))?;
        let mut written: u32 = 0;
        // SAFETY: `buf` is valid for `len` bytes; no OVERLAPPED is used.
        let ok = unsafe {
            WriteFile(
                raw(&self.handle),
                buf.as_ptr(),
                len,
                &mut written,
                ptr::null_mut(),
            )
        };
        if ok == 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(written as usize)
    }

    /// Wait until the peer has read everything written so far.
    pub(crate) fn flush(&self) -> io::Result<()> {
        // SAFETY: the handle is a valid, open pipe handle.
        if unsafe { FlushFileBuffers(raw(&self.handle)) } == 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Cancel every outstanding I/O request on the handle, from any thread.
    pub(crate) fn cancel(&self) {
        // SAFETY: the handle is valid; a null OVERLAPPED cancels all requests.
        let _ = unsafe { CancelIoEx(raw(&self.handle), ptr::null()) };
    }

    pub(crate) fn os_handle(&self) -> isize {
        self.handle.as_raw_handle() as isize
    }
}

impl Drop for PipeHandle {
    fn drop(&mut self) {
        if self.server_side {
            // SAFETY: the handle is a valid server-side pipe instance.
            let _ = unsafe { DisconnectNamedPipe(raw(&self.handle)) };
        }
    }
}

fn wide(path: &Path) -> Vec<u16> {
    path.as_os_str().encode_wide().chain(Some(0)).collect()
}

fn own(handle: HANDLE) -> OwnedHandle {
    // SAFETY: `handle` was just returned by the OS, is valid, and has no other owner.
    unsafe { OwnedHandle::from_raw_handle(handle as _) }
}

fn raw(handle: &OwnedHandle) -> HANDLE {
    handle.as_raw_handle() as HANDLE
}
