#![allow(unsafe_code)]

//! Socket handle types.
//!
//! A [`SocketHandle`] is the identity of a kernel socket object: a plain
//! copyable value that hashes and compares by the OS descriptor. It carries
//! no ownership; the server machinery owns every live handle and retires
//! them explicitly. [`OwnedSocket`] is the owning counterpart used on the
//! paths where a descriptor has exactly one holder (the listener, a freshly
//! accepted connection that is not yet registered, an outbound client
//! connection): it closes the descriptor on drop, so error paths cannot
//! leak it.

use std::fmt;

/// Platform descriptor type: `RawFd` on POSIX, `SOCKET` on Windows.
#[cfg(unix)]
pub type RawSocket = std::os::unix::io::RawFd;
/// Platform descriptor type: `RawFd` on POSIX, `SOCKET` on Windows.
#[cfg(windows)]
pub type RawSocket = windows_sys::Win32::Networking::WinSock::SOCKET;

#[cfg(unix)]
const INVALID_RAW: RawSocket = -1;
#[cfg(windows)]
const INVALID_RAW: RawSocket = windows_sys::Win32::Networking::WinSock::INVALID_SOCKET;

/// Identity of a kernel socket object.
///
/// Two handles compare equal iff they name the same descriptor at this
/// moment. The value [`SocketHandle::INVALID`] is the empty sentinel and is
/// never a live socket.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SocketHandle(RawSocket);

impl SocketHandle {
    /// The empty sentinel (`-1` on POSIX, `INVALID_SOCKET` on Windows).
    pub const INVALID: Self = Self(INVALID_RAW);

    /// Wraps a raw descriptor without taking ownership.
    #[must_use]
    pub const fn from_raw(raw: RawSocket) -> Self {
        Self(raw)
    }

    /// Returns the raw descriptor.
    #[must_use]
    pub const fn raw(self) -> RawSocket {
        self.0
    }

    /// Returns true if this is not the empty sentinel.
    #[must_use]
    pub fn is_valid(self) -> bool {
        #[cfg(unix)]
        {
            self.0 >= 0
        }
        #[cfg(windows)]
        {
            self.0 != INVALID_RAW
        }
    }

    /// Disables sending and receiving on the socket, best effort.
    ///
    /// The descriptor itself stays open; pair with [`close`](Self::close)
    /// to release it.
    pub fn shutdown_both(self) {
        #[cfg(unix)]
        // SAFETY: shutdown on an arbitrary descriptor is a well-defined
        // syscall; a stale handle yields ENOTSOCK/EBADF, which we ignore.
        unsafe {
            let _ = libc::shutdown(self.0, libc::SHUT_RDWR);
        }
        #[cfg(windows)]
        unsafe {
            use windows_sys::Win32::Networking::WinSock::{shutdown, SD_BOTH};
            let _ = shutdown(self.0, SD_BOTH);
        }
    }

    /// Releases the descriptor back to the OS, best effort.
    pub(crate) fn close(self) {
        #[cfg(unix)]
        // SAFETY: the caller is the sole remaining owner of the descriptor.
        unsafe {
            let _ = libc::close(self.0);
        }
        #[cfg(windows)]
        unsafe {
            let _ = windows_sys::Win32::Networking::WinSock::closesocket(self.0);
        }
    }
}

impl fmt::Debug for SocketHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SocketHandle").field(&self.0).finish()
    }
}

impl fmt::Display for SocketHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A socket descriptor with a single owner.
///
/// Closes the descriptor on drop. Convert with
/// [`into_handle`](Self::into_handle) once ownership passes to the
/// connection registry (or to any other holder that will close it).
#[derive(Debug)]
pub struct OwnedSocket(SocketHandle);

impl OwnedSocket {
    /// Takes ownership of `handle`; it will be closed on drop.
    #[must_use]
    pub fn from_handle(handle: SocketHandle) -> Self {
        Self(handle)
    }

    /// Returns the underlying handle without giving up ownership.
    #[must_use]
    pub fn handle(&self) -> SocketHandle {
        self.0
    }

    /// Releases ownership, returning the handle without closing it.
    #[must_use]
    pub fn into_handle(self) -> SocketHandle {
        let handle = self.0;
        std::mem::forget(self);
        handle
    }
}

impl From<socket2::Socket> for OwnedSocket {
    fn from(socket: socket2::Socket) -> Self {
        #[cfg(unix)]
        let raw = {
            use std::os::unix::io::IntoRawFd;
            socket.into_raw_fd()
        };
        #[cfg(windows)]
        let raw = {
            use std::os::windows::io::IntoRawSocket;
            socket.into_raw_socket() as RawSocket
        };
        Self(SocketHandle::from_raw(raw))
    }
}

impl Drop for OwnedSocket {
    fn drop(&mut self) {
        if self.0.is_valid() {
            self.0.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn sentinel_is_invalid() {
        assert!(!SocketHandle::INVALID.is_valid());
    }

    #[test]
    fn identity_by_value() {
        let a = SocketHandle::from_raw(SocketHandle::from_raw(7).raw());
        let b = SocketHandle::from_raw(7);
        assert_eq!(a, b);
        assert_ne!(a, SocketHandle::from_raw(8));

        let mut set = HashSet::new();
        assert!(set.insert(a));
        assert!(!set.insert(b));
    }

    #[cfg(unix)]
    #[test]
    fn owned_socket_closes_on_drop() {
        use std::os::unix::io::IntoRawFd;
        use std::os::unix::net::UnixStream;

        let (a, _b) = UnixStream::pair().expect("socketpair");
        let raw = a.into_raw_fd();
        drop(OwnedSocket::from_handle(SocketHandle::from_raw(raw)));

        // The descriptor is gone: closing it again must fail with EBADF.
        // SAFETY: raw no longer names a live descriptor; close on a stale
        // value only returns an error.
        let ret = unsafe { libc::close(raw) };
        assert_eq!(ret, -1);
    }

    #[cfg(unix)]
    #[test]
    fn into_handle_releases_ownership() {
        use std::os::unix::io::IntoRawFd;
        use std::os::unix::net::UnixStream;

        let (a, _b) = UnixStream::pair().expect("socketpair");
        let raw = a.into_raw_fd();
        let handle = OwnedSocket::from_handle(SocketHandle::from_raw(raw)).into_handle();
        assert!(handle.is_valid());

        // Still open; close it ourselves.
        // SAFETY: we are the sole owner of the descriptor here.
        let ret = unsafe { libc::close(raw) };
        assert_eq!(ret, 0);
    }
}
