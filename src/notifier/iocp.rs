#![allow(unsafe_code)]

//! I/O completion port backend (Windows).
//!
//! IOCP is completion-based rather than readiness-based: associating a
//! socket with the port is a one-time operation, so `rearm` and `remove`
//! are no-ops and the `oneshot` flag is accepted for interface parity. The
//! wake channel is a posted completion packet carrying a reserved key.

use crate::socket::SocketHandle;
use std::io;
use std::ptr;
use tracing::error;
use windows_sys::Win32::Foundation::{CloseHandle, HANDLE, INVALID_HANDLE_VALUE};
use windows_sys::Win32::System::IO::{
    CreateIoCompletionPort, GetQueuedCompletionStatusEx, PostQueuedCompletionStatus,
    OVERLAPPED_ENTRY,
};

use super::EVENT_QUEUE_CAPACITY;

/// Completion key carried by wake packets; never a valid socket.
const WAKE_KEY: usize = usize::MAX;

/// Block indefinitely in `GetQueuedCompletionStatusEx`.
const INFINITE: u32 = u32::MAX;

/// Readiness notifier backed by an I/O completion port.
#[derive(Debug)]
pub struct Notifier {
    port: HANDLE,
}

// SAFETY: a completion port handle may be shared and used from any thread;
// the OS serializes operations on it.
unsafe impl Send for Notifier {}
// SAFETY: see above.
unsafe impl Sync for Notifier {}

impl Notifier {
    /// Creates the completion port.
    pub fn new() -> io::Result<Self> {
        // SAFETY: creates a fresh port; no existing handle is associated.
        let port = unsafe { CreateIoCompletionPort(INVALID_HANDLE_VALUE, ptr::null_mut(), 0, 0) };
        if port.is_null() {
            let err = io::Error::last_os_error();
            error!(error = %err, "unable to create completion port");
            return Err(err);
        }
        Ok(Self { port })
    }

    /// Associates `sock` with the completion port.
    ///
    /// The completion key is the socket value itself, so completions map
    /// straight back to handles.
    pub fn add(&self, sock: SocketHandle, _oneshot: bool) -> io::Result<()> {
        // SAFETY: associates a live socket handle with our port; the key is
        // a plain integer.
        let ret =
            unsafe { CreateIoCompletionPort(sock.raw() as HANDLE, self.port, sock.raw(), 0) };
        if ret.is_null() {
            let err = io::Error::last_os_error();
            error!(socket = %sock, error = %err, "unable to watch socket");
            return Err(err);
        }
        Ok(())
    }

    /// No-op: a port association persists until the socket is closed.
    pub fn rearm(&self, _sock: SocketHandle, _oneshot: bool) -> io::Result<()> {
        Ok(())
    }

    /// No-op: closing the socket releases the association.
    pub fn remove(&self, _sock: SocketHandle) -> io::Result<()> {
        Ok(())
    }

    /// Blocks until at least one completion packet arrives.
    ///
    /// Fills `batch` with the corresponding handles and returns how many
    /// there are. Wake packets are filtered out; a return of `Ok(0)` means
    /// the wait was interrupted by [`wake`](Self::wake).
    pub fn wait(&self, batch: &mut EventBatch) -> io::Result<usize> {
        batch.ready.clear();
        let mut count: u32 = 0;
        // SAFETY: the scratch buffer holds `capacity` entries and outlives
        // the call; `count` receives how many were filled.
        let ok = unsafe {
            GetQueuedCompletionStatusEx(
                self.port,
                batch.sys.as_mut_ptr(),
                batch.sys.len() as u32,
                &mut count,
                INFINITE,
                0,
            )
        };
        if ok == 0 {
            let err = io::Error::last_os_error();
            error!(error = %err, "completion port wait failed");
            return Err(err);
        }

        for entry in &batch.sys[..count as usize] {
            if entry.lpCompletionKey == WAKE_KEY {
                continue;
            }
            batch
                .ready
                .push(SocketHandle::from_raw(entry.lpCompletionKey));
        }
        Ok(batch.ready.len())
    }

    /// Makes a concurrent blocked [`wait`](Self::wait) return.
    pub fn wake(&self) -> io::Result<()> {
        // SAFETY: posts a packet with a reserved key and no overlapped
        // structure.
        let ok = unsafe { PostQueuedCompletionStatus(self.port, 0, WAKE_KEY, ptr::null_mut()) };
        if ok == 0 {
            let err = io::Error::last_os_error();
            error!(error = %err, "unable to wake notifier");
            return Err(err);
        }
        Ok(())
    }
}

impl Drop for Notifier {
    fn drop(&mut self) {
        // SAFETY: the port handle is owned by this notifier.
        unsafe {
            let _ = CloseHandle(self.port);
        }
    }
}

/// Reusable scratch space for [`Notifier::wait`].
pub struct EventBatch {
    sys: Vec<OVERLAPPED_ENTRY>,
    ready: Vec<SocketHandle>,
}

impl EventBatch {
    /// Creates a batch that can report up to `capacity` handles per wait.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let mut sys = Vec::with_capacity(capacity);
        // SAFETY: OVERLAPPED_ENTRY is plain C data; zeroed is valid.
        sys.resize_with(capacity, || unsafe { std::mem::zeroed() });
        Self {
            sys,
            ready: Vec::with_capacity(capacity),
        }
    }

    /// Number of ready handles from the most recent wait.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ready.len()
    }

    /// True if the most recent wait reported no ready handles.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ready.is_empty()
    }

    /// Maximum number of handles a single wait can report.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.sys.len()
    }

    /// Iterates the ready handles in completion delivery order.
    pub fn iter(&self) -> std::slice::Iter<'_, SocketHandle> {
        self.ready.iter()
    }
}

impl Default for EventBatch {
    fn default() -> Self {
        Self::with_capacity(EVENT_QUEUE_CAPACITY)
    }
}

impl<'a> IntoIterator for &'a EventBatch {
    type Item = &'a SocketHandle;
    type IntoIter = std::slice::Iter<'a, SocketHandle>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl std::fmt::Debug for EventBatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBatch")
            .field("ready", &self.ready.len())
            .field("capacity", &self.sys.len())
            .finish()
    }
}
