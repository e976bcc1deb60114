#![allow(unsafe_code)]

//! kqueue backend (macOS, iOS, the BSDs).
//!
//! One-shot handles are registered with `EV_ONESHOT`; re-arming re-issues
//! `EV_ADD`, which is idempotent for an existing registration. The wake
//! channel is an `EVFILT_USER` event triggered with `NOTE_TRIGGER`.
//! `remove` is a no-op: a one-shot delivery already disarms the filter and
//! closing the descriptor drops the registration entirely.

use crate::socket::SocketHandle;
use std::io;
use std::os::unix::io::RawFd;
use std::ptr;
use tracing::error;

use super::EVENT_QUEUE_CAPACITY;

/// Identifier of the wake event; distinct from any descriptor we watch.
const WAKE_IDENT: libc::uintptr_t = 0;

/// Readiness notifier backed by kqueue.
#[derive(Debug)]
pub struct Notifier {
    kq: RawFd,
}

impl Notifier {
    /// Creates the kernel queue and its wake channel.
    pub fn new() -> io::Result<Self> {
        // SAFETY: kqueue allocates a new descriptor; no pointers.
        let kq = unsafe { libc::kqueue() };
        if kq == -1 {
            let err = io::Error::last_os_error();
            error!(error = %err, "unable to create kernel queue");
            return Err(err);
        }

        let notifier = Self { kq };
        // SAFETY: kevent structs are plain C data; zeroed is valid.
        let mut change: libc::kevent = unsafe { std::mem::zeroed() };
        change.ident = WAKE_IDENT;
        change.filter = libc::EVFILT_USER;
        change.flags = (libc::EV_ADD | libc::EV_CLEAR) as _;
        if let Err(err) = notifier.submit(&change) {
            error!(error = %err, "unable to register wake event");
            return Err(err);
        }
        Ok(notifier)
    }

    /// Begins delivering readable notifications for `sock`.
    pub fn add(&self, sock: SocketHandle, oneshot: bool) -> io::Result<()> {
        self.watch(sock, oneshot).map_err(|err| {
            error!(socket = %sock, error = %err, "unable to watch socket");
            err
        })
    }

    /// Re-arms an already-registered handle after a one-shot delivery.
    pub fn rearm(&self, sock: SocketHandle, oneshot: bool) -> io::Result<()> {
        self.watch(sock, oneshot).map_err(|err| {
            error!(socket = %sock, error = %err, "unable to re-arm socket");
            err
        })
    }

    /// Stops delivering notifications for `sock`.
    ///
    /// No-op: the kernel removes the registration when the descriptor is
    /// closed, and one-shot deliveries disarm it already.
    pub fn remove(&self, _sock: SocketHandle) -> io::Result<()> {
        Ok(())
    }

    /// Blocks until at least one registered handle is ready.
    ///
    /// Fills `batch` with the ready handles and returns how many there are.
    /// Wake deliveries are filtered out; a return of `Ok(0)` means the wait
    /// was interrupted by [`wake`](Self::wake).
    pub fn wait(&self, batch: &mut EventBatch) -> io::Result<usize> {
        batch.ready.clear();
        let count = loop {
            // SAFETY: the scratch buffer holds `capacity` initialized
            // kevent entries and outlives the call.
            let n = unsafe {
                libc::kevent(
                    self.kq,
                    ptr::null(),
                    0,
                    batch.sys.as_mut_ptr(),
                    batch.sys.len() as libc::c_int,
                    ptr::null(),
                )
            };
            if n >= 0 {
                break n as usize;
            }
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            error!(error = %err, "kevent wait failed");
            return Err(err);
        };

        for event in &batch.sys[..count] {
            if event.filter == libc::EVFILT_USER {
                continue;
            }
            batch
                .ready
                .push(SocketHandle::from_raw(event.ident as RawFd));
        }
        Ok(batch.ready.len())
    }

    /// Makes a concurrent blocked [`wait`](Self::wait) return.
    pub fn wake(&self) -> io::Result<()> {
        // SAFETY: kevent structs are plain C data; zeroed is valid.
        let mut change: libc::kevent = unsafe { std::mem::zeroed() };
        change.ident = WAKE_IDENT;
        change.filter = libc::EVFILT_USER;
        change.fflags = libc::NOTE_TRIGGER;
        self.submit(&change).map_err(|err| {
            error!(error = %err, "unable to wake notifier");
            err
        })
    }

    fn watch(&self, sock: SocketHandle, oneshot: bool) -> io::Result<()> {
        // SAFETY: kevent structs are plain C data; zeroed is valid.
        let mut change: libc::kevent = unsafe { std::mem::zeroed() };
        change.ident = sock.raw() as libc::uintptr_t;
        change.filter = libc::EVFILT_READ;
        change.flags = if oneshot {
            (libc::EV_ADD | libc::EV_ONESHOT) as _
        } else {
            libc::EV_ADD as _
        };
        self.submit(&change)
    }

    fn submit(&self, change: &libc::kevent) -> io::Result<()> {
        // SAFETY: submits one changelist entry; no output buffer.
        let ret = unsafe { libc::kevent(self.kq, change, 1, ptr::null_mut(), 0, ptr::null()) };
        if ret == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl Drop for Notifier {
    fn drop(&mut self) {
        // SAFETY: the queue descriptor is owned by this notifier.
        unsafe {
            let _ = libc::close(self.kq);
        }
    }
}

/// Reusable scratch space for [`Notifier::wait`].
pub struct EventBatch {
    sys: Vec<libc::kevent>,
    ready: Vec<SocketHandle>,
}

impl EventBatch {
    /// Creates a batch that can report up to `capacity` handles per wait.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let mut sys = Vec::with_capacity(capacity);
        // SAFETY: kevent structs are plain C data; zeroed is valid.
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

    /// Iterates the ready handles in kernel delivery order.
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
