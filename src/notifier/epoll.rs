#![allow(unsafe_code)]

//! epoll backend (Linux, Android).
//!
//! Registrations are level-triggered with `EPOLLONESHOT` layered on for
//! one-shot handles. The wake channel is an `eventfd` registered
//! persistently in the same epoll set under a reserved token.

use crate::socket::SocketHandle;
use std::io;
use std::os::unix::io::RawFd;
use tracing::error;

use super::EVENT_QUEUE_CAPACITY;

/// Token carried by wake deliveries; never a valid descriptor.
const WAKE_TOKEN: u64 = u64::MAX;

/// Readiness notifier backed by epoll.
#[derive(Debug)]
pub struct Notifier {
    epoll: RawFd,
    wake_fd: RawFd,
}

impl Notifier {
    /// Creates the epoll set and its wake channel.
    pub fn new() -> io::Result<Self> {
        // SAFETY: epoll_create1 allocates a new descriptor; no pointers.
        let epoll = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epoll == -1 {
            let err = io::Error::last_os_error();
            error!(error = %err, "unable to create epoll set");
            return Err(err);
        }

        // SAFETY: eventfd allocates a new descriptor; no pointers.
        let wake_fd = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) };
        if wake_fd == -1 {
            let err = io::Error::last_os_error();
            error!(error = %err, "unable to create wake eventfd");
            // SAFETY: epoll is the descriptor we just created.
            unsafe { libc::close(epoll) };
            return Err(err);
        }

        let notifier = Self { epoll, wake_fd };
        if let Err(err) = notifier.ctl(libc::EPOLL_CTL_ADD, wake_fd, libc::EPOLLIN as u32, WAKE_TOKEN)
        {
            error!(error = %err, "unable to register wake eventfd");
            return Err(err);
        }
        Ok(notifier)
    }

    /// Begins delivering readable notifications for `sock`.
    pub fn add(&self, sock: SocketHandle, oneshot: bool) -> io::Result<()> {
        self.ctl(
            libc::EPOLL_CTL_ADD,
            sock.raw(),
            interest(oneshot),
            sock.raw() as u64,
        )
        .map_err(|err| {
            error!(socket = %sock, error = %err, "unable to watch socket");
            err
        })
    }

    /// Re-arms an already-registered handle after a one-shot delivery.
    pub fn rearm(&self, sock: SocketHandle, oneshot: bool) -> io::Result<()> {
        self.ctl(
            libc::EPOLL_CTL_MOD,
            sock.raw(),
            interest(oneshot),
            sock.raw() as u64,
        )
        .map_err(|err| {
            error!(socket = %sock, error = %err, "unable to re-arm socket");
            err
        })
    }

    /// Stops delivering notifications for `sock`.
    pub fn remove(&self, sock: SocketHandle) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_DEL, sock.raw(), 0, 0).map_err(|err| {
            error!(socket = %sock, error = %err, "unable to unwatch socket");
            err
        })
    }

    /// Blocks until at least one registered handle is ready.
    ///
    /// Fills `batch` with the ready handles and returns how many there are.
    /// Wake deliveries are drained internally; a return of `Ok(0)` means
    /// the wait was interrupted by [`wake`](Self::wake).
    pub fn wait(&self, batch: &mut EventBatch) -> io::Result<usize> {
        batch.ready.clear();
        let count = loop {
            // SAFETY: the scratch buffer holds `capacity` initialized
            // epoll_event entries and outlives the call.
            let n = unsafe {
                libc::epoll_wait(
                    self.epoll,
                    batch.sys.as_mut_ptr(),
                    batch.sys.len() as libc::c_int,
                    -1,
                )
            };
            if n >= 0 {
                break n as usize;
            }
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            error!(error = %err, "epoll wait failed");
            return Err(err);
        };

        for event in &batch.sys[..count] {
            if event.u64 == WAKE_TOKEN {
                self.drain_wake();
                continue;
            }
            batch.ready.push(SocketHandle::from_raw(event.u64 as RawFd));
        }
        Ok(batch.ready.len())
    }

    /// Makes a concurrent blocked [`wait`](Self::wait) return.
    pub fn wake(&self) -> io::Result<()> {
        let one: u64 = 1;
        // SAFETY: writes 8 bytes from a stack value to the eventfd.
        let n = unsafe {
            libc::write(
                self.wake_fd,
                std::ptr::addr_of!(one).cast::<libc::c_void>(),
                std::mem::size_of::<u64>(),
            )
        };
        if n == -1 {
            let err = io::Error::last_os_error();
            // A full counter means a wake is already pending.
            if err.kind() != io::ErrorKind::WouldBlock {
                error!(error = %err, "unable to wake notifier");
                return Err(err);
            }
        }
        Ok(())
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, events: u32, token: u64) -> io::Result<()> {
        let mut event = libc::epoll_event { events, u64: token };
        // SAFETY: `event` is a valid epoll_event for the duration of the
        // call; for EPOLL_CTL_DEL the kernel ignores its contents.
        let ret = unsafe { libc::epoll_ctl(self.epoll, op, fd, &mut event) };
        if ret == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn drain_wake(&self) {
        let mut counter: u64 = 0;
        // SAFETY: reads 8 bytes into a stack value from the eventfd.
        unsafe {
            let _ = libc::read(
                self.wake_fd,
                std::ptr::addr_of_mut!(counter).cast::<libc::c_void>(),
                std::mem::size_of::<u64>(),
            );
        }
    }
}

impl Drop for Notifier {
    fn drop(&mut self) {
        // SAFETY: both descriptors are owned by this notifier.
        unsafe {
            let _ = libc::close(self.wake_fd);
            let _ = libc::close(self.epoll);
        }
    }
}

const fn interest(oneshot: bool) -> u32 {
    let base = (libc::EPOLLIN | libc::EPOLLERR) as u32;
    if oneshot {
        base | libc::EPOLLONESHOT as u32
    } else {
        base
    }
}

/// Reusable scratch space for [`Notifier::wait`].
pub struct EventBatch {
    sys: Vec<libc::epoll_event>,
    ready: Vec<SocketHandle>,
}

impl EventBatch {
    /// Creates a batch that can report up to `capacity` handles per wait.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            sys: vec![libc::epoll_event { events: 0, u64: 0 }; capacity],
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
