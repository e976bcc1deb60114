//! Connection registry.
//!
//! Tracks the set of currently live accepted connections so that shutdown
//! can force-close every one of them. The listening socket is never
//! inserted here.

use crate::socket::SocketHandle;
use std::collections::HashSet;
use std::sync::Mutex;

const INITIAL_CAPACITY: usize = 1024;

/// Mutex-guarded set of live client socket handles.
pub struct ConnectionRegistry {
    inner: Mutex<HashSet<SocketHandle>>,
}

impl ConnectionRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashSet::with_capacity(INITIAL_CAPACITY)),
        }
    }

    /// Inserts a handle; returns false if it was already present.
    pub fn add(&self, sock: SocketHandle) -> bool {
        self.inner.lock().expect("registry lock poisoned").insert(sock)
    }

    /// Removes a handle; returns false if it was not present.
    pub fn remove(&self, sock: SocketHandle) -> bool {
        self.inner.lock().expect("registry lock poisoned").remove(&sock)
    }

    /// True if the handle is currently registered.
    #[must_use]
    pub fn contains(&self, sock: SocketHandle) -> bool {
        self.inner
            .lock()
            .expect("registry lock poisoned")
            .contains(&sock)
    }

    /// Number of live connections.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().expect("registry lock poisoned").len()
    }

    /// True if no connections are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes and returns every registered handle.
    ///
    /// Used at shutdown to force-close the remaining connections.
    pub fn drain(&self) -> Vec<SocketHandle> {
        self.inner
            .lock()
            .expect("registry lock poisoned")
            .drain()
            .collect()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("len", &self.len())
            .finish()
    }
}
