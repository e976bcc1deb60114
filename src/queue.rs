//! Ready-socket queue.
//!
//! The hand-off buffer between the reactor and the worker pool: a FIFO of
//! socket handles the reactor has observed as readable but whose bytes have
//! not been consumed yet. Duplicates are permitted across arm cycles; while
//! a handle is armed one-shot the kernel guarantees it appears at most
//! once.

use crate::socket::SocketHandle;
use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

const INITIAL_CAPACITY: usize = 64;

struct State {
    items: VecDeque<SocketHandle>,
    closed: bool,
}

/// FIFO of readable-but-unserviced socket handles.
///
/// `push` never blocks; `pop` blocks until an item arrives or the queue is
/// closed. Closing the queue is the shutdown broadcast: every blocked and
/// future `pop` returns `None` immediately, even if items remain, so that
/// no worker processes further handles after shutdown is signalled.
pub struct ReadyQueue {
    state: Mutex<State>,
    available: Condvar,
}

impl ReadyQueue {
    /// Creates an empty, open queue.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                items: VecDeque::with_capacity(INITIAL_CAPACITY),
                closed: false,
            }),
            available: Condvar::new(),
        }
    }

    /// Appends a handle and signals one waiting worker.
    ///
    /// Pushes onto a closed queue are dropped.
    pub fn push(&self, sock: SocketHandle) {
        let mut state = self.state.lock().expect("queue lock poisoned");
        if state.closed {
            return;
        }
        state.items.push_back(sock);
        drop(state);
        self.available.notify_one();
    }

    /// Removes and returns the oldest handle, blocking while the queue is
    /// empty. Returns `None` once the queue has been closed.
    pub fn pop(&self) -> Option<SocketHandle> {
        let mut state = self.state.lock().expect("queue lock poisoned");
        loop {
            if state.closed {
                return None;
            }
            if let Some(sock) = state.items.pop_front() {
                return Some(sock);
            }
            state = self
                .available
                .wait(state)
                .expect("queue lock poisoned");
        }
    }

    /// Closes the queue and wakes every blocked `pop`.
    pub fn close(&self) {
        let mut state = self.state.lock().expect("queue lock poisoned");
        state.closed = true;
        drop(state);
        self.available.notify_all();
    }

    /// Number of queued handles.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().expect("queue lock poisoned").items.len()
    }

    /// True if no handles are queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ReadyQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ReadyQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock().expect("queue lock poisoned");
        f.debug_struct("ReadyQueue")
            .field("len", &state.items.len())
            .field("closed", &state.closed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn sock(raw: i32) -> SocketHandle {
        SocketHandle::from_raw(raw as _)
    }

    #[test]
    fn fifo_order() {
        let queue = ReadyQueue::new();
        queue.push(sock(3));
        queue.push(sock(5));
        queue.push(sock(4));
        assert_eq!(queue.pop(), Some(sock(3)));
        assert_eq!(queue.pop(), Some(sock(5)));
        assert_eq!(queue.pop(), Some(sock(4)));
    }

    #[test]
    fn duplicates_are_kept() {
        let queue = ReadyQueue::new();
        queue.push(sock(7));
        queue.push(sock(7));
        assert_eq!(queue.pop(), Some(sock(7)));
        assert_eq!(queue.pop(), Some(sock(7)));
    }

    #[test]
    fn pop_blocks_until_push() {
        let queue = Arc::new(ReadyQueue::new());
        let producer = Arc::clone(&queue);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            producer.push(sock(9));
        });
        assert_eq!(queue.pop(), Some(sock(9)));
        handle.join().expect("producer panicked");
    }

    #[test]
    fn close_wakes_blocked_pop() {
        let queue = Arc::new(ReadyQueue::new());
        let closer = Arc::clone(&queue);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            closer.close();
        });
        assert_eq!(queue.pop(), None);
        handle.join().expect("closer panicked");
    }

    #[test]
    fn close_discards_pending_items() {
        let queue = ReadyQueue::new();
        queue.push(sock(1));
        queue.close();
        assert_eq!(queue.pop(), None);
        queue.push(sock(2));
        assert_eq!(queue.pop(), None);
    }
}
