//! Portable readiness notification.
//!
//! This module wraps the host kernel's event-notification facility behind a
//! single [`Notifier`] type with one implementation per platform, selected
//! at compile time:
//!
//! | Platform | Backend | Module |
//! |----------|---------|--------|
//! | Linux, Android | epoll + `EPOLLONESHOT` | `epoll.rs` |
//! | macOS, iOS, BSDs | kqueue + `EV_ONESHOT` | `kqueue.rs` |
//! | Windows | I/O completion port | `iocp.rs` |
//!
//! # Contract
//!
//! Every backend exposes the same inherent methods:
//!
//! - [`Notifier::new`] allocates the kernel object.
//! - [`Notifier::add`] begins delivering readable notifications for a
//!   handle. With `oneshot`, the kernel delivers at most one event and then
//!   disarms the handle until it is re-armed.
//! - [`Notifier::rearm`] re-arms an already-registered handle after a
//!   one-shot delivery.
//! - [`Notifier::remove`] stops delivery. On backends where closing the
//!   descriptor already drops the registration this is a no-op.
//! - [`Notifier::wait`] blocks until at least one handle is ready and fills
//!   the caller's [`EventBatch`] with up to [`EVENT_QUEUE_CAPACITY`] ready
//!   handles. There is no timeout.
//! - [`Notifier::wake`] makes a concurrent blocked `wait` return. Wake
//!   deliveries are consumed internally and never appear in the batch, so a
//!   woken `wait` may legitimately report zero ready handles.
//!
//! One-shot arming is what serializes per-connection dispatch: the kernel
//! will not redeliver readiness for a handle until the worker that consumed
//! the previous event re-arms it, so no two workers ever hold the same
//! connection.
//!
//! `add`, `rearm`, `remove`, and `wake` may be called from any thread.
//! `wait` is intended for a single reactor thread; the scratch space it
//! needs lives in the caller-owned [`EventBatch`].

#[cfg(any(target_os = "linux", target_os = "android"))]
mod epoll;
#[cfg(any(target_os = "linux", target_os = "android"))]
pub use epoll::{EventBatch, Notifier};

#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "dragonfly"
))]
mod kqueue;
#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "dragonfly"
))]
pub use kqueue::{EventBatch, Notifier};

#[cfg(windows)]
mod iocp;
#[cfg(windows)]
pub use iocp::{EventBatch, Notifier};

/// Maximum number of ready handles a single [`Notifier::wait`] can report.
pub const EVENT_QUEUE_CAPACITY: usize = 1024;

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::socket::SocketHandle;
    use std::io::Write;
    use std::os::unix::io::AsRawFd;
    use std::os::unix::net::UnixStream;
    use std::time::{Duration, Instant};

    fn wake_after(notifier: &std::sync::Arc<Notifier>, delay: Duration) {
        let notifier = std::sync::Arc::clone(notifier);
        std::thread::spawn(move || {
            std::thread::sleep(delay);
            notifier.wake().expect("wake failed");
        });
    }

    #[test]
    fn readable_handle_is_reported() {
        let notifier = Notifier::new().expect("create notifier");
        let (mut writer, reader) = UnixStream::pair().expect("socketpair");
        let handle = SocketHandle::from_raw(reader.as_raw_fd());

        notifier.add(handle, true).expect("add failed");
        writer.write_all(&[0x41]).expect("write failed");

        let mut batch = EventBatch::default();
        let n = notifier.wait(&mut batch).expect("wait failed");
        assert_eq!(n, 1);
        assert_eq!(batch.iter().next().copied(), Some(handle));
    }

    #[test]
    fn oneshot_does_not_redeliver_until_rearmed() {
        let notifier = std::sync::Arc::new(Notifier::new().expect("create notifier"));
        let (mut writer, reader) = UnixStream::pair().expect("socketpair");
        let handle = SocketHandle::from_raw(reader.as_raw_fd());

        notifier.add(handle, true).expect("add failed");
        writer.write_all(&[1]).expect("write failed");

        let mut batch = EventBatch::default();
        assert_eq!(notifier.wait(&mut batch).expect("wait failed"), 1);

        // Still readable, but the one-shot registration is disarmed: only
        // the wake can end the next wait.
        writer.write_all(&[2]).expect("write failed");
        wake_after(&notifier, Duration::from_millis(50));
        assert_eq!(notifier.wait(&mut batch).expect("wait failed"), 0);

        notifier.rearm(handle, true).expect("rearm failed");
        assert_eq!(notifier.wait(&mut batch).expect("wait failed"), 1);
        assert_eq!(batch.iter().next().copied(), Some(handle));
    }

    #[test]
    fn wake_unblocks_wait() {
        let notifier = std::sync::Arc::new(Notifier::new().expect("create notifier"));
        wake_after(&notifier, Duration::from_millis(50));

        let start = Instant::now();
        let mut batch = EventBatch::default();
        let n = notifier.wait(&mut batch).expect("wait failed");
        assert_eq!(n, 0);
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn removed_handle_is_silent() {
        let notifier = std::sync::Arc::new(Notifier::new().expect("create notifier"));
        let (mut writer, reader) = UnixStream::pair().expect("socketpair");
        let handle = SocketHandle::from_raw(reader.as_raw_fd());

        notifier.add(handle, false).expect("add failed");
        notifier.remove(handle).expect("remove failed");
        drop(reader);

        writer.write_all(&[9]).ok();
        wake_after(&notifier, Duration::from_millis(50));

        let mut batch = EventBatch::default();
        assert_eq!(notifier.wait(&mut batch).expect("wait failed"), 0);
    }

    #[test]
    fn peer_close_is_reported_as_readable() {
        let notifier = Notifier::new().expect("create notifier");
        let (writer, reader) = UnixStream::pair().expect("socketpair");
        let handle = SocketHandle::from_raw(reader.as_raw_fd());

        notifier.add(handle, true).expect("add failed");
        drop(writer);

        let mut batch = EventBatch::default();
        assert_eq!(notifier.wait(&mut batch).expect("wait failed"), 1);
        assert_eq!(batch.iter().next().copied(), Some(handle));
    }

    #[test]
    fn batch_capacity_is_bounded() {
        let batch = EventBatch::default();
        assert_eq!(batch.capacity(), EVENT_QUEUE_CAPACITY);
        assert!(batch.is_empty());

        let small = EventBatch::with_capacity(4);
        assert_eq!(small.capacity(), 4);
    }
}
