//! Sockpool: a readiness-driven TCP server core on plain OS threads.
//!
//! # Overview
//!
//! Sockpool accepts many concurrent TCP connections on a single reactor
//! thread and dispatches per-connection readable events to a fixed pool of
//! worker threads, which invoke a user-supplied message handler. There is
//! no async runtime: suspension happens in the kernel (the readiness wait,
//! the queue condition variable, blocking reads inside handlers).
//!
//! # Core Guarantees
//!
//! - **Per-connection serialization**: one-shot arming means no two workers
//!   ever service the same connection concurrently, and a single peer's
//!   messages reach the handler in the order sent
//! - **Bounded shutdown**: requesting shutdown wakes the reactor out of its
//!   blocking wait, drains the worker pool, and force-closes every
//!   surviving connection
//! - **No descriptor leaks**: single-owner sockets close on drop; registry
//!   members are closed explicitly on retirement and at shutdown
//!
//! # Module Structure
//!
//! - [`socket`]: handle identity and single-owner descriptors
//! - [`notifier`]: portable readiness notification (epoll / kqueue / IOCP)
//! - [`queue`]: the reactor-to-worker FIFO hand-off
//! - [`registry`]: the live-connection set
//! - [`server`]: the reactor, the worker pool, startup and shutdown
//! - [`client`]: outbound connection establishment
//! - [`wire`]: blocking scalar byte I/O over socket handles
//! - [`error`]: startup and connection error types
//!
//! # Example
//!
//! ```no_run
//! use sockpool::{Server, ServerConfig};
//! use std::sync::Arc;
//!
//! let server = Server::bind(ServerConfig::new(0).worker_count(4))?;
//! let handle = server.handle();
//! let port = server.local_addr().port();
//!
//! let runner = std::thread::spawn(move || {
//!     server.run(Arc::new(()), |sock, _ctx| {
//!         // echo one byte back
//!         if let Ok(byte) = sockpool::wire::read_value::<u8>(sock) {
//!             let _ = sockpool::wire::write_value(sock, byte);
//!         }
//!     })
//! });
//!
//! assert!(handle.wait_ready());
//! // ... serve traffic on `port` ...
//! handle.shutdown();
//! runner.join().unwrap()?;
//! # Ok::<(), sockpool::ServerError>(())
//! ```
//!
//! The crate emits diagnostics through `tracing` and never installs a
//! subscriber; embedding applications choose their own.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_possible_wrap)]

pub mod client;
pub mod error;
pub mod notifier;
pub mod queue;
pub mod registry;
pub mod server;
pub mod socket;
pub mod wire;

pub use error::{ClientError, ServerError};
pub use notifier::{EventBatch, Notifier, EVENT_QUEUE_CAPACITY};
pub use queue::ReadyQueue;
pub use registry::ConnectionRegistry;
pub use server::{Server, ServerConfig, ServerHandle};
pub use socket::{OwnedSocket, SocketHandle};
pub use wire::Scalar;
