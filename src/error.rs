//! Error types for server startup and client connection establishment.
//!
//! Runtime partial failures (a failed accept, a failed re-arm) are logged
//! and absorbed by the reactor and workers; only startup and connection
//! establishment surface typed errors to the caller.

use std::io;
use thiserror::Error;

/// Reasons the server failed to start.
///
/// Each variant corresponds to one step of the startup sequence; once the
/// server is running, partial failures never tear it down.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Opening the listening socket failed.
    #[error("unable to open listening socket: {0}")]
    Socket(#[source] io::Error),

    /// Applying a socket option to the listener failed.
    #[error("unable to configure listening socket: {0}")]
    SocketOption(#[source] io::Error),

    /// Binding the listener failed.
    #[error("unable to bind to port {port}: {source}")]
    Bind {
        /// The requested TCP port.
        port: u16,
        /// The underlying bind failure.
        #[source]
        source: io::Error,
    },

    /// Entering the listening state failed.
    #[error("unable to listen: {0}")]
    Listen(#[source] io::Error),

    /// Creating the readiness notifier failed.
    #[error("unable to create readiness notifier: {0}")]
    Notifier(#[source] io::Error),

    /// Registering the listener with the notifier failed.
    #[error("unable to watch listening socket: {0}")]
    RegisterListener(#[source] io::Error),

    /// Spawning a worker thread failed.
    #[error("unable to spawn worker thread: {0}")]
    SpawnWorker(#[source] io::Error),
}

/// Reasons the client helper failed to produce a connection.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Resolving the server address produced no candidates.
    #[error("unable to resolve {address}: {source}")]
    Resolve {
        /// The address that failed to resolve.
        address: String,
        /// The underlying resolution failure.
        #[source]
        source: io::Error,
    },

    /// Every resolved candidate refused the connection.
    #[error("unable to connect to {address}: {source}")]
    Connect {
        /// The address whose candidates all refused.
        address: String,
        /// The failure from the last candidate tried.
        #[source]
        source: io::Error,
    },
}
