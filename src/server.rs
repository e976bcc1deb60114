//! Reactor and worker pool.
//!
//! One reactor thread owns the listening socket and the readiness
//! notifier; a fixed set of worker threads drains the ready queue and runs
//! the user's message handler. Dispatch is serialized per connection by
//! one-shot arming: the kernel will not report a connection ready again
//! until the worker that serviced it re-arms it, so a handler always has
//! exclusive access to its socket.
//!
//! # Lifecycle
//!
//! [`Server::bind`] performs every fallible startup step (socket, options,
//! bind, listen, notifier, listener registration) and fails fast.
//! [`Server::run`] spawns the workers, signals readiness through the
//! [`ServerHandle`], and turns the calling thread into the reactor until
//! [`ServerHandle::shutdown`] is observed. Shutdown closes the ready queue,
//! joins every worker, then force-closes the surviving connections.
//!
//! # Handler contract
//!
//! `process_message(sock, context)` runs on a worker thread with exclusive
//! access to `sock` for the duration of the call. It must consume the bytes
//! it expects (an unread socket re-arms straight back to readable and spins
//! the pool), must not close `sock`, and may block; blocking occupies one
//! worker slot.

use crate::error::ServerError;
use crate::notifier::{EventBatch, Notifier};
use crate::queue::ReadyQueue;
use crate::registry::ConnectionRegistry;
use crate::socket::{OwnedSocket, SocketHandle};
use crate::wire;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::fmt;
use std::io;
use std::net::{Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use tracing::{debug, error, info, trace};

const DEFAULT_BACKLOG: u32 = 128;

/// Server parameters.
///
/// Defaults: OS-assigned port, backlog of 128, one worker per CPU.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    port: u16,
    backlog: u32,
    worker_count: usize,
}

impl ServerConfig {
    /// Creates a configuration listening on `port` (0 = OS-assigned).
    #[must_use]
    pub fn new(port: u16) -> Self {
        Self {
            port,
            backlog: DEFAULT_BACKLOG,
            worker_count: num_cpus::get().max(1),
        }
    }

    /// Sets the `listen` backlog (pending-connection queue capacity).
    #[must_use]
    pub fn backlog(mut self, backlog: u32) -> Self {
        self.backlog = backlog;
        self
    }

    /// Sets the number of worker threads (clamped to at least one).
    #[must_use]
    pub fn worker_count(mut self, worker_count: usize) -> Self {
        self.worker_count = worker_count;
        self
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new(0)
    }
}

enum StartupState {
    Pending,
    Ready,
    Failed,
}

/// Latch the controller blocks on until the server is live (or dead).
struct StartupSignal {
    state: Mutex<StartupState>,
    cv: Condvar,
}

impl StartupSignal {
    fn new() -> Self {
        Self {
            state: Mutex::new(StartupState::Pending),
            cv: Condvar::new(),
        }
    }

    fn signal(&self, ready: bool) {
        let mut state = self.state.lock().expect("startup lock poisoned");
        *state = if ready {
            StartupState::Ready
        } else {
            StartupState::Failed
        };
        drop(state);
        self.cv.notify_all();
    }

    fn wait(&self) -> bool {
        let mut state = self.state.lock().expect("startup lock poisoned");
        loop {
            match *state {
                StartupState::Pending => {
                    state = self.cv.wait(state).expect("startup lock poisoned");
                }
                StartupState::Ready => return true,
                StartupState::Failed => return false,
            }
        }
    }
}

/// State shared by the reactor, the workers, and every [`ServerHandle`].
struct Shared {
    running: AtomicBool,
    notifier: Notifier,
    queue: ReadyQueue,
    registry: ConnectionRegistry,
    startup: StartupSignal,
    local_addr: SocketAddr,
}

/// A bound TCP server that has not started serving yet.
///
/// Created by [`Server::bind`]; consumed by [`Server::run`].
pub struct Server {
    shared: Arc<Shared>,
    listener: Socket,
    worker_count: usize,
}

impl Server {
    /// Opens, configures, binds, and registers the listening socket.
    ///
    /// The listener is a dual-stack IPv6 socket bound to `[::]:port`
    /// (v4-mapped peers are accepted where the platform permits), with
    /// `SO_REUSEADDR` applied and the backlog from the configuration.
    pub fn bind(config: ServerConfig) -> Result<Self, ServerError> {
        let listener = Socket::new(Domain::IPV6, Type::STREAM, Some(Protocol::TCP))
            .map_err(ServerError::Socket)?;

        // Dual-stack operation is the default on most platforms; clearing
        // IPV6_V6ONLY is best effort where a system policy forbids it.
        if let Err(err) = listener.set_only_v6(false) {
            debug!(error = %err, "unable to clear IPV6_V6ONLY");
        }
        listener
            .set_reuse_address(true)
            .map_err(ServerError::SocketOption)?;

        let requested = SocketAddr::from((Ipv6Addr::UNSPECIFIED, config.port));
        listener
            .bind(&SockAddr::from(requested))
            .map_err(|source| ServerError::Bind {
                port: config.port,
                source,
            })?;
        let backlog = i32::try_from(config.backlog).unwrap_or(i32::MAX);
        listener.listen(backlog).map_err(ServerError::Listen)?;
        listener
            .set_nonblocking(true)
            .map_err(ServerError::SocketOption)?;

        let local_addr = listener
            .local_addr()
            .map_err(ServerError::Socket)?
            .as_socket()
            .ok_or_else(|| ServerError::Socket(io::Error::other("listener has no inet address")))?;

        let notifier = Notifier::new().map_err(ServerError::Notifier)?;
        notifier
            .add(listener_handle(&listener), false)
            .map_err(ServerError::RegisterListener)?;

        info!(%local_addr, "server listening");
        Ok(Self {
            shared: Arc::new(Shared {
                running: AtomicBool::new(true),
                notifier,
                queue: ReadyQueue::new(),
                registry: ConnectionRegistry::new(),
                startup: StartupSignal::new(),
                local_addr,
            }),
            listener,
            worker_count: config.worker_count.max(1),
        })
    }

    /// The address the listener is bound to.
    ///
    /// With port 0 in the configuration this reports the OS-assigned port.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.shared.local_addr
    }

    /// Returns a cloneable handle for controlling and observing the server.
    #[must_use]
    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Spawns the worker pool and runs the reactor on the calling thread.
    ///
    /// Blocks until [`ServerHandle::shutdown`] is observed, then joins the
    /// workers and force-closes every remaining connection. The handler
    /// receives the readable socket and a shared reference to `context`.
    pub fn run<C, F>(self, context: Arc<C>, process_message: F) -> Result<(), ServerError>
    where
        C: Send + Sync + 'static,
        F: Fn(SocketHandle, &C) + Send + Sync + 'static,
    {
        let process_message = Arc::new(process_message);
        let mut workers = Vec::with_capacity(self.worker_count);
        for index in 0..self.worker_count {
            let shared = Arc::clone(&self.shared);
            let context = Arc::clone(&context);
            let handler = Arc::clone(&process_message);
            let spawned = thread::Builder::new()
                .name(format!("sockpool-worker-{index}"))
                .spawn(move || worker_loop(&shared, handler.as_ref(), context.as_ref()));
            match spawned {
                Ok(worker) => workers.push(worker),
                Err(err) => {
                    error!(error = %err, "unable to spawn worker thread");
                    self.shared.running.store(false, Ordering::Release);
                    self.shared.queue.close();
                    join_workers(workers);
                    self.shared.startup.signal(false);
                    return Err(ServerError::SpawnWorker(err));
                }
            }
        }

        self.shared.startup.signal(true);
        debug!(workers = self.worker_count, "worker pool started");

        self.reactor_loop();

        self.shared.running.store(false, Ordering::Release);
        self.shared.queue.close();
        join_workers(workers);
        for sock in self.shared.registry.drain() {
            sock.shutdown_both();
            sock.close();
        }
        info!("server stopped");
        Ok(())
    }

    fn reactor_loop(&self) {
        let listener = listener_handle(&self.listener);
        let mut batch = EventBatch::default();
        while self.shared.running.load(Ordering::Acquire) {
            if self.shared.notifier.wait(&mut batch).is_err() {
                // Already logged by the notifier. A wait that cannot be
                // retried leaves the reactor blind; stop serving rather
                // than spin on the error.
                break;
            }
            for &sock in &batch {
                if sock == listener {
                    self.accept_one();
                } else {
                    trace!(socket = %sock, "connection readable");
                    self.shared.queue.push(sock);
                }
            }
        }
    }

    /// Accepts a single pending connection and registers it one-shot.
    ///
    /// The listener is level-triggered, so further pending connections
    /// re-report readiness on the next wait.
    fn accept_one(&self) {
        match self.listener.accept() {
            Ok((conn, peer)) => {
                // Accepted sockets must block: workers rely on MSG_WAITALL
                // reads, and some platforms inherit the listener's
                // non-blocking mode.
                if let Err(err) = conn.set_nonblocking(false) {
                    debug!(error = %err, "unable to make connection blocking");
                }
                let conn = OwnedSocket::from(conn);
                let handle = conn.handle();
                match self.shared.notifier.add(handle, true) {
                    Ok(()) => {
                        self.shared.registry.add(conn.into_handle());
                        debug!(socket = %handle, peer = ?peer.as_socket(), "connection accepted");
                    }
                    Err(_) => {
                        // Logged by the notifier; dropping `conn` closes it.
                        handle.shutdown_both();
                    }
                }
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
            Err(err) => error!(error = %err, "unable to accept connection"),
        }
    }
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("local_addr", &self.shared.local_addr)
            .field("worker_count", &self.worker_count)
            .finish_non_exhaustive()
    }
}

/// Cloneable control and observation handle for a running [`Server`].
#[derive(Clone)]
pub struct ServerHandle {
    shared: Arc<Shared>,
}

impl ServerHandle {
    /// Requests shutdown: clears the run flag, closes the ready queue, and
    /// wakes the reactor out of its blocking wait. Idempotent.
    pub fn shutdown(&self) {
        if self.shared.running.swap(false, Ordering::AcqRel) {
            debug!("shutdown requested");
            self.shared.queue.close();
            if let Err(err) = self.shared.notifier.wake() {
                error!(error = %err, "unable to wake reactor for shutdown");
            }
        }
    }

    /// True until shutdown has been requested or startup has failed.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Blocks until startup completes; returns whether the server came up.
    pub fn wait_ready(&self) -> bool {
        self.shared.startup.wait()
    }

    /// The address the listener is bound to.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.shared.local_addr
    }

    /// Number of currently live accepted connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.shared.registry.len()
    }
}

impl fmt::Debug for ServerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerHandle")
            .field("local_addr", &self.shared.local_addr)
            .field("running", &self.is_running())
            .field("connections", &self.connection_count())
            .finish()
    }
}

fn listener_handle(listener: &Socket) -> SocketHandle {
    #[cfg(unix)]
    {
        use std::os::unix::io::AsRawFd;
        SocketHandle::from_raw(listener.as_raw_fd())
    }
    #[cfg(windows)]
    {
        use std::os::windows::io::AsRawSocket;
        SocketHandle::from_raw(listener.as_raw_socket() as _)
    }
}

fn join_workers(workers: Vec<thread::JoinHandle<()>>) {
    for worker in workers {
        if worker.join().is_err() {
            error!("worker thread panicked");
        }
    }
}

/// Drains the ready queue until shutdown.
///
/// For each popped handle, a one-byte peek decides between the orderly
/// close path and the handler path; the handler path re-arms the socket
/// afterwards so the kernel may report it again.
fn worker_loop<C, F>(shared: &Shared, process_message: &F, context: &C)
where
    F: Fn(SocketHandle, &C),
{
    while shared.running.load(Ordering::Acquire) {
        let Some(sock) = shared.queue.pop() else {
            break;
        };
        match wire::peek(sock) {
            Ok(0) => {
                // Orderly shutdown by the peer: normal end of connection.
                trace!(socket = %sock, "peer closed");
                retire(shared, sock);
            }
            Ok(_) => {
                process_message(sock, context);
                if shared.notifier.rearm(sock, true).is_err() {
                    // Logged by the notifier; without a re-arm the
                    // connection can never be serviced again.
                    retire(shared, sock);
                }
            }
            Err(err)
                if err.kind() == io::ErrorKind::WouldBlock
                    || err.kind() == io::ErrorKind::Interrupted =>
            {
                // Spurious readiness: arm again without invoking the
                // handler.
                if shared.notifier.rearm(sock, true).is_err() {
                    retire(shared, sock);
                }
            }
            Err(err) => {
                debug!(socket = %sock, error = %err, "connection failed");
                retire(shared, sock);
            }
        }
    }
}

/// Fully retires a connection: unregisters, forgets, shuts down, closes.
fn retire(shared: &Shared, sock: SocketHandle) {
    let _ = shared.notifier.remove(sock);
    shared.registry.remove(sock);
    sock.shutdown_both();
    sock.close();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn config_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.port, 0);
        assert_eq!(config.backlog, DEFAULT_BACKLOG);
        assert!(config.worker_count >= 1);

        let config = ServerConfig::new(8080).backlog(8).worker_count(2);
        assert_eq!(config.port, 8080);
        assert_eq!(config.backlog, 8);
        assert_eq!(config.worker_count, 2);
    }

    #[test]
    fn bind_assigns_a_port() {
        let server = Server::bind(ServerConfig::default()).expect("bind");
        assert_ne!(server.local_addr().port(), 0);
    }

    #[test]
    fn bind_conflict_is_a_startup_failure() {
        let first = Server::bind(ServerConfig::default()).expect("bind");
        let port = first.local_addr().port();
        let err = Server::bind(ServerConfig::new(port)).expect_err("second bind must fail");
        assert!(matches!(err, ServerError::Bind { .. }));
    }

    #[test]
    fn startup_signal_latches() {
        let signal = StartupSignal::new();
        signal.signal(true);
        assert!(signal.wait());
        assert!(signal.wait());

        let signal = StartupSignal::new();
        signal.signal(false);
        assert!(!signal.wait());
    }

    #[test]
    fn run_and_shutdown_round_trip() {
        let server = Server::bind(ServerConfig::default().worker_count(2)).expect("bind");
        let handle = server.handle();
        let runner =
            std::thread::spawn(move || server.run(Arc::new(()), |_sock, _ctx| {}).expect("run"));

        assert!(handle.wait_ready());
        assert!(handle.is_running());
        assert_eq!(handle.connection_count(), 0);

        handle.shutdown();
        handle.shutdown(); // idempotent
        runner.join().expect("runner panicked");
        assert!(!handle.is_running());
    }

    #[test]
    fn shutdown_before_run_exits_promptly() {
        let server = Server::bind(ServerConfig::default().worker_count(1)).expect("bind");
        let handle = server.handle();
        handle.shutdown();

        let runner =
            std::thread::spawn(move || server.run(Arc::new(()), |_sock, _ctx| {}).expect("run"));
        // Bounded: the reactor must observe the cleared flag immediately.
        let start = std::time::Instant::now();
        runner.join().expect("runner panicked");
        assert!(start.elapsed() < Duration::from_secs(5));
    }
}
