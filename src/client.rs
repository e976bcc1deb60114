//! Outbound connection helper.
//!
//! Resolves a hostname and port (both address families), connects to the
//! first candidate that accepts, and hands the resulting socket to the
//! caller. Teardown belongs to whoever receives the [`OwnedSocket`]: the
//! descriptor closes when it is dropped.

use crate::error::ClientError;
use crate::socket::OwnedSocket;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::io;
use std::net::ToSocketAddrs;
use tracing::debug;

/// Resolves `server_address:server_port` and connects to the first
/// candidate address that accepts.
///
/// Candidates are tried in resolution order; a candidate that fails to
/// connect is logged and skipped. If resolution yields nothing the error is
/// [`ClientError::Resolve`]; if every candidate refuses, the last failure
/// is returned as [`ClientError::Connect`].
pub fn open(server_address: &str, server_port: u16) -> Result<OwnedSocket, ClientError> {
    let candidates: Vec<_> = (server_address, server_port)
        .to_socket_addrs()
        .map_err(|source| ClientError::Resolve {
            address: format!("{server_address}:{server_port}"),
            source,
        })?
        .collect();
    if candidates.is_empty() {
        return Err(ClientError::Resolve {
            address: format!("{server_address}:{server_port}"),
            source: io::Error::new(io::ErrorKind::InvalidInput, "no candidate addresses"),
        });
    }

    let mut last_err = io::Error::other("no candidate addresses");
    for addr in candidates {
        let socket = match Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        {
            Ok(socket) => socket,
            Err(err) => {
                debug!(candidate = %addr, error = %err, "unable to open socket");
                last_err = err;
                continue;
            }
        };
        match socket.connect(&SockAddr::from(addr)) {
            Ok(()) => {
                debug!(candidate = %addr, "connected");
                return Ok(OwnedSocket::from(socket));
            }
            Err(err) => {
                debug!(candidate = %addr, error = %err, "unable to connect");
                last_err = err;
            }
        }
    }

    Err(ClientError::Connect {
        address: format!("{server_address}:{server_port}"),
        source: last_err,
    })
}

/// Connects like [`open`] and invokes `process_connection` with the socket.
///
/// The callback owns teardown: the connection closes when the
/// [`OwnedSocket`] it receives is dropped.
pub fn connect<F, R>(
    server_address: &str,
    server_port: u16,
    process_connection: F,
) -> Result<R, ClientError>
where
    F: FnOnce(OwnedSocket) -> R,
{
    let socket = open(server_address, server_port)?;
    Ok(process_connection(socket))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire;
    use std::io::{Read, Write};
    use std::net::TcpListener;

    #[test]
    fn resolution_failure_is_reported() {
        let err = open("host.invalid.sockpool.test", 1).expect_err("must not resolve");
        assert!(matches!(err, ClientError::Resolve { .. }));
    }

    #[test]
    fn connects_and_callback_owns_teardown() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let port = listener.local_addr().expect("local addr").port();

        let server = std::thread::spawn(move || {
            let (mut conn, _) = listener.accept().expect("accept");
            let mut byte = [0u8; 1];
            conn.read_exact(&mut byte).expect("read");
            conn.write_all(&byte).expect("write");
            // a zero-length read observes the client-side close
            assert_eq!(conn.read(&mut byte).expect("read eof"), 0);
        });

        let echoed = connect("127.0.0.1", port, |socket| {
            wire::write_value(socket.handle(), 0x41u8).expect("send");
            wire::read_value::<u8>(socket.handle()).expect("recv")
            // socket drops here, closing the connection
        })
        .expect("connect");

        assert_eq!(echoed, 0x41);
        server.join().expect("server panicked");
    }

    #[test]
    fn refused_connection_is_a_connect_error() {
        // Bind then immediately drop to find a port with no listener.
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
            listener.local_addr().expect("local addr").port()
        };
        let err = open("127.0.0.1", port).expect_err("must be refused");
        assert!(matches!(err, ClientError::Connect { .. }));
    }
}
