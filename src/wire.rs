#![allow(unsafe_code)]

//! Scalar byte I/O over socket handles.
//!
//! Blocking helpers that move primitive values across a connected socket in
//! native byte order; framing and endianness are the caller's concern.
//! Reads use `MSG_WAITALL`, so a value either arrives whole or the call
//! fails. [`peek`] is the non-consuming one-byte read the worker pool uses
//! to distinguish orderly peer close from data availability.

use crate::socket::SocketHandle;
use std::io;

#[cfg(unix)]
mod sys {
    use super::SocketHandle;
    use std::io;

    pub const MSG_PEEK: i32 = libc::MSG_PEEK;
    pub const MSG_WAITALL: i32 = libc::MSG_WAITALL;

    #[cfg(any(target_os = "linux", target_os = "android"))]
    const SEND_FLAGS: i32 = libc::MSG_NOSIGNAL;
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    const SEND_FLAGS: i32 = 0;

    pub fn recv(sock: SocketHandle, buf: &mut [u8], flags: i32) -> io::Result<usize> {
        // SAFETY: the buffer is valid for writes of its full length.
        let n = unsafe {
            libc::recv(
                sock.raw(),
                buf.as_mut_ptr().cast::<libc::c_void>(),
                buf.len(),
                flags,
            )
        };
        if n == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }

    pub fn send(sock: SocketHandle, buf: &[u8]) -> io::Result<usize> {
        // SAFETY: the buffer is valid for reads of its full length.
        let n = unsafe {
            libc::send(
                sock.raw(),
                buf.as_ptr().cast::<libc::c_void>(),
                buf.len(),
                SEND_FLAGS,
            )
        };
        if n == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }
}

#[cfg(windows)]
mod sys {
    use super::SocketHandle;
    use std::io;
    use windows_sys::Win32::Networking::WinSock;

    pub const MSG_PEEK: i32 = WinSock::MSG_PEEK;
    pub const MSG_WAITALL: i32 = WinSock::MSG_WAITALL;

    pub fn recv(sock: SocketHandle, buf: &mut [u8], flags: i32) -> io::Result<usize> {
        // SAFETY: the buffer is valid for writes of its full length.
        let n = unsafe {
            WinSock::recv(
                sock.raw(),
                buf.as_mut_ptr(),
                buf.len().min(i32::MAX as usize) as i32,
                flags,
            )
        };
        if n == WinSock::SOCKET_ERROR {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }

    pub fn send(sock: SocketHandle, buf: &[u8]) -> io::Result<usize> {
        // SAFETY: the buffer is valid for reads of its full length.
        let n = unsafe {
            WinSock::send(
                sock.raw(),
                buf.as_ptr(),
                buf.len().min(i32::MAX as usize) as i32,
                0,
            )
        };
        if n == WinSock::SOCKET_ERROR {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }
}

mod sealed {
    pub trait Sealed {}
}

/// A primitive value that can cross the wire in native byte order.
///
/// Implemented for the integer and floating-point primitives; sealed so the
/// encoded width is always `size_of::<T>()`.
pub trait Scalar: Copy + sealed::Sealed {
    /// Encoded width in bytes.
    const SIZE: usize;

    #[doc(hidden)]
    fn put_ne(self, buf: &mut [u8]);

    #[doc(hidden)]
    fn from_ne(buf: &[u8]) -> Self;
}

macro_rules! impl_scalar {
    ($($ty:ty),* $(,)?) => {$(
        impl sealed::Sealed for $ty {}

        impl Scalar for $ty {
            const SIZE: usize = std::mem::size_of::<$ty>();

            fn put_ne(self, buf: &mut [u8]) {
                buf[..Self::SIZE].copy_from_slice(&self.to_ne_bytes());
            }

            fn from_ne(buf: &[u8]) -> Self {
                let mut bytes = [0u8; std::mem::size_of::<$ty>()];
                bytes.copy_from_slice(&buf[..Self::SIZE]);
                Self::from_ne_bytes(bytes)
            }
        }
    )*};
}

impl_scalar!(u8, i8, u16, i16, u32, i32, u64, i64, u128, i128, usize, isize, f32, f64);

/// Largest scalar width, for stack scratch buffers.
const MAX_SCALAR: usize = 16;

/// Reads one `T` from the socket.
///
/// Blocks until `size_of::<T>()` bytes have arrived; a peer close mid-value
/// surfaces as [`io::ErrorKind::UnexpectedEof`].
pub fn read_value<T: Scalar>(sock: SocketHandle) -> io::Result<T> {
    let mut buf = [0u8; MAX_SCALAR];
    recv_exact(sock, &mut buf[..T::SIZE])?;
    Ok(T::from_ne(&buf[..T::SIZE]))
}

/// Writes one `T` to the socket.
pub fn write_value<T: Scalar>(sock: SocketHandle, value: T) -> io::Result<()> {
    let mut buf = [0u8; MAX_SCALAR];
    value.put_ne(&mut buf[..T::SIZE]);
    send_all(sock, &buf[..T::SIZE])
}

/// Fills `out` with values read from the socket.
pub fn read_slice<T: Scalar>(sock: SocketHandle, out: &mut [T]) -> io::Result<()> {
    let mut bytes = vec![0u8; out.len() * T::SIZE];
    recv_exact(sock, &mut bytes)?;
    for (value, chunk) in out.iter_mut().zip(bytes.chunks_exact(T::SIZE)) {
        *value = T::from_ne(chunk);
    }
    Ok(())
}

/// Writes every value in `values` to the socket.
pub fn write_slice<T: Scalar>(sock: SocketHandle, values: &[T]) -> io::Result<()> {
    let mut bytes = vec![0u8; values.len() * T::SIZE];
    for (value, chunk) in values.iter().zip(bytes.chunks_exact_mut(T::SIZE)) {
        value.put_ne(chunk);
    }
    send_all(sock, &bytes)
}

/// Peeks one byte without consuming it.
///
/// Returns `Ok(0)` when the peer has performed an orderly shutdown and
/// `Ok(1)` when data is waiting. Blocks if the socket is neither readable
/// nor closed.
pub fn peek(sock: SocketHandle) -> io::Result<usize> {
    let mut byte = [0u8; 1];
    sys::recv(sock, &mut byte, sys::MSG_PEEK)
}

fn recv_exact(sock: SocketHandle, buf: &mut [u8]) -> io::Result<()> {
    let mut filled = 0;
    while filled < buf.len() {
        match sys::recv(sock, &mut buf[filled..], sys::MSG_WAITALL) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "peer closed mid-value",
                ))
            }
            Ok(n) => filled += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

fn send_all(sock: SocketHandle, buf: &[u8]) -> io::Result<()> {
    let mut sent = 0;
    while sent < buf.len() {
        match sys::send(sock, &buf[sent..]) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "socket accepted no bytes",
                ))
            }
            Ok(n) => sent += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{TcpListener, TcpStream};
    use std::thread;

    fn handle_of(stream: &TcpStream) -> SocketHandle {
        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;
            SocketHandle::from_raw(stream.as_raw_fd())
        }
        #[cfg(windows)]
        {
            use std::os::windows::io::AsRawSocket;
            SocketHandle::from_raw(stream.as_raw_socket() as _)
        }
    }

    fn loopback_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let client = TcpStream::connect(addr).expect("connect");
        let (server, _) = listener.accept().expect("accept");
        (client, server)
    }

    #[test]
    fn scalar_round_trip() {
        let (client, server) = loopback_pair();
        let tx = handle_of(&client);
        let rx = handle_of(&server);

        write_value(tx, 0x41u8).expect("write u8");
        write_value(tx, -1234i32).expect("write i32");
        write_value(tx, u64::MAX - 7).expect("write u64");
        write_value(tx, 2.5f64).expect("write f64");

        assert_eq!(read_value::<u8>(rx).expect("read u8"), 0x41);
        assert_eq!(read_value::<i32>(rx).expect("read i32"), -1234);
        assert_eq!(read_value::<u64>(rx).expect("read u64"), u64::MAX - 7);
        assert!((read_value::<f64>(rx).expect("read f64") - 2.5).abs() < f64::EPSILON);
    }

    #[test]
    fn slice_round_trip() {
        let (client, server) = loopback_pair();
        let sent: Vec<u32> = (0..256).collect();
        write_slice(handle_of(&client), &sent).expect("write slice");

        let mut received = vec![0u32; sent.len()];
        read_slice(handle_of(&server), &mut received).expect("read slice");
        assert_eq!(received, sent);
    }

    #[test]
    fn waitall_reassembles_split_writes() {
        let (client, server) = loopback_pair();
        let rx = handle_of(&server);

        let writer = thread::spawn(move || {
            use std::io::Write;
            let mut client = client;
            let bytes = 0xDEAD_BEEF_u32.to_ne_bytes();
            for byte in bytes {
                client.write_all(&[byte]).expect("write byte");
                client.flush().expect("flush");
                thread::sleep(std::time::Duration::from_millis(5));
            }
            client
        });

        assert_eq!(read_value::<u32>(rx).expect("read u32"), 0xDEAD_BEEF);
        drop(writer.join().expect("writer panicked"));
    }

    #[test]
    fn peek_does_not_consume() {
        let (client, server) = loopback_pair();
        write_value(handle_of(&client), 0x5Au8).expect("write");

        let rx = handle_of(&server);
        assert_eq!(peek(rx).expect("peek"), 1);
        assert_eq!(peek(rx).expect("peek again"), 1);
        assert_eq!(read_value::<u8>(rx).expect("read"), 0x5A);
    }

    #[test]
    fn peek_reports_orderly_close_as_zero() {
        let (client, server) = loopback_pair();
        drop(client);
        assert_eq!(peek(handle_of(&server)).expect("peek"), 0);
    }

    #[test]
    fn eof_mid_value_is_an_error() {
        let (client, server) = loopback_pair();
        {
            use std::io::Write;
            let mut client = client;
            client.write_all(&[1, 2]).expect("write partial");
            // dropped here: only two of four bytes ever arrive
        }
        let err = read_value::<u32>(handle_of(&server)).expect_err("must fail");
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }
}
