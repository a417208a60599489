//! TCP utilities.
//!
//! # Safety
//!
//! This module uses unsafe code to borrow the raw file descriptor/socket of
//! a compio stream as a `socket2::Socket`. The borrowed socket is always
//! forgotten so the descriptor stays owned by the stream.

#![allow(unsafe_code)]

use std::io;
use std::net::Shutdown;

fn with_socket<R>(
    stream: &compio::net::TcpStream,
    f: impl FnOnce(&socket2::Socket) -> io::Result<R>,
) -> io::Result<R> {
    #[cfg(unix)]
    {
        use std::os::unix::io::{AsRawFd, FromRawFd};
        let fd = stream.as_raw_fd();
        let sock = unsafe { socket2::Socket::from_raw_fd(fd) };
        let res = f(&sock);
        std::mem::forget(sock); // Don't close the fd
        res
    }

    #[cfg(windows)]
    {
        use std::os::windows::io::{AsRawSocket, FromRawSocket};
        let raw = stream.as_raw_socket();
        let sock = unsafe { socket2::Socket::from_raw_socket(raw) };
        let res = f(&sock);
        std::mem::forget(sock); // Don't close the socket
        res
    }

    #[cfg(not(any(unix, windows)))]
    {
        let _ = (stream, f);
        Err(io::Error::from(io::ErrorKind::Unsupported))
    }
}

/// Enable TCP_NODELAY on a compio TcpStream.
///
/// Job requests are latency bound (a worker sits idle until the next request
/// arrives), so Nagle's algorithm is disabled on every session.
///
/// # Errors
///
/// Returns an error if the socket option cannot be set.
#[inline]
pub fn enable_tcp_nodelay(stream: &compio::net::TcpStream) -> io::Result<()> {
    with_socket(stream, |sock| sock.set_nodelay(true))
}

/// Shut down both directions of a stream.
///
/// Any read pending on another task completes with EOF, which is how the
/// reader half of a connection learns that the owner closed it.
///
/// # Errors
///
/// Returns an error if the socket is already disconnected.
pub fn shutdown_stream(stream: &compio::net::TcpStream) -> io::Result<()> {
    with_socket(stream, |sock| sock.shutdown(Shutdown::Both))
}
