//! Timeout utilities for connection setup

use compio::net::TcpStream;
use compio::time::timeout;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

/// Connect a TCP stream, giving up after `duration`.
///
/// * `duration` - `None` waits as long as the OS does.
///
/// # Errors
///
/// Connection errors, or `io::ErrorKind::TimedOut`.
pub async fn connect_with_timeout(
    addr: SocketAddr,
    duration: Option<Duration>,
) -> io::Result<TcpStream> {
    match duration {
        None => TcpStream::connect(addr).await,
        Some(d) => timeout(d, TcpStream::connect(addr)).await.map_err(|_elapsed| {
            io::Error::new(io::ErrorKind::TimedOut, "Connect operation timed out")
        })?,
    }
}
