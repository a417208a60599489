//! Connection Actor
//!
//! One actor == one TCP connection, split into two tasks on the current
//! compio runtime:
//! - Read pump: kernel -> owner, as `ConnEvent::Received`
//! - Write pump: owner -> kernel, one `WriteCmd::Send` at a time, each
//!   acknowledged with `ConnEvent::Written`
//!
//! The actor never interprets bytes. Framing, sequence numbers and
//! negotiation live in the sans-IO layer above it, driven by whoever owns
//! the event receiver. All connections of one owner share one event channel
//! and are told apart by their `ConnId`.

use crate::error::{BksError, Result};
use crate::tcp::shutdown_stream;

use bytes::Bytes;
use compio::buf::BufResult;
use compio::io::{AsyncRead, AsyncWriteExt};
use compio::net::TcpStream;
use flume::{Receiver, Sender};
use std::rc::Rc;
use tracing::{debug, trace};

/// Owner-assigned connection identifier
pub type ConnId = u64;

/// Commands from the owner to the write pump
#[derive(Debug)]
pub enum WriteCmd {
    /// Write all bytes, then report `ConnEvent::Written`
    Send(Bytes),
    /// Shut the socket down; the read pump reports `ConnEvent::Closed`
    Close,
}

/// Events from a connection to its owner
#[derive(Debug, Clone)]
pub enum ConnEvent {
    /// Bytes received from the peer
    Received { conn: ConnId, bytes: Bytes },
    /// A `WriteCmd::Send` completed
    Written { conn: ConnId },
    /// Peer closed, I/O failed or the owner closed the connection
    Closed { conn: ConnId },
}

impl ConnEvent {
    #[must_use]
    pub const fn conn(&self) -> ConnId {
        match self {
            Self::Received { conn, .. } | Self::Written { conn } | Self::Closed { conn } => *conn,
        }
    }
}

/// Owner-side handle to a running connection.
///
/// Dropping the handle closes the connection.
#[derive(Debug)]
pub struct ConnHandle {
    conn: ConnId,
    cmd_tx: Sender<WriteCmd>,
}

impl ConnHandle {
    #[must_use]
    pub const fn id(&self) -> ConnId {
        self.conn
    }

    /// Queue bytes for the write pump.
    ///
    /// # Errors
    ///
    /// `BksError::ConnectionClosed` when the write pump has already exited.
    pub fn send(&self, bytes: Bytes) -> Result<()> {
        self.cmd_tx
            .send(WriteCmd::Send(bytes))
            .map_err(|_| BksError::ConnectionClosed)
    }

    /// Ask the write pump to shut the socket down after pending writes.
    pub fn close(&self) {
        let _ = self.cmd_tx.send(WriteCmd::Close);
    }
}

/// Start the read and write pumps for `stream` on the current runtime.
///
/// Must be called from within a compio runtime.
pub fn spawn_connection(
    stream: TcpStream,
    conn: ConnId,
    read_buffer_size: usize,
    events: Sender<ConnEvent>,
) -> ConnHandle {
    let (cmd_tx, cmd_rx) = flume::unbounded();
    let stream = Rc::new(stream);

    compio::runtime::spawn(read_pump(
        Rc::clone(&stream),
        conn,
        read_buffer_size,
        events.clone(),
    ))
    .detach();
    compio::runtime::spawn(write_pump(stream, conn, cmd_rx, events)).detach();

    ConnHandle { conn, cmd_tx }
}

async fn read_pump(
    stream: Rc<TcpStream>,
    conn: ConnId,
    read_buffer_size: usize,
    events: Sender<ConnEvent>,
) {
    let mut reader = &*stream;
    loop {
        let buf = Vec::with_capacity(read_buffer_size);
        let BufResult(res, buf) = reader.read(buf).await;
        match res {
            Ok(0) => {
                debug!("[CONN {}] EOF", conn);
                break;
            }
            Ok(n) => {
                trace!("[CONN {}] Read {} bytes", conn, n);
                if events
                    .send(ConnEvent::Received {
                        conn,
                        bytes: Bytes::from(buf),
                    })
                    .is_err()
                {
                    return;
                }
            }
            Err(e) => {
                debug!("[CONN {}] Read error: {}", conn, e);
                break;
            }
        }
    }
    let _ = events.send(ConnEvent::Closed { conn });
}

async fn write_pump(
    stream: Rc<TcpStream>,
    conn: ConnId,
    cmd_rx: Receiver<WriteCmd>,
    events: Sender<ConnEvent>,
) {
    let mut writer = &*stream;
    loop {
        match cmd_rx.recv_async().await {
            Ok(WriteCmd::Send(bytes)) => {
                trace!("[CONN {}] Writing {} bytes", conn, bytes.len());
                let BufResult(res, _) = writer.write_all(bytes.to_vec()).await;
                if let Err(e) = res {
                    debug!("[CONN {}] Write error: {}", conn, e);
                    let _ = shutdown_stream(&stream);
                    let _ = events.send(ConnEvent::Closed { conn });
                    return;
                }
                if events.send(ConnEvent::Written { conn }).is_err() {
                    break;
                }
            }
            // Owner closed or dropped the handle.
            Ok(WriteCmd::Close) | Err(_) => break,
        }
    }
    debug!("[CONN {}] Closing", conn);
    let _ = shutdown_stream(&stream);
}
