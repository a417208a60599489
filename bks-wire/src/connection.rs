use crate::codec::{
    decode_frame_header, encode_frame, next_seq, prev_seq, Frame, FrameError, FrameType,
    HeaderStatus, Result, HEADER_LEN, MAX_SEQ,
};
use crate::limits::MAX_FRAMES_AHEAD;
use bks_core::buffer::RecvBuffer;
use bytes::{Bytes, BytesMut};
use std::time::{Duration, Instant};

/// Receive side of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvState {
    Idle,
    ReceivingHeader,
    ReceivingPayload,
    FrameReady,
    Errored,
}

/// Send side of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    Idle,
    /// Bytes handed to the writer, completion not yet reported
    Sending,
    /// Last write completed
    Sent,
}

/// Sans-IO framing state of one peer connection.
///
/// Bytes read from the socket go in through [`on_bytes`](Self::on_bytes);
/// complete frames come out of [`poll_frame`](Self::poll_frame). Outgoing
/// frames are appended to a send buffer and handed to the writer in one
/// piece by [`take_outbound`](Self::take_outbound), with at most one write
/// in flight.
///
/// Sequence numbers run 1..=127 and wrap to 1. Every outgoing frame carries
/// the last sequence received from the peer, which is how both sides learn
/// how far the other has read. Keepalives reuse the previous sequence number
/// and are consumed internally.
#[derive(Debug)]
pub struct FrameConnection {
    session_id: u32,
    /// Our next outgoing sequence number
    tx_seq: u8,
    /// Last sequence number received from the peer (0 = none)
    peer_tx_seq: u8,
    /// Last of our sequence numbers the peer reported (0 = none)
    peer_acked: u8,
    recv: RecvBuffer,
    recv_state: RecvState,
    send: BytesMut,
    tx_state: TxState,
    max_frame_len: usize,
    last_rx: Instant,
    last_tx: Instant,
    ack_requested: bool,
}

impl FrameConnection {
    #[must_use]
    pub fn new(session_id: u32, max_frame_len: usize, now: Instant) -> Self {
        Self {
            session_id,
            tx_seq: 1,
            peer_tx_seq: 0,
            peer_acked: 0,
            recv: RecvBuffer::new(),
            recv_state: RecvState::Idle,
            send: BytesMut::new(),
            tx_state: TxState::Idle,
            max_frame_len: max_frame_len.max(HEADER_LEN),
            last_rx: now,
            last_tx: now,
            ack_requested: false,
        }
    }

    #[inline]
    #[must_use]
    pub const fn session_id(&self) -> u32 {
        self.session_id
    }

    /// Adopt the session id assigned by the coordinator.
    pub fn set_session_id(&mut self, session_id: u32) {
        self.session_id = session_id;
    }

    /// Raise or lower the receive ceiling once limits are negotiated.
    pub fn set_max_frame_len(&mut self, max_frame_len: usize) {
        self.max_frame_len = max_frame_len.max(HEADER_LEN);
    }

    #[inline]
    #[must_use]
    pub const fn recv_state(&self) -> RecvState {
        self.recv_state
    }

    #[inline]
    #[must_use]
    pub const fn tx_state(&self) -> TxState {
        self.tx_state
    }

    #[inline]
    #[must_use]
    pub const fn is_errored(&self) -> bool {
        matches!(self.recv_state, RecvState::Errored)
    }

    #[inline]
    #[must_use]
    pub const fn last_rx(&self) -> Instant {
        self.last_rx
    }

    /// Feed bytes read from the socket.
    pub fn on_bytes(&mut self, bytes: Bytes) {
        if self.is_errored() {
            return;
        }
        self.recv.push(bytes);
        if self.recv_state == RecvState::Idle {
            self.recv_state = RecvState::ReceivingHeader;
        }
    }

    /// Take the next complete frame.
    ///
    /// Returns `Ok(None)` when more bytes are needed. Keepalives update
    /// liveness and acknowledgement state and are never returned.
    ///
    /// # Errors
    ///
    /// Any framing error; the connection stays errored afterwards and every
    /// later call returns `FrameError::Errored`.
    pub fn poll_frame(&mut self, now: Instant) -> Result<Option<Frame>> {
        loop {
            if self.is_errored() {
                return Err(FrameError::Errored);
            }
            let Some(raw) = self.recv.peek_array::<HEADER_LEN>() else {
                self.recv_state = if self.recv.is_empty() {
                    RecvState::Idle
                } else {
                    RecvState::ReceivingHeader
                };
                return Ok(None);
            };

            let status =
                match decode_frame_header(&raw, self.recv.len(), self.tx_seq, self.max_frame_len) {
                    Ok(status) => status,
                    Err(e) => {
                        self.recv_state = RecvState::Errored;
                        self.recv.clear();
                        return Err(e);
                    }
                };

            match status {
                HeaderStatus::Incomplete => {
                    self.recv_state = RecvState::ReceivingPayload;
                    return Ok(None);
                }
                HeaderStatus::Keepalive(header) => {
                    self.recv.discard(HEADER_LEN);
                    self.record_peer(header.tx_seq, header.rx_seq, now);
                }
                HeaderStatus::Complete(header) => {
                    self.recv.discard(HEADER_LEN);
                    let Some(payload) = self.recv.take_bytes(header.payload_len()) else {
                        self.recv_state = RecvState::Errored;
                        return Err(FrameError::Malformed("payload vanished from buffer"));
                    };
                    self.record_peer(header.tx_seq, header.rx_seq, now);
                    self.recv_state = RecvState::FrameReady;
                    return Ok(Some(Frame { header, payload }));
                }
            }
        }
    }

    fn record_peer(&mut self, tx_seq: u8, rx_seq: u8, now: Instant) {
        self.peer_tx_seq = tx_seq;
        self.peer_acked = rx_seq;
        self.last_rx = now;
    }

    /// Append a frame to the send buffer. Returns the sequence number used.
    ///
    /// # Errors
    ///
    /// `TooLarge` when the frame length does not fit the header.
    pub fn queue_frame(&mut self, frame_type: FrameType, payload: &[u8]) -> Result<u8> {
        let seq = self.tx_seq;
        encode_frame(
            &mut self.send,
            frame_type,
            self.session_id,
            seq,
            self.peer_tx_seq,
            payload,
        )?;
        self.tx_seq = next_seq(seq);
        self.ack_requested = false;
        Ok(seq)
    }

    /// Append a keepalive. It repeats the previous sequence number.
    pub fn queue_keepalive(&mut self) {
        // An empty payload always fits.
        let _ = encode_frame(
            &mut self.send,
            FrameType::Keepalive,
            self.session_id,
            prev_seq(self.tx_seq),
            self.peer_tx_seq,
            &[],
        );
        self.ack_requested = false;
    }

    /// Ask for an acknowledgement keepalive at the next opportunity.
    pub fn request_ack(&mut self) {
        self.ack_requested = true;
    }

    /// Hand the whole send buffer to the writer unless a write is in flight.
    pub fn take_outbound(&mut self, now: Instant) -> Option<Bytes> {
        if self.tx_state == TxState::Sending || self.send.is_empty() {
            return None;
        }
        self.tx_state = TxState::Sending;
        self.last_tx = now;
        Some(self.send.split().freeze())
    }

    /// Take everything queued regardless of writes in flight (shutdown).
    pub fn drain_outbound(&mut self) -> Option<Bytes> {
        if self.send.is_empty() {
            return None;
        }
        Some(self.send.split().freeze())
    }

    /// The writer finished the last `take_outbound` buffer.
    pub fn on_write_complete(&mut self) {
        if self.tx_state == TxState::Sending {
            self.tx_state = TxState::Sent;
        }
    }

    #[inline]
    #[must_use]
    pub fn is_tx_idle(&self) -> bool {
        self.tx_state != TxState::Sending && self.send.is_empty()
    }

    /// Distance from the peer's last acknowledgement to our next sequence.
    #[must_use]
    pub fn frames_ahead(&self) -> u8 {
        let mut tx = u16::from(self.tx_seq);
        let acked = u16::from(self.peer_acked);
        if acked > tx {
            tx += u16::from(MAX_SEQ);
        }
        (tx - acked) as u8
    }

    /// How many more frames may be queued before waiting for the peer.
    #[must_use]
    pub fn send_budget(&self) -> usize {
        usize::from(MAX_FRAMES_AHEAD + 1).saturating_sub(usize::from(self.frames_ahead()))
    }

    #[inline]
    #[must_use]
    pub fn can_send_more(&self) -> bool {
        self.send_budget() > 0
    }

    /// A keepalive should be sent now: nothing is queued or in flight and
    /// either an acknowledgement was requested or half the keepalive period
    /// passed without sending.
    #[must_use]
    pub fn keepalive_due(&self, now: Instant, keepalive: Duration) -> bool {
        self.is_tx_idle()
            && (self.ack_requested || now.saturating_duration_since(self.last_tx) >= keepalive / 2)
    }

    /// Nothing arrived from the peer for a full keepalive period.
    #[must_use]
    pub fn is_expired(&self, now: Instant, keepalive: Duration) -> bool {
        now.saturating_duration_since(self.last_rx) > keepalive
    }
}
