use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Header length in bytes: length, session id, tx seq, rx seq, flags, type
pub const HEADER_LEN: usize = 12;

/// Highest sequence number; the sequence after it is 1
pub const MAX_SEQ: u8 = 127;

/// Framing errors. Any of these leaves the connection permanently errored.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("Frame length {0} is shorter than the header")]
    BadLength(u32),

    #[error("Frame length {len} exceeds connection limit {max}")]
    TooLarge { len: usize, max: usize },

    #[error("Unknown frame type {0}")]
    UnknownFrameType(u8),

    #[error("Peer acknowledged sequence {0} which has not been sent")]
    SequenceCollision(u8),

    #[error("Malformed payload: {0}")]
    Malformed(&'static str),

    #[error("Connection is in the errored state")]
    Errored,
}

/// Result type alias for framing operations
pub type Result<T> = std::result::Result<T, FrameError>;

/// Frame types on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameType {
    Keepalive = 1,
    RequestServices = 2,
    OfferedService = 3,
    AcceptService = 4,
    RejectService = 5,
    JobRequest = 6,
    JobResponse = 7,
    Terminate = 8,
}

impl TryFrom<u8> for FrameType {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self> {
        Ok(match value {
            1 => Self::Keepalive,
            2 => Self::RequestServices,
            3 => Self::OfferedService,
            4 => Self::AcceptService,
            5 => Self::RejectService,
            6 => Self::JobRequest,
            7 => Self::JobResponse,
            8 => Self::Terminate,
            other => return Err(FrameError::UnknownFrameType(other)),
        })
    }
}

/// Decoded frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Total frame length including this header
    pub frame_len: u32,
    pub session_id: u32,
    /// Sender's sequence number for this frame
    pub tx_seq: u8,
    /// Last sequence number the sender received from us (0 = none yet)
    pub rx_seq: u8,
    pub flags: u8,
    pub frame_type: FrameType,
}

impl FrameHeader {
    #[inline]
    #[must_use]
    pub const fn payload_len(&self) -> usize {
        self.frame_len as usize - HEADER_LEN
    }

    /// Append the header, little-endian
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.reserve(HEADER_LEN);
        dst.put_u32_le(self.frame_len);
        dst.put_u32_le(self.session_id);
        dst.put_u8(self.tx_seq);
        dst.put_u8(self.rx_seq);
        dst.put_u8(self.flags);
        dst.put_u8(self.frame_type as u8);
    }

    /// Parse a header without validating it against connection state
    ///
    /// # Errors
    ///
    /// `BadLength` for lengths below the header size and `UnknownFrameType`.
    pub fn parse(raw: &[u8; HEADER_LEN]) -> Result<Self> {
        let mut src = &raw[..];
        let frame_len = src.get_u32_le();
        let session_id = src.get_u32_le();
        let tx_seq = src.get_u8();
        let rx_seq = src.get_u8();
        let flags = src.get_u8();
        let frame_type = src.get_u8();

        if (frame_len as usize) < HEADER_LEN {
            return Err(FrameError::BadLength(frame_len));
        }
        Ok(Self {
            frame_len,
            session_id,
            tx_seq,
            rx_seq,
            flags,
            frame_type: FrameType::try_from(frame_type)?,
        })
    }
}

/// Outcome of inspecting the front of a receive buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderStatus {
    /// The declared frame has not fully arrived
    Incomplete,
    /// A keepalive; the caller strips exactly `HEADER_LEN` bytes
    Keepalive(FrameHeader),
    /// A complete non-keepalive frame of `frame_len` bytes is buffered
    Complete(FrameHeader),
}

/// Validate the header at the front of a receive buffer.
///
/// `available` is the number of buffered bytes including the header,
/// `next_tx_seq` the receiver's own next sequence number and `max_frame_len`
/// the connection's ceiling.
///
/// # Errors
///
/// Any `FrameError`; the caller must treat the connection as errored.
pub fn decode_frame_header(
    raw: &[u8; HEADER_LEN],
    available: usize,
    next_tx_seq: u8,
    max_frame_len: usize,
) -> Result<HeaderStatus> {
    let header = FrameHeader::parse(raw)?;
    let len = header.frame_len as usize;
    if len > max_frame_len {
        return Err(FrameError::TooLarge {
            len,
            max: max_frame_len,
        });
    }

    if header.frame_type == FrameType::Keepalive {
        if len != HEADER_LEN {
            return Err(FrameError::Malformed("keepalive carries a payload"));
        }
        return Ok(HeaderStatus::Keepalive(header));
    }

    // The peer cannot have seen a frame we have not sent yet.
    if header.rx_seq == next_tx_seq {
        return Err(FrameError::SequenceCollision(header.rx_seq));
    }

    if available < len {
        return Ok(HeaderStatus::Incomplete);
    }
    Ok(HeaderStatus::Complete(header))
}

/// A received frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: FrameHeader,
    pub payload: Bytes,
}

impl Frame {
    #[inline]
    #[must_use]
    pub const fn frame_type(&self) -> FrameType {
        self.header.frame_type
    }
}

/// Sequence number following `seq` (127 wraps to 1)
#[inline]
#[must_use]
pub const fn next_seq(seq: u8) -> u8 {
    if seq >= MAX_SEQ {
        1
    } else {
        seq + 1
    }
}

/// Sequence number preceding `seq` (1 wraps to 127)
#[inline]
#[must_use]
pub const fn prev_seq(seq: u8) -> u8 {
    if seq <= 1 {
        MAX_SEQ
    } else {
        seq - 1
    }
}

/// Append a complete frame (header and payload) to `dst`.
///
/// # Errors
///
/// `TooLarge` when the frame length does not fit the 32-bit length field.
pub fn encode_frame(
    dst: &mut BytesMut,
    frame_type: FrameType,
    session_id: u32,
    tx_seq: u8,
    rx_seq: u8,
    payload: &[u8],
) -> Result<()> {
    let len = HEADER_LEN + payload.len();
    let frame_len = u32::try_from(len).map_err(|_| FrameError::TooLarge {
        len,
        max: u32::MAX as usize,
    })?;
    FrameHeader {
        frame_len,
        session_id,
        tx_seq,
        rx_seq,
        flags: 0,
        frame_type,
    }
    .encode(dst);
    dst.extend_from_slice(payload);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header_bytes(frame_len: u32, tx: u8, rx: u8, ty: u8) -> [u8; HEADER_LEN] {
        let mut b = BytesMut::new();
        b.put_u32_le(frame_len);
        b.put_u32_le(9);
        b.put_u8(tx);
        b.put_u8(rx);
        b.put_u8(0);
        b.put_u8(ty);
        let mut out = [0u8; HEADER_LEN];
        out.copy_from_slice(&b);
        out
    }

    #[test]
    fn test_header_layout_is_little_endian() {
        let mut buf = BytesMut::new();
        encode_frame(&mut buf, FrameType::JobRequest, 0x0102_0304, 5, 3, b"xyz").unwrap();
        assert_eq!(
            &buf[..HEADER_LEN],
            &[15, 0, 0, 0, 0x04, 0x03, 0x02, 0x01, 5, 3, 0, 6]
        );
        assert_eq!(&buf[HEADER_LEN..], b"xyz");
    }

    #[test]
    fn test_incomplete_until_declared_length() {
        let raw = header_bytes(20, 1, 0, FrameType::JobResponse as u8);
        assert_eq!(
            decode_frame_header(&raw, 19, 1 + 1, 1024),
            Ok(HeaderStatus::Incomplete)
        );
        assert!(matches!(
            decode_frame_header(&raw, 20, 2, 1024),
            Ok(HeaderStatus::Complete(h)) if h.payload_len() == 8
        ));
    }

    #[test]
    fn test_keepalive_is_header_only() {
        let raw = header_bytes(12, 4, 4, FrameType::Keepalive as u8);
        // A keepalive may echo our next sequence number.
        assert!(matches!(
            decode_frame_header(&raw, 12, 4, 1024),
            Ok(HeaderStatus::Keepalive(_))
        ));

        let raw = header_bytes(13, 4, 0, FrameType::Keepalive as u8);
        assert!(matches!(
            decode_frame_header(&raw, 13, 1, 1024),
            Err(FrameError::Malformed(_))
        ));
    }

    #[test]
    fn test_sequence_collision() {
        let raw = header_bytes(12, 1, 7, FrameType::Terminate as u8);
        assert_eq!(
            decode_frame_header(&raw, 12, 7, 1024),
            Err(FrameError::SequenceCollision(7))
        );
    }

    #[test]
    fn test_rejects_bad_headers() {
        let raw = header_bytes(11, 1, 0, FrameType::Terminate as u8);
        assert_eq!(decode_frame_header(&raw, 11, 1, 1024), Err(FrameError::BadLength(11)));

        let raw = header_bytes(2048, 1, 0, FrameType::JobRequest as u8);
        assert!(matches!(
            decode_frame_header(&raw, 12, 1, 1024),
            Err(FrameError::TooLarge { len: 2048, max: 1024 })
        ));

        for ty in [0u8, 9, 255] {
            let raw = header_bytes(12, 1, 0, ty);
            assert_eq!(
                decode_frame_header(&raw, 12, 1, 1024),
                Err(FrameError::UnknownFrameType(ty))
            );
        }
    }

    #[test]
    fn test_sequence_wrap() {
        assert_eq!(next_seq(1), 2);
        assert_eq!(next_seq(126), 127);
        assert_eq!(next_seq(127), 1);
        assert_eq!(prev_seq(1), 127);
        assert_eq!(prev_seq(2), 1);
    }
}
