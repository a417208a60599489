use bytes::{Buf, Bytes, BytesMut};
use std::collections::VecDeque;

/// Receive-side buffer made of the `Bytes` segments handed over by the
/// reader task.
///
/// Frames are cut from the front. A frame that lies within one segment is
/// returned without copying; a frame spanning several reads is copied into
/// one contiguous buffer.
#[derive(Debug, Default)]
pub struct RecvBuffer {
    segs: VecDeque<Bytes>,
    len: usize,
}

impl RecvBuffer {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            segs: VecDeque::new(),
            len: 0,
        }
    }

    #[inline]
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn push(&mut self, bytes: Bytes) {
        if bytes.is_empty() {
            return;
        }
        self.len += bytes.len();
        self.segs.push_back(bytes);
    }

    /// Copy the first `N` bytes out without consuming them.
    ///
    /// Returns `None` while fewer than `N` bytes are buffered.
    #[must_use]
    pub fn peek_array<const N: usize>(&self) -> Option<[u8; N]> {
        if N > self.len {
            return None;
        }

        let mut out = [0u8; N];
        let mut off = 0;
        for seg in &self.segs {
            if off == N {
                break;
            }
            let take = (N - off).min(seg.len());
            out[off..off + take].copy_from_slice(&seg[..take]);
            off += take;
        }
        Some(out)
    }

    /// Drop up to `n` bytes from the front. Returns how many were dropped.
    pub fn discard(&mut self, n: usize) -> usize {
        let n = n.min(self.len);
        self.len -= n;

        let mut remaining = n;
        while remaining > 0 {
            let Some(mut front) = self.segs.pop_front() else {
                break;
            };
            if remaining >= front.len() {
                remaining -= front.len();
                continue;
            }
            front.advance(remaining);
            self.segs.push_front(front);
            break;
        }
        n
    }

    /// Take exactly `n` bytes from the front of the buffer.
    pub fn take_bytes(&mut self, n: usize) -> Option<Bytes> {
        if n == 0 {
            return Some(Bytes::new());
        }
        if n > self.len {
            return None;
        }

        let front = self.segs.front_mut()?;
        if front.len() >= n {
            self.len -= n;
            let out = front.split_to(n);
            if front.is_empty() {
                self.segs.pop_front();
            }
            return Some(out);
        }

        // Spans segments: copy.
        let mut out = BytesMut::with_capacity(n);
        while out.len() < n {
            let Some(mut seg) = self.segs.pop_front() else {
                break;
            };
            let take = (n - out.len()).min(seg.len());
            out.extend_from_slice(&seg[..take]);
            self.len -= take;
            if take < seg.len() {
                seg.advance(take);
                self.segs.push_front(seg);
            }
        }

        Some(out.freeze())
    }

    pub fn clear(&mut self) {
        self.segs.clear();
        self.len = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_take_across_segments() {
        let mut buf = RecvBuffer::new();
        buf.push(Bytes::from_static(b"abc"));
        buf.push(Bytes::from_static(b""));
        buf.push(Bytes::from_static(b"defg"));
        assert_eq!(buf.len(), 7);

        assert_eq!(buf.peek_array::<5>(), Some(*b"abcde"));
        assert_eq!(buf.peek_array::<8>(), None);

        assert_eq!(buf.take_bytes(2).as_deref(), Some(&b"ab"[..]));
        assert_eq!(buf.take_bytes(3).as_deref(), Some(&b"cde"[..]));
        assert_eq!(buf.len(), 2);
        assert_eq!(buf.take_bytes(3), None);
    }

    #[test]
    fn test_discard_is_bounded() {
        let mut buf = RecvBuffer::new();
        buf.push(Bytes::from_static(b"0123"));
        buf.push(Bytes::from_static(b"4567"));

        assert_eq!(buf.discard(5), 5);
        assert_eq!(buf.peek_array::<3>(), Some(*b"567"));
        assert_eq!(buf.discard(10), 3);
        assert!(buf.is_empty());
    }
}
