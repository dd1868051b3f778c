//! Echo payload framing
//!
//! Each exchange is one frame: a 4-byte big-endian length followed by that
//! many payload bytes. The server echoes the frame back unchanged. Payload
//! content is derived from the iteration number so a mismatch points at the
//! connection it came from.

use crate::env::ledger::Tracked;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Length prefix size
pub const HEADER_LEN: usize = 4;

/// Largest payload a decoder accepts
pub const MAX_PAYLOAD: usize = 1 << 20;

/// Framing errors
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("Frame length {0} exceeds limit")]
    TooLarge(usize),
}

/// Deterministic payload for connection `index`
pub fn payload(index: usize, size: usize) -> Bytes {
    let mut buf = BytesMut::with_capacity(size);
    let seed = (index as u32).wrapping_mul(2_654_435_761);
    for i in 0..size {
        let byte = seed.rotate_left((i % 32) as u32) as u8 ^ (i as u8);
        buf.put_u8(byte);
    }
    buf.freeze()
}

/// Encode `payload` as one frame
pub fn encode(payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.put_slice(payload);
    buf.freeze()
}

/// Incremental frame decoder
///
/// Tolerates arbitrary fragmentation: feed whatever the transport returned
/// and ask for the next complete frame.
pub struct FrameDecoder {
    buf: BytesMut,
    _tracked: Tracked,
}

impl FrameDecoder {
    pub fn new() -> Self {
        FrameDecoder {
            buf: BytesMut::with_capacity(512),
            _tracked: Tracked::new("exchange-buffer"),
        }
    }

    /// Append received bytes
    pub fn feed(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Bytes received but not yet returned as a frame
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Take the next complete frame's payload, if one has arrived
    pub fn next_frame(&mut self) -> Result<Option<Bytes>, FrameError> {
        if self.buf.len() < HEADER_LEN {
            return Ok(None);
        }
        let len = (&self.buf[..HEADER_LEN]).get_u32() as usize;
        if len > MAX_PAYLOAD {
            return Err(FrameError::TooLarge(len));
        }
        if self.buf.len() < HEADER_LEN + len {
            return Ok(None);
        }
        self.buf.advance(HEADER_LEN);
        Ok(Some(self.buf.split_to(len).freeze()))
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_is_deterministic() {
        assert_eq!(payload(3, 64), payload(3, 64));
        assert_ne!(payload(3, 64), payload(4, 64));
        assert_eq!(payload(0, 0).len(), 0);
    }

    #[test]
    fn test_fragmented_frame() {
        let frame = encode(b"hello frame");
        let mut decoder = FrameDecoder::new();

        for chunk in frame.chunks(3) {
            assert_eq!(decoder.next_frame().unwrap(), None);
            decoder.feed(chunk);
        }
        assert_eq!(decoder.next_frame().unwrap().unwrap(), &b"hello frame"[..]);
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_back_to_back_frames() {
        let mut decoder = FrameDecoder::new();
        decoder.feed(&encode(b"one"));
        decoder.feed(&encode(b""));
        decoder.feed(&encode(b"three"));

        assert_eq!(decoder.next_frame().unwrap().unwrap(), &b"one"[..]);
        assert_eq!(decoder.next_frame().unwrap().unwrap(), &b""[..]);
        assert_eq!(decoder.next_frame().unwrap().unwrap(), &b"three"[..]);
        assert_eq!(decoder.next_frame().unwrap(), None);
    }

    #[test]
    fn test_oversized_frame_is_rejected() {
        let mut decoder = FrameDecoder::new();
        decoder.feed(&((MAX_PAYLOAD as u32) + 1).to_be_bytes());
        assert_eq!(decoder.next_frame(), Err(FrameError::TooLarge(MAX_PAYLOAD + 1)));
    }
}
