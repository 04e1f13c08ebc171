//! Frame encoding and incremental decoding.
//!
//! Wire layout: `[hdr_len: u16 BE][header body][payload]`. The header body
//! is self-describing past the prefix (see [`crate::header`]); the payload
//! length comes from the header.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::FramingError;
use crate::header::PacketHeader;

/// Size caps enforced while decoding, taken from [`crate::config::Config`].
#[derive(Debug, Clone, Copy)]
pub struct FrameLimits {
    pub max_header_size: usize,
    pub max_frame_size: usize,
}

impl Default for FrameLimits {
    fn default() -> Self {
        let cfg = crate::config::Config::default();
        Self {
            max_header_size: cfg.max_header_size,
            max_frame_size: cfg.max_frame_size,
        }
    }
}

/// One complete (header, payload) unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: PacketHeader,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            header: PacketHeader::new(tag),
            payload: Bytes::new(),
        }
    }

    /// Attach a payload, keeping the header's declared length in sync.
    pub fn with_payload(mut self, payload: impl Into<Bytes>) -> Self {
        self.payload = payload.into();
        self.header.payload_len = self.payload.len() as u32;
        self
    }

    /// Pair a prebuilt header with its payload, syncing the declared length.
    pub fn from_parts(mut header: PacketHeader, payload: Bytes) -> Self {
        header.payload_len = payload.len() as u32;
        Self { header, payload }
    }

    pub fn tag(&self) -> &str {
        &self.header.tag
    }
}

/// Encode a frame into its full wire representation. The header's declared
/// payload length is written as-is; [`Frame::with_payload`] and
/// [`Frame::from_parts`] keep it honest for well-formed frames.
pub fn encode_frame(frame: &Frame) -> Result<Bytes, FramingError> {
    let header = frame.header.encode()?;
    if header.len() > u16::MAX as usize {
        return Err(FramingError::HeaderTooLarge {
            declared: header.len(),
            max: u16::MAX as usize,
        });
    }
    let mut out = BytesMut::with_capacity(2 + header.len() + frame.payload.len());
    out.put_u16(header.len() as u16);
    out.put_slice(&header);
    out.put_slice(&frame.payload);
    Ok(out.freeze())
}

/// Try to decode one frame from the front of `buf`.
///
/// Returns `Ok(None)` when the buffer does not yet hold a complete frame;
/// the caller appends more bytes and calls again. On success the consumed
/// bytes are removed from `buf`, so several concatenated frames decode with
/// repeated calls. Errors are fatal: the stream alignment is gone.
pub fn try_decode_frame(
    buf: &mut BytesMut,
    limits: &FrameLimits,
) -> Result<Option<Frame>, FramingError> {
    if buf.len() < 2 {
        return Ok(None);
    }
    let hdr_len = u16::from_be_bytes([buf[0], buf[1]]) as usize;
    if hdr_len > limits.max_header_size {
        return Err(FramingError::HeaderTooLarge {
            declared: hdr_len,
            max: limits.max_header_size,
        });
    }
    if buf.len() < 2 + hdr_len {
        return Ok(None);
    }
    // Decode the header in place; only consume once the payload is here too.
    let header = PacketHeader::decode(&buf[2..2 + hdr_len])?;
    let payload_len = header.payload_len as usize;
    if payload_len > limits.max_frame_size {
        return Err(FramingError::PayloadTooLarge {
            declared: payload_len,
            max: limits.max_frame_size,
        });
    }
    if buf.len() < 2 + hdr_len + payload_len {
        return Ok(None);
    }
    buf.advance(2 + hdr_len);
    let payload = buf.split_to(payload_len).freeze();
    Ok(Some(Frame { header, payload }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let frame = Frame::new("Data").with_payload(&b"hello peerlink"[..]);
        let wire = encode_frame(&frame).unwrap();
        let mut buf = BytesMut::from(&wire[..]);
        let decoded = try_decode_frame(&mut buf, &FrameLimits::default())
            .unwrap()
            .unwrap();
        assert_eq!(decoded, frame);
        assert!(buf.is_empty());
    }

    #[test]
    fn zero_length_payload_is_valid() {
        let frame = Frame::new("Ping");
        let wire = encode_frame(&frame).unwrap();
        let mut buf = BytesMut::from(&wire[..]);
        let decoded = try_decode_frame(&mut buf, &FrameLimits::default())
            .unwrap()
            .unwrap();
        assert_eq!(decoded.payload.len(), 0);
    }

    #[test]
    fn incomplete_frame_returns_none() {
        let frame = Frame::new("Data").with_payload(&b"0123456789"[..]);
        let wire = encode_frame(&frame).unwrap();
        for cut in 0..wire.len() {
            let mut buf = BytesMut::from(&wire[..cut]);
            assert!(try_decode_frame(&mut buf, &FrameLimits::default())
                .unwrap()
                .is_none());
            assert_eq!(buf.len(), cut, "partial decode must not consume bytes");
        }
    }

    #[test]
    fn two_frames_back_to_back() {
        let a = Frame::new("A").with_payload(&b"first"[..]);
        let b = Frame::new("B").with_payload(&b"second"[..]);
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&encode_frame(&a).unwrap());
        buf.extend_from_slice(&encode_frame(&b).unwrap());
        let limits = FrameLimits::default();
        assert_eq!(try_decode_frame(&mut buf, &limits).unwrap().unwrap(), a);
        assert_eq!(try_decode_frame(&mut buf, &limits).unwrap().unwrap(), b);
        assert!(try_decode_frame(&mut buf, &limits).unwrap().is_none());
    }

    #[test]
    fn oversized_payload_declaration_fails_before_allocation() {
        let mut frame = Frame::new("Data");
        frame.header.payload_len = u32::MAX;
        let header = frame.header.encode().unwrap();
        let mut wire = BytesMut::new();
        wire.put_u16(header.len() as u16);
        wire.put_slice(&header);
        let limits = FrameLimits {
            max_header_size: 1024,
            max_frame_size: 1024,
        };
        assert!(matches!(
            try_decode_frame(&mut wire, &limits),
            Err(FramingError::PayloadTooLarge { .. })
        ));
    }

    #[test]
    fn oversized_header_declaration_fails() {
        let mut buf = BytesMut::new();
        buf.put_u16(u16::MAX);
        let limits = FrameLimits::default();
        assert!(matches!(
            try_decode_frame(&mut buf, &limits),
            Err(FramingError::HeaderTooLarge { .. })
        ));
    }
}
