//! Stream reassembly: raw transport chunks in, complete frames out.
//!
//! Transports deliver arbitrary nonzero chunk sizes: a frame split across
//! many reads, or several frames concatenated into one. [`PacketBuilder`]
//! absorbs chunks into a growable buffer and yields complete frames as soon
//! as they are available, reclaiming consumed bytes as it goes. The
//! connection read loop drives it directly; [`FrameCodec`] wraps the same
//! logic as a `tokio_util` codec for callers that prefer `Framed` streams.

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder, Framed};

use crate::error::{FramingError, PeerlinkError};
use crate::frame::{encode_frame, try_decode_frame, Frame, FrameLimits};

/// Where the reassembler currently is between frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildState {
    /// Fewer than two buffered bytes: the header length prefix is not in yet.
    AwaitingHeaderLength,
    /// Prefix read, header body still incomplete.
    AwaitingHeader,
    /// Header complete, payload bytes still arriving.
    AwaitingPayload,
}

/// Incremental frame reassembler for one connection.
pub struct PacketBuilder {
    buf: BytesMut,
    limits: FrameLimits,
    /// Set on the first framing error; alignment is unrecoverable after it.
    poisoned: bool,
}

impl PacketBuilder {
    pub fn new(limits: FrameLimits) -> Self {
        Self {
            buf: BytesMut::with_capacity(4 * 1024),
            limits,
            poisoned: false,
        }
    }

    /// Append one transport chunk. Frames it completes are picked up by
    /// subsequent [`Self::next_frame`] calls.
    pub fn extend(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Pull the next complete frame out of the buffer, if one is ready.
    ///
    /// Call in a loop after each [`Self::extend`]: a single chunk can
    /// complete any number of frames. An `Err` is fatal for the stream and
    /// sticks on every later call.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, FramingError> {
        if self.poisoned {
            return Err(FramingError::HeaderTruncated {
                declared: 0,
                available: 0,
            });
        }
        match try_decode_frame(&mut self.buf, &self.limits) {
            Ok(frame) => Ok(frame),
            Err(e) => {
                self.poisoned = true;
                Err(e)
            }
        }
    }

    pub fn state(&self) -> BuildState {
        if self.buf.len() < 2 {
            return BuildState::AwaitingHeaderLength;
        }
        let hdr_len = u16::from_be_bytes([self.buf[0], self.buf[1]]) as usize;
        if self.buf.len() < 2 + hdr_len {
            BuildState::AwaitingHeader
        } else {
            BuildState::AwaitingPayload
        }
    }

    /// Bytes currently buffered awaiting the rest of a frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Drop all buffered bytes. Used on teardown.
    pub fn clear(&mut self) {
        self.buf.clear();
    }
}

/// `tokio_util` codec over the same wire format.
#[derive(Debug, Default, Clone)]
pub struct FrameCodec {
    limits: FrameLimits,
}

impl FrameCodec {
    pub fn new(limits: FrameLimits) -> Self {
        Self { limits }
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = PeerlinkError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, PeerlinkError> {
        Ok(try_decode_frame(src, &self.limits)?)
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = PeerlinkError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), PeerlinkError> {
        let wire = encode_frame(&frame)?;
        dst.extend_from_slice(&wire);
        Ok(())
    }
}

/// Wrap an async byte stream in a frame-level `Framed` transport.
pub fn framed<T>(io: T, limits: FrameLimits) -> Framed<T, FrameCodec>
where
    T: tokio::io::AsyncRead + tokio::io::AsyncWrite,
{
    Framed::new(io, FrameCodec::new(limits))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Frame;

    fn frames() -> Vec<Frame> {
        vec![
            Frame::new("Ping"),
            Frame::new("Data").with_payload(&b"hello"[..]),
            Frame::new("Data").with_payload(vec![0xabu8; 300]),
        ]
    }

    fn wire(frames: &[Frame]) -> Vec<u8> {
        let mut out = Vec::new();
        for f in frames {
            out.extend_from_slice(&encode_frame(f).unwrap());
        }
        out
    }

    fn feed_in_chunks(chunk_size: usize) {
        let expected = frames();
        let wire = wire(&expected);
        let mut builder = PacketBuilder::new(FrameLimits::default());
        let mut got = Vec::new();
        for chunk in wire.chunks(chunk_size) {
            builder.extend(chunk);
            while let Some(frame) = builder.next_frame().unwrap() {
                got.push(frame);
            }
        }
        assert_eq!(got, expected);
        assert_eq!(builder.buffered(), 0);
    }

    #[test]
    fn reassembles_byte_at_a_time() {
        feed_in_chunks(1);
    }

    #[test]
    fn reassembles_in_sevens() {
        feed_in_chunks(7);
    }

    #[test]
    fn reassembles_whole_buffer_at_once() {
        feed_in_chunks(usize::MAX);
    }

    #[test]
    fn state_progression() {
        let frame = Frame::new("Data").with_payload(&b"payload"[..]);
        let wire = encode_frame(&frame).unwrap();
        let mut builder = PacketBuilder::new(FrameLimits::default());
        assert_eq!(builder.state(), BuildState::AwaitingHeaderLength);
        builder.extend(&wire[..1]);
        assert_eq!(builder.state(), BuildState::AwaitingHeaderLength);
        builder.extend(&wire[1..4]);
        assert_eq!(builder.state(), BuildState::AwaitingHeader);
        builder.extend(&wire[4..wire.len() - 3]);
        assert_eq!(builder.state(), BuildState::AwaitingPayload);
        assert!(builder.next_frame().unwrap().is_none());
        builder.extend(&wire[wire.len() - 3..]);
        assert_eq!(builder.next_frame().unwrap().unwrap(), frame);
    }

    #[test]
    fn oversized_frame_poisons_the_builder() {
        let mut frame = Frame::new("Data");
        frame.header.payload_len = 1 << 30;
        let header = frame.header.encode().unwrap();
        let mut builder = PacketBuilder::new(FrameLimits {
            max_header_size: 1024,
            max_frame_size: 1024,
        });
        builder.extend(&(header.len() as u16).to_be_bytes());
        builder.extend(&header);
        assert!(matches!(
            builder.next_frame(),
            Err(FramingError::PayloadTooLarge { .. })
        ));
        // Still failed on the next call; the stream cannot be resynced.
        assert!(builder.next_frame().is_err());
    }

    #[tokio::test]
    async fn codec_over_duplex_stream() {
        use futures::SinkExt;
        use tokio_stream::StreamExt;

        let (a, b) = tokio::io::duplex(64);
        let mut tx = framed(a, FrameLimits::default());
        let mut rx = framed(b, FrameLimits::default());

        for f in frames() {
            tx.send(f).await.unwrap();
        }
        drop(tx);

        let mut got = Vec::new();
        while let Some(frame) = rx.try_next().await.unwrap() {
            got.push(frame);
        }
        assert_eq!(got, frames());
    }
}
