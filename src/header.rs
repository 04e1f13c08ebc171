//! Packet header and typed option model.
//!
//! A header describes one frame: which application handler it is for (the
//! tag), how many payload bytes follow, which transform pipeline produced
//! that payload, and a small set of typed optional fields. The wire layout
//! is fixed-order and carries one revision, no version negotiation:
//!
//! ```text
//! tag_len:      u8
//! tag:          tag_len bytes, UTF-8
//! payload_len:  u32 BE
//! pipeline_id:  u8
//! option_count: u8
//! options:      option_count x (kind: u8, value)
//! ```
//!
//! Fixed-width option values (kind < 0x80) are written bare; anything longer
//! than a machine word (kind >= 0x80) carries a u16 BE length prefix, which
//! is what lets a decoder skip a length-prefixed kind it does not recognize.
//! An absent option means "not set", never "set to default".

use std::collections::BTreeMap;
use std::io::{Cursor, Read};

use byteorder::{BigEndian, ReadBytesExt};
use bytes::{BufMut, Bytes, BytesMut};

use crate::error::FramingError;

/// Pipeline id reserved for the empty (identity) transform stack.
pub const PIPELINE_IDENTITY: u8 = 0;

/// Option kinds with length-prefixed values start here.
const LENGTH_PREFIXED: u8 = 0x80;

/// The closed vocabulary of header option kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum OptionKind {
    /// Monotonically increasing per-connection frame counter.
    SequenceNumber,
    /// Total size of a logical payload spread over several frames.
    TotalBytes,
    /// CRC-32 over the payload as it appears on the wire.
    Checksum,
    /// Free-form application string.
    Text,
}

impl OptionKind {
    pub const fn code(self) -> u8 {
        match self {
            OptionKind::SequenceNumber => 0x01,
            OptionKind::TotalBytes => 0x02,
            OptionKind::Checksum => 0x03,
            OptionKind::Text => 0x81,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0x01 => Some(OptionKind::SequenceNumber),
            0x02 => Some(OptionKind::TotalBytes),
            0x03 => Some(OptionKind::Checksum),
            0x81 => Some(OptionKind::Text),
            _ => None,
        }
    }
}

/// A decoded option value. The variant is fixed per [`OptionKind`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OptionValue {
    U64(u64),
    U32(u32),
    Text(String),
}

/// One frame's header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketHeader {
    /// Application handler tag. Tags starting with `@` are control frames.
    pub tag: String,
    /// Number of payload bytes that follow the header on the wire.
    pub payload_len: u32,
    /// Which registered transform stack produced the payload.
    pub pipeline_id: u8,
    options: BTreeMap<OptionKind, OptionValue>,
}

impl PacketHeader {
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            payload_len: 0,
            pipeline_id: PIPELINE_IDENTITY,
            options: BTreeMap::new(),
        }
    }

    pub fn with_pipeline(mut self, id: u8) -> Self {
        self.pipeline_id = id;
        self
    }

    pub fn set_sequence(&mut self, seq: u64) {
        self.options
            .insert(OptionKind::SequenceNumber, OptionValue::U64(seq));
    }

    pub fn sequence(&self) -> Option<u64> {
        match self.options.get(&OptionKind::SequenceNumber) {
            Some(OptionValue::U64(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn set_total_bytes(&mut self, total: u64) {
        self.options
            .insert(OptionKind::TotalBytes, OptionValue::U64(total));
    }

    pub fn total_bytes(&self) -> Option<u64> {
        match self.options.get(&OptionKind::TotalBytes) {
            Some(OptionValue::U64(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn set_checksum(&mut self, crc: u32) {
        self.options
            .insert(OptionKind::Checksum, OptionValue::U32(crc));
    }

    pub fn checksum(&self) -> Option<u32> {
        match self.options.get(&OptionKind::Checksum) {
            Some(OptionValue::U32(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn set_text(&mut self, text: impl Into<String>) {
        self.options
            .insert(OptionKind::Text, OptionValue::Text(text.into()));
    }

    pub fn text(&self) -> Option<&str> {
        match self.options.get(&OptionKind::Text) {
            Some(OptionValue::Text(v)) => Some(v),
            _ => None,
        }
    }

    pub fn options(&self) -> impl Iterator<Item = (OptionKind, &OptionValue)> {
        self.options.iter().map(|(k, v)| (*k, v))
    }

    /// Encode the header body. The u16 length prefix that precedes it on the
    /// wire is written by the frame layer, which knows the encoded size.
    pub fn encode(&self) -> Result<Bytes, FramingError> {
        if self.tag.len() > u8::MAX as usize {
            return Err(FramingError::BadTag);
        }
        let mut buf = BytesMut::with_capacity(16 + self.tag.len());
        buf.put_u8(self.tag.len() as u8);
        buf.put_slice(self.tag.as_bytes());
        buf.put_u32(self.payload_len);
        buf.put_u8(self.pipeline_id);
        buf.put_u8(self.options.len() as u8);
        for (kind, value) in &self.options {
            buf.put_u8(kind.code());
            match value {
                OptionValue::U64(v) => buf.put_u64(*v),
                OptionValue::U32(v) => buf.put_u32(*v),
                OptionValue::Text(v) => {
                    let bytes = v.as_bytes();
                    if bytes.len() > u16::MAX as usize {
                        return Err(FramingError::BadOptionValue);
                    }
                    buf.put_u16(bytes.len() as u16);
                    buf.put_slice(bytes);
                }
            }
        }
        Ok(buf.freeze())
    }

    /// Decode a header from exactly the bytes the length prefix declared.
    pub fn decode(body: &[u8]) -> Result<Self, FramingError> {
        let mut cur = Cursor::new(body);
        let tag_len = cur.read_u8().map_err(|_| truncated(body))? as usize;
        let mut tag_bytes = vec![0u8; tag_len];
        cur.read_exact(&mut tag_bytes).map_err(|_| truncated(body))?;
        let tag = String::from_utf8(tag_bytes).map_err(|_| FramingError::BadTag)?;

        let payload_len = cur.read_u32::<BigEndian>().map_err(|_| truncated(body))?;
        let pipeline_id = cur.read_u8().map_err(|_| truncated(body))?;
        let option_count = cur.read_u8().map_err(|_| truncated(body))?;

        let mut options = BTreeMap::new();
        for _ in 0..option_count {
            let code = cur.read_u8().map_err(|_| FramingError::OptionTruncated)?;
            match OptionKind::from_code(code) {
                Some(kind @ OptionKind::SequenceNumber) | Some(kind @ OptionKind::TotalBytes) => {
                    let v = cur
                        .read_u64::<BigEndian>()
                        .map_err(|_| FramingError::OptionTruncated)?;
                    options.insert(kind, OptionValue::U64(v));
                }
                Some(kind @ OptionKind::Checksum) => {
                    let v = cur
                        .read_u32::<BigEndian>()
                        .map_err(|_| FramingError::OptionTruncated)?;
                    options.insert(kind, OptionValue::U32(v));
                }
                Some(kind @ OptionKind::Text) => {
                    let len = cur
                        .read_u16::<BigEndian>()
                        .map_err(|_| FramingError::OptionTruncated)?
                        as usize;
                    let mut value = vec![0u8; len];
                    cur.read_exact(&mut value)
                        .map_err(|_| FramingError::OptionTruncated)?;
                    let text =
                        String::from_utf8(value).map_err(|_| FramingError::BadOptionValue)?;
                    options.insert(kind, OptionValue::Text(text));
                }
                None if code >= LENGTH_PREFIXED => {
                    // Unknown but self-describing: skip over it.
                    let len = cur
                        .read_u16::<BigEndian>()
                        .map_err(|_| FramingError::OptionTruncated)?
                        as usize;
                    let mut skipped = vec![0u8; len];
                    cur.read_exact(&mut skipped)
                        .map_err(|_| FramingError::OptionTruncated)?;
                }
                None => return Err(FramingError::UnknownOption(code)),
            }
        }

        // Anything after the declared options means the length prefix lied.
        if (cur.position() as usize) != body.len() {
            return Err(FramingError::HeaderTruncated {
                declared: body.len(),
                available: cur.position() as usize,
            });
        }

        Ok(Self {
            tag,
            payload_len,
            pipeline_id,
            options,
        })
    }
}

fn truncated(body: &[u8]) -> FramingError {
    FramingError::HeaderTruncated {
        declared: body.len(),
        available: body.len(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> PacketHeader {
        let mut h = PacketHeader::new("FileChunk").with_pipeline(3);
        h.payload_len = 4096;
        h.set_sequence(42);
        h.set_checksum(0xdead_beef);
        h.set_text("transfer-7");
        h
    }

    #[test]
    fn roundtrip() {
        let h = sample();
        let encoded = h.encode().unwrap();
        let decoded = PacketHeader::decode(&encoded).unwrap();
        assert_eq!(h, decoded);
    }

    #[test]
    fn roundtrip_no_options() {
        let h = PacketHeader::new("Ping");
        let decoded = PacketHeader::decode(&h.encode().unwrap()).unwrap();
        assert_eq!(decoded.tag, "Ping");
        assert_eq!(decoded.pipeline_id, PIPELINE_IDENTITY);
        assert!(decoded.sequence().is_none());
        assert!(decoded.checksum().is_none());
    }

    #[test]
    fn absent_option_is_none_not_zero() {
        let h = PacketHeader::new("Data");
        let decoded = PacketHeader::decode(&h.encode().unwrap()).unwrap();
        assert_eq!(decoded.sequence(), None);
        assert_eq!(decoded.total_bytes(), None);
    }

    #[test]
    fn unknown_length_prefixed_option_is_skipped() {
        let h = sample();
        let mut bytes = BytesMut::from(&h.encode().unwrap()[..]);
        // Append an unknown 0x9f option with a 3-byte value and bump the count.
        bytes.put_u8(0x9f);
        bytes.put_u16(3);
        bytes.put_slice(b"xyz");
        let count_at = 1 + h.tag.len() + 4 + 1;
        bytes[count_at] += 1;
        let decoded = PacketHeader::decode(&bytes).unwrap();
        assert_eq!(decoded.sequence(), Some(42));
    }

    #[test]
    fn unknown_fixed_width_option_is_rejected() {
        let h = PacketHeader::new("Data");
        let mut bytes = BytesMut::from(&h.encode().unwrap()[..]);
        bytes.put_u8(0x17);
        bytes.put_u32(7);
        let count_at = 1 + 4 + 4 + 1;
        bytes[count_at] += 1;
        assert!(matches!(
            PacketHeader::decode(&bytes),
            Err(FramingError::UnknownOption(0x17))
        ));
    }

    #[test]
    fn truncated_option_section_is_rejected() {
        let h = sample();
        let encoded = h.encode().unwrap();
        assert!(matches!(
            PacketHeader::decode(&encoded[..encoded.len() - 2]),
            Err(FramingError::OptionTruncated)
        ));
    }

    #[test]
    fn trailing_garbage_is_rejected() {
        let h = PacketHeader::new("Ping");
        let mut bytes = BytesMut::from(&h.encode().unwrap()[..]);
        bytes.put_u8(0);
        assert!(matches!(
            PacketHeader::decode(&bytes),
            Err(FramingError::HeaderTruncated { .. })
        ));
    }
}
