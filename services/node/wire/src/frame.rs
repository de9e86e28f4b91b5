//! Fixed-size frame header encoding and decoding.
//!
//! Every frame on a link starts with a 26-byte big-endian header declaring
//! its type, a per-frame ordinal, the payload length, and the 128-bit id of
//! the message it belongs to.

use crate::envelope::OuterHeader;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

/// Wire protocol version
pub const WIRE_VERSION: u8 = 1;

/// Frame header size in bytes
pub const FRAME_HEADER_SIZE: usize = 26;

/// Maximum accepted payload size for one frame (64 MiB)
pub const MAX_PAYLOAD_SIZE: u64 = 64 * 1024 * 1024;

/// Frame types as defined in the wire protocol
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FrameType {
    /// Carries the JSON outer header of a framed message
    Header = 0,
    /// Carries the opaque payload of a framed message
    Payload = 1,
    /// Carries a standalone JSON command (handshake, route advertisement)
    Command = 2,
}

impl TryFrom<u8> for FrameType {
    type Error = crate::WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(FrameType::Header),
            1 => Ok(FrameType::Payload),
            2 => Ok(FrameType::Command),
            _ => Err(crate::WireError::Type(value)),
        }
    }
}

/// Fixed frame header (26 bytes, big-endian)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Frame type
    pub typ: FrameType,
    /// Protocol version (must be 1)
    pub version: u8,
    /// Per-frame ordinal within a message
    pub id: u32,
    /// Byte count of the payload that follows
    pub length: u64,
    /// 128-bit message id this frame belongs to
    pub msg_id: u128,
}

impl FrameHeader {
    /// Create a new frame header for the current protocol version
    pub fn new(typ: FrameType, id: u32, length: u64, msg_id: u128) -> Self {
        Self {
            typ,
            version: WIRE_VERSION,
            id,
            length,
            msg_id,
        }
    }

    /// Encode the header to bytes (big-endian)
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.typ as u8);
        buf.put_u8(self.version);
        buf.put_u32(self.id);
        buf.put_u64(self.length);
        buf.put_u64((self.msg_id >> 64) as u64);
        buf.put_u64(self.msg_id as u64);
    }

    /// Decode a header from the front of `buf`.
    ///
    /// Returns `Ok(None)` when fewer than [`FRAME_HEADER_SIZE`] bytes are
    /// available. A bad type, version, or oversized length is a fatal
    /// [`WireError`](crate::WireError).
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Self>, crate::WireError> {
        if buf.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }

        let typ = FrameType::try_from(buf[0])?;
        let version = buf[1];
        if version != WIRE_VERSION {
            return Err(crate::WireError::Version(version));
        }

        buf.advance(2);
        let id = buf.get_u32();
        let length = buf.get_u64();
        let hi = buf.get_u64();
        let lo = buf.get_u64();

        if length > MAX_PAYLOAD_SIZE {
            return Err(crate::WireError::Size(length));
        }

        Ok(Some(Self {
            typ,
            version,
            id,
            length,
            msg_id: ((hi as u128) << 64) | lo as u128,
        }))
    }
}

/// Encode a complete framed message (HEADER frame + PAYLOAD frame) to
/// contiguous bytes ready for the transport or the durable queue.
pub fn encode_framed_message(
    msg_id: u128,
    header: &OuterHeader,
    payload: &[u8],
) -> Result<Bytes, crate::WireError> {
    let header_json = serde_json::to_vec(header)?;

    let mut buf =
        BytesMut::with_capacity(2 * FRAME_HEADER_SIZE + header_json.len() + payload.len());
    FrameHeader::new(FrameType::Header, 1, header_json.len() as u64, msg_id).encode(&mut buf);
    buf.put_slice(&header_json);
    FrameHeader::new(FrameType::Payload, 2, payload.len() as u64, msg_id).encode(&mut buf);
    buf.put_slice(payload);

    Ok(buf.freeze())
}

/// Encode a single COMMAND frame carrying a JSON-serializable body.
pub fn encode_command<T: serde::Serialize>(
    msg_id: u128,
    body: &T,
) -> Result<Bytes, crate::WireError> {
    let json = serde_json::to_vec(body)?;

    let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + json.len());
    FrameHeader::new(FrameType::Command, 1, json.len() as u64, msg_id).encode(&mut buf);
    buf.put_slice(&json);

    Ok(buf.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_type_conversion() {
        assert_eq!(FrameType::try_from(0).unwrap(), FrameType::Header);
        assert_eq!(FrameType::try_from(2).unwrap(), FrameType::Command);
        assert!(FrameType::try_from(3).is_err());
        assert!(FrameType::try_from(0xFF).is_err());
    }

    #[test]
    fn test_header_encode_decode() {
        let header = FrameHeader::new(FrameType::Payload, 2, 4096, 0xDEAD_BEEF_CAFE_F00D_0123_4567_89AB_CDEF);

        let mut buf = BytesMut::new();
        header.encode(&mut buf);
        assert_eq!(buf.len(), FRAME_HEADER_SIZE);

        let decoded = FrameHeader::decode(&mut buf).unwrap().unwrap();
        assert_eq!(header, decoded);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_header_needs_full_26_bytes() {
        let header = FrameHeader::new(FrameType::Command, 1, 10, 42);
        let mut buf = BytesMut::new();
        header.encode(&mut buf);

        let mut partial = BytesMut::from(&buf[..FRAME_HEADER_SIZE - 1]);
        assert!(FrameHeader::decode(&mut partial).unwrap().is_none());
        // The partial bytes must remain untouched for the next read.
        assert_eq!(partial.len(), FRAME_HEADER_SIZE - 1);
    }

    #[test]
    fn test_bad_type_rejected() {
        let mut buf = BytesMut::from(&[9u8; FRAME_HEADER_SIZE][..]);
        assert!(matches!(
            FrameHeader::decode(&mut buf),
            Err(crate::WireError::Type(9))
        ));
    }

    #[test]
    fn test_oversized_length_rejected() {
        let header = FrameHeader::new(FrameType::Payload, 1, MAX_PAYLOAD_SIZE + 1, 1);
        let mut buf = BytesMut::new();
        header.encode(&mut buf);
        assert!(matches!(
            FrameHeader::decode(&mut buf),
            Err(crate::WireError::Size(_))
        ));
    }
}
