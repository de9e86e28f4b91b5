//! Incremental message assembly from raw transport chunks.
//!
//! [`FramedBuffer`] accepts arbitrarily fragmented byte chunks, decodes frame
//! headers once 26 bytes are available, stages exactly `length` payload bytes,
//! and emits completed messages. A HEADER frame's decoded JSON is held until
//! the matching PAYLOAD frame arrives under the same `msg_id`.

use crate::command::Command;
use crate::envelope::{FramedMessage, OuterHeader};
use crate::frame::{FrameHeader, FrameType};
use bytes::{Buf, BytesMut};
use tracing::trace;

/// A complete message produced by the assembler.
#[derive(Debug, Clone)]
pub enum AssembledMessage {
    /// A routed message: outer header plus payload
    Framed(FramedMessage),
    /// A standalone control command
    Command {
        /// Link-level id of the command frame
        msg_id: u128,
        /// Decoded command body
        command: Command,
    },
}

enum State {
    /// Waiting for the next 26-byte frame header
    Header,
    /// Consuming the declared payload of the current frame
    Payload { header: FrameHeader, staged: BytesMut },
}

/// Assembles frames fed in arbitrary chunks into complete messages.
///
/// The sender contract forbids interleaving frames of different `msg_id`s on
/// one connection; a violation is a fatal [`WireError`](crate::WireError)
/// that must close the connection.
pub struct FramedBuffer {
    buf: BytesMut,
    state: State,
    /// Outer header awaiting its PAYLOAD frame
    pending: Option<(u128, OuterHeader)>,
}

impl FramedBuffer {
    /// Create an empty assembler.
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(64 * 1024),
            state: State::Header,
            pending: None,
        }
    }

    /// Feed one chunk of transport bytes, returning any messages completed
    /// by it. Excess bytes are retained for the next call.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<AssembledMessage>, crate::WireError> {
        self.buf.extend_from_slice(chunk);
        let mut out = Vec::new();

        loop {
            match &mut self.state {
                State::Header => {
                    let Some(header) = FrameHeader::decode(&mut self.buf)? else {
                        break;
                    };
                    trace!(
                        typ = ?header.typ,
                        length = header.length,
                        msg_id = format_args!("{:#x}", header.msg_id),
                        "decoded frame header"
                    );
                    self.state = State::Payload {
                        staged: BytesMut::with_capacity(header.length.min(64 * 1024) as usize),
                        header,
                    };
                }
                State::Payload { header, staged } => {
                    let needed = header.length as usize - staged.len();
                    let take = needed.min(self.buf.len());
                    staged.extend_from_slice(&self.buf[..take]);
                    self.buf.advance(take);

                    if staged.len() < header.length as usize {
                        break;
                    }

                    let header = *header;
                    let staged = std::mem::take(staged);
                    self.state = State::Header;

                    if let Some(msg) = self.complete_frame(header, staged)? {
                        out.push(msg);
                    }
                }
            }
        }

        Ok(out)
    }

    fn complete_frame(
        &mut self,
        header: FrameHeader,
        staged: BytesMut,
    ) -> Result<Option<AssembledMessage>, crate::WireError> {
        match header.typ {
            FrameType::Header => {
                if let Some((expected, _)) = &self.pending {
                    if *expected != header.msg_id {
                        return Err(crate::WireError::Interleaved {
                            expected: *expected,
                            got: header.msg_id,
                        });
                    }
                }
                let outer: OuterHeader = serde_json::from_slice(&staged)?;
                self.pending = Some((header.msg_id, outer));
                Ok(None)
            }
            FrameType::Payload => match self.pending.take() {
                Some((expected, outer)) if expected == header.msg_id => {
                    Ok(Some(AssembledMessage::Framed(FramedMessage {
                        msg_id: header.msg_id,
                        header: outer,
                        payload: staged.freeze(),
                    })))
                }
                Some((expected, _)) => Err(crate::WireError::Interleaved {
                    expected,
                    got: header.msg_id,
                }),
                None => Err(crate::WireError::OrphanPayload(header.msg_id)),
            },
            FrameType::Command => {
                if let Some((expected, _)) = &self.pending {
                    return Err(crate::WireError::Interleaved {
                        expected: *expected,
                        got: header.msg_id,
                    });
                }
                let command: Command = serde_json::from_slice(&staged)?;
                Ok(Some(AssembledMessage::Command {
                    msg_id: header.msg_id,
                    command,
                }))
            }
        }
    }
}

impl Default for FramedBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{encode_command, encode_framed_message};

    fn framed(msg_id: u128, sender: &str, recipient: &str, payload: &[u8]) -> Vec<u8> {
        encode_framed_message(msg_id, &OuterHeader::new(sender, recipient), payload)
            .unwrap()
            .to_vec()
    }

    #[test]
    fn test_roundtrip_single_chunk() {
        let bytes = framed(7, "a", "b", b"hello world");

        let mut asm = FramedBuffer::new();
        let out = asm.feed(&bytes).unwrap();
        assert_eq!(out.len(), 1);

        match &out[0] {
            AssembledMessage::Framed(msg) => {
                assert_eq!(msg.msg_id, 7);
                assert_eq!(msg.header.sender, "a");
                assert_eq!(msg.header.recipient, "b");
                assert_eq!(&msg.payload[..], b"hello world");
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_roundtrip_any_chunking() {
        // Several MB payload, delivered in awkward chunk sizes.
        let payload: Vec<u8> = (0..3 * 1024 * 1024).map(|i| (i % 251) as u8).collect();
        let bytes = framed(0x1234_5678_9ABC_DEF0_1111_2222_3333_4444, "a", "b", &payload);

        for chunk_size in [1usize, 3, 26, 27, 1000, 65536] {
            let mut asm = FramedBuffer::new();
            let mut out = Vec::new();
            for chunk in bytes.chunks(chunk_size) {
                out.extend(asm.feed(chunk).unwrap());
            }
            assert_eq!(out.len(), 1, "chunk size {}", chunk_size);
            match &out[0] {
                AssembledMessage::Framed(msg) => assert_eq!(&msg.payload[..], &payload[..]),
                other => panic!("unexpected message: {:?}", other),
            }
        }
    }

    #[test]
    fn test_back_to_back_messages_and_commands() {
        let mut bytes = encode_command(
            1,
            &Command::HI {
                id: "peer".to_string(),
                capabilities: Default::default(),
            },
        )
        .unwrap()
        .to_vec();
        bytes.extend(framed(2, "a", "b", b"one"));
        bytes.extend(framed(3, "a", "b", b"two"));

        let mut asm = FramedBuffer::new();
        let out = asm.feed(&bytes).unwrap();
        assert_eq!(out.len(), 3);
        assert!(matches!(out[0], AssembledMessage::Command { msg_id: 1, .. }));
        assert!(matches!(&out[1], AssembledMessage::Framed(m) if &m.payload[..] == b"one"));
        assert!(matches!(&out[2], AssembledMessage::Framed(m) if &m.payload[..] == b"two"));
    }

    #[test]
    fn test_malformed_header_is_fatal() {
        let mut asm = FramedBuffer::new();
        // 26 bytes of garbage: type byte 0xFF can never be valid.
        let err = asm.feed(&[0xFFu8; 32]).unwrap_err();
        assert!(matches!(err, crate::WireError::Type(0xFF)));
    }

    #[test]
    fn test_interleaved_messages_rejected() {
        let a = framed(10, "a", "b", b"payload-a");
        let b = framed(11, "a", "b", b"payload-b");

        // HEADER of message 10 followed immediately by message 11.
        let header_len = {
            let mut buf = BytesMut::from(&a[..]);
            let h = FrameHeader::decode(&mut buf).unwrap().unwrap();
            crate::FRAME_HEADER_SIZE + h.length as usize
        };
        let mut bytes = a[..header_len].to_vec();
        bytes.extend_from_slice(&b);

        let mut asm = FramedBuffer::new();
        let err = asm.feed(&bytes).unwrap_err();
        assert!(matches!(err, crate::WireError::Interleaved { .. }));
    }

    #[test]
    fn test_orphan_payload_rejected() {
        let mut buf = BytesMut::new();
        FrameHeader::new(FrameType::Payload, 1, 3, 99).encode(&mut buf);
        buf.extend_from_slice(b"abc");

        let mut asm = FramedBuffer::new();
        let err = asm.feed(&buf).unwrap_err();
        assert!(matches!(err, crate::WireError::OrphanPayload(99)));
    }
}
