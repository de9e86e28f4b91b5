//! Wire framing, message assembly, and envelope types for the receptor mesh.
//!
//! This crate implements the low-level link protocol: a fixed 26-byte frame
//! header, an incremental assembler that turns raw byte chunks into complete
//! messages, and the JSON envelope types carried inside frames.
//!
//! ## Wire format
//!
//! ```text
//! +--------------------+-------------------------------+
//! | type (u8)          | 0 HEADER, 1 PAYLOAD, 2 COMMAND|
//! | version (u8)       | protocol version (1)          |
//! | id (u32)           | per-frame ordinal             |
//! | length (u64)       | payload byte count            |
//! | msg_id_hi (u64)    | high word of 128-bit msg id   |
//! | msg_id_lo (u64)    | low word of 128-bit msg id    |
//! +--------------------+-------------------------------+
//! | payload            | exactly `length` bytes        |
//! +--------------------+-------------------------------+
//! ```
//!
//! A *framed message* is a HEADER frame carrying the JSON outer header
//! followed by a PAYLOAD frame carrying opaque payload bytes under the same
//! `msg_id`. A *command message* is a single COMMAND frame carrying JSON.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod assembler;
pub mod command;
pub mod envelope;
pub mod error;
pub mod frame;

pub use assembler::{AssembledMessage, FramedBuffer};
pub use command::{Command, EdgeUpdate};
pub use envelope::{FramedMessage, InnerEnvelope, MessageType, OuterHeader, SignedEnvelope};
pub use error::WireError;
pub use frame::{
    encode_command, encode_framed_message, FrameHeader, FrameType, FRAME_HEADER_SIZE,
    MAX_PAYLOAD_SIZE, WIRE_VERSION,
};
