//! Wire protocol error types.

use thiserror::Error;

/// Wire protocol errors.
///
/// All of these are fatal to the connection they occur on; the stream cannot
/// be resynchronized after a malformed header.
#[derive(Error, Debug)]
pub enum WireError {
    /// Unsupported protocol version
    #[error("version unsupported: {0}")]
    Version(u8),

    /// Unknown frame type
    #[error("unknown frame type {0}")]
    Type(u8),

    /// Size limit exceeded
    #[error("size limit exceeded: {0}")]
    Size(u64),

    /// PAYLOAD frame arrived without a preceding HEADER frame
    #[error("payload frame without header for msg {0:#x}")]
    OrphanPayload(u128),

    /// Frames from different messages were interleaved on one connection
    #[error("interleaved frames: expected msg {expected:#x}, got {got:#x}")]
    Interleaved {
        /// msg_id of the message being assembled
        expected: u128,
        /// msg_id observed on the wire
        got: u128,
    },

    /// Invalid JSON in a HEADER or COMMAND frame
    #[error("invalid json payload: {0}")]
    Json(#[from] serde_json::Error),
}
