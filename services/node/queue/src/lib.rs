//! Durable per-peer outbound queues.
//!
//! Every message headed to a remote peer is staged on disk before it is
//! handed to a connection: one file per pending message under
//! `<data_dir>/<node_id>/messages/<uuid>`, plus an ordered `manifest-<peer>`
//! file per peer. Entries are deleted only after the connection has consumed
//! them end-to-end, so a crash or dropped link never loses a message that
//! was accepted for delivery.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod peer;
mod set;

pub use peer::{PeerQueue, QueueHandle};
pub use set::QueueSet;

use thiserror::Error;

/// Queue storage errors
#[derive(Error, Debug)]
pub enum QueueError {
    /// I/O error against the backing directory
    #[error("queue I/O error: {0}")]
    Io(#[from] std::io::Error),
}
