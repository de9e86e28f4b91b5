//! Message routing and work dispatch for the receptor mesh.
//!
//! This crate ties the lower layers together: the [`MessageRouter`] decides
//! per message whether to forward toward the recipient's next hop or deliver
//! locally, the [`WorkDispatcher`] runs directive handlers and streams their
//! output back as serial-numbered responses ending in `eof`, and [`Node`]
//! owns the whole runtime (graph, queues, listeners, dialers, sweeps) behind
//! a [`NodeHandle`].

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod control;
pub mod node;
pub mod registry;
pub mod router;
pub mod security;
pub mod work;

pub use control::{NodeStatus, ReceptorControl, RouteEntry, StatusProvider};
pub use node::{Node, NodeConfig, NodeHandle};
pub use registry::ResponseRegistry;
pub use router::{MessageRouter, RouterStats, StatsSnapshot};
pub use security::{NoopSecurity, SecurityManager};
pub use work::{WorkDispatcher, WorkHandler};

#[cfg(feature = "tls")]
pub use security::CertificateSecurity;

use thiserror::Error;

/// Routing and dispatch errors.
#[derive(Error, Debug)]
pub enum RouterError {
    /// I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// Frame encoding failure
    #[error("wire error: {0}")]
    Wire(#[from] receptor_wire::WireError),
    /// Malformed envelope JSON
    #[error("envelope error: {0}")]
    Json(#[from] serde_json::Error),
    /// Durable queue failure
    #[error("queue error: {0}")]
    Queue(#[from] receptor_queue::QueueError),
    /// Connection-layer failure
    #[error("session error: {0}")]
    Session(#[from] receptor_session::SessionError),
    /// Message failed signature or identity verification
    #[error("verification failed: {0}")]
    Verification(String),
    /// The node loop is gone
    #[error("node is shut down")]
    Shutdown,
}
