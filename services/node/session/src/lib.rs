//! Peer connections for the receptor mesh: transports, handshake, and
//! connection workers.
//!
//! A node listens on and dials `rnp`/`rnps`/`ws`/`wss` URLs. Every
//! established connection exchanges HI, then runs a worker whose writer
//! drains the peer's durable queue while its reader feeds the frame
//! assembler. Workers report [`WorkerEvent`]s to the node loop over a
//! channel and never touch routing state themselves.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod handshake;
pub mod peer_url;
pub mod registry;
pub mod transport;
pub mod worker;

pub use handshake::{exchange_hi, PeerInfo, HANDSHAKE_TIMEOUT};
pub use peer_url::{PeerUrl, Scheme};
pub use registry::ConnectionRegistry;
pub use transport::{
    accept, connect, listen_tcp, Connection, ConnectionReader, ConnectionWriter, IoStream,
    TlsClientConfig, TlsServer,
};
pub use worker::{
    dial_peer, run_connection, run_listener, WorkerContext, WorkerEvent, RECONNECT_DELAY,
};

#[cfg(feature = "tls")]
pub use transport::tls::{
    accept_tls, connect_tls, extract_common_name, make_client_config, make_server_config,
    tls_acceptor,
};

use thiserror::Error;

/// Session and transport errors.
#[derive(Error, Debug)]
pub enum SessionError {
    /// Socket-level I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// WebSocket protocol failure
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    /// Malformed frame on the link; fatal to the connection
    #[error("wire error: {0}")]
    Wire(#[from] receptor_wire::WireError),
    /// Durable queue failure
    #[error("queue error: {0}")]
    Queue(#[from] receptor_queue::QueueError),
    /// Unparseable peer or listener address
    #[error("invalid address: {0}")]
    Url(String),
    /// Peer did not complete HI in time
    #[error("handshake timed out")]
    HandshakeTimeout,
    /// Peer violated the link protocol
    #[error("protocol violation: {0}")]
    Protocol(String),
    /// Connection closed before the operation completed
    #[error("connection closed")]
    Closed,
    /// TLS configuration or handshake failure
    #[error("TLS error: {0}")]
    Tls(String),
    /// A TLS scheme was requested without the `tls` feature
    #[error("TLS support not compiled in")]
    TlsUnavailable,
}
