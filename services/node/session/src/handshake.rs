//! HI handshake run immediately after transport establishment.
//!
//! Both sides send a HI command naming their node id; the dialer speaks
//! first, the acceptor replies after seeing it. Nothing else may precede
//! HI on a connection.

use crate::transport::Connection;
use crate::SessionError;
use receptor_wire::{encode_command, AssembledMessage, Command, FramedBuffer};
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

/// A peer that does not complete HI within this window is disconnected.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Identity and capabilities learned from a peer's HI.
#[derive(Debug, Clone)]
pub struct PeerInfo {
    /// Peer node id
    pub id: String,
    /// Advertised capability map, opaque to the session layer
    pub capabilities: HashMap<String, serde_json::Value>,
}

/// Run the HI exchange on a fresh connection.
///
/// Returns the peer's identity plus any messages that arrived in the same
/// chunks as its HI; the caller must process those in order.
pub async fn exchange_hi(
    conn: &mut Connection,
    assembler: &mut FramedBuffer,
    node_id: &str,
    capabilities: &HashMap<String, serde_json::Value>,
    initiator: bool,
) -> Result<(PeerInfo, Vec<AssembledMessage>), SessionError> {
    tokio::time::timeout(HANDSHAKE_TIMEOUT, async {
        if initiator {
            send_hi(conn, node_id, capabilities).await?;
        }
        let (info, held) = recv_hi(conn, assembler).await?;
        if !initiator {
            send_hi(conn, node_id, capabilities).await?;
        }
        debug!(peer = %info.id, initiator, "handshake complete");
        Ok((info, held))
    })
    .await
    .map_err(|_| SessionError::HandshakeTimeout)?
}

async fn send_hi(
    conn: &mut Connection,
    node_id: &str,
    capabilities: &HashMap<String, serde_json::Value>,
) -> Result<(), SessionError> {
    let hi = Command::HI {
        id: node_id.to_string(),
        capabilities: capabilities.clone(),
    };
    let bytes = encode_command(Uuid::new_v4().as_u128(), &hi)?;
    conn.send(bytes).await
}

async fn recv_hi(
    conn: &mut Connection,
    assembler: &mut FramedBuffer,
) -> Result<(PeerInfo, Vec<AssembledMessage>), SessionError> {
    loop {
        let chunk = conn.recv().await?.ok_or(SessionError::Closed)?;
        let mut messages = assembler.feed(&chunk)?.into_iter();
        let Some(first) = messages.next() else {
            continue;
        };
        match first {
            AssembledMessage::Command {
                command: Command::HI { id, capabilities },
                ..
            } => {
                return Ok((PeerInfo { id, capabilities }, messages.collect()));
            }
            _ => {
                return Err(SessionError::Protocol(
                    "peer sent traffic before HI".to_string(),
                ));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer_url::{PeerUrl, Scheme};
    use crate::transport::{accept, connect, listen_tcp};
    use receptor_wire::encode_framed_message;

    #[tokio::test]
    async fn test_hi_exchange_both_directions() {
        let listener = listen_tcp("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let acceptor = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let (mut conn, _) = accept(Scheme::Rnp, tcp, None).await.unwrap();
            let mut asm = FramedBuffer::new();
            exchange_hi(&mut conn, &mut asm, "server-node", &HashMap::new(), false)
                .await
                .unwrap()
        });

        let url = PeerUrl::parse_peer(&format!("rnp://{}", addr)).unwrap();
        let mut conn = connect(&url, None).await.unwrap();
        let mut asm = FramedBuffer::new();
        let (peer, held) = exchange_hi(&mut conn, &mut asm, "client-node", &HashMap::new(), true)
            .await
            .unwrap();

        assert_eq!(peer.id, "server-node");
        assert!(held.is_empty());

        let (peer, _) = acceptor.await.unwrap();
        assert_eq!(peer.id, "client-node");
    }

    #[tokio::test]
    async fn test_traffic_before_hi_rejected() {
        let listener = listen_tcp("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let acceptor = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let (mut conn, _) = accept(Scheme::Rnp, tcp, None).await.unwrap();
            let mut asm = FramedBuffer::new();
            exchange_hi(&mut conn, &mut asm, "server-node", &HashMap::new(), false).await
        });

        // A framed message where HI was expected.
        let url = PeerUrl::parse_peer(&format!("rnp://{}", addr)).unwrap();
        let mut conn = connect(&url, None).await.unwrap();
        let header = receptor_wire::OuterHeader::new("rogue", "server-node");
        let bytes = encode_framed_message(1, &header, b"sneaky").unwrap();
        conn.send(bytes).await.unwrap();

        let err = acceptor.await.unwrap().unwrap_err();
        assert!(matches!(err, SessionError::Protocol(_)));
    }
}
