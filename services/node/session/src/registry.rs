//! Control-frame channels for currently connected peers.

use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::debug;

/// Map from connected peer id to its worker's control-frame channel.
///
/// Owned by the node event loop; entries are added on `Connected` and
/// removed on `Disconnected`. Control frames (ROUTE, HI) bypass the durable
/// queue because they describe current state and are regenerated on
/// reconnect.
#[derive(Default)]
pub struct ConnectionRegistry {
    channels: DashMap<String, mpsc::Sender<Bytes>>,
}

impl ConnectionRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a peer's control channel, replacing any stale one.
    pub fn register(&self, peer_id: &str, control: mpsc::Sender<Bytes>) {
        if self.channels.insert(peer_id.to_string(), control).is_some() {
            debug!(peer = peer_id, "replaced stale control channel");
        }
    }

    /// Drop a peer's control channel; closing it lets the worker's writer
    /// wind down.
    pub fn unregister(&self, peer_id: &str) {
        self.channels.remove(peer_id);
    }

    /// True while the peer has a live connection.
    pub fn is_connected(&self, peer_id: &str) -> bool {
        self.channels.contains_key(peer_id)
    }

    /// Currently connected peer ids.
    pub fn peers(&self) -> Vec<String> {
        self.channels.iter().map(|e| e.key().clone()).collect()
    }

    /// Push a control frame to one peer. Returns false when the peer is not
    /// connected or its worker has gone away.
    pub async fn send_control(&self, peer_id: &str, bytes: Bytes) -> bool {
        let Some(tx) = self.channels.get(peer_id).map(|e| e.value().clone()) else {
            return false;
        };
        tx.send(bytes).await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_register_send_unregister() {
        let registry = ConnectionRegistry::new();
        let (tx, mut rx) = mpsc::channel(4);

        registry.register("peer-a", tx);
        assert!(registry.is_connected("peer-a"));
        assert!(registry.send_control("peer-a", Bytes::from_static(b"route")).await);
        assert_eq!(&rx.recv().await.unwrap()[..], b"route");

        registry.unregister("peer-a");
        assert!(!registry.is_connected("peer-a"));
        assert!(!registry.send_control("peer-a", Bytes::from_static(b"route")).await);
    }
}
