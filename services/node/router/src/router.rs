//! Per-message routing: forward toward the next hop or deliver locally.

use crate::registry::ResponseRegistry;
use crate::security::SecurityManager;
use crate::RouterError;
use bytes::Bytes;
use receptor_mesh::MeshGraph;
use receptor_queue::QueueSet;
use receptor_wire::{
    encode_framed_message, FramedMessage, InnerEnvelope, MessageType, OuterHeader, SignedEnvelope,
};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Routing counters, shared across the node.
#[derive(Debug, Default)]
pub struct RouterStats {
    /// Locally originated messages handed to the router
    pub sent: AtomicU64,
    /// Messages delivered to this node
    pub delivered: AtomicU64,
    /// Transit messages forwarded toward their recipient
    pub forwarded: AtomicU64,
    /// Messages dropped (unroutable transit, failed verification)
    pub dropped: AtomicU64,
}

impl RouterStats {
    /// Point-in-time copy of the counters.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            sent: self.sent.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            forwarded: self.forwarded.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

/// Serializable copy of [`RouterStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    /// Locally originated messages
    pub sent: u64,
    /// Messages delivered locally
    pub delivered: u64,
    /// Messages forwarded in transit
    pub forwarded: u64,
    /// Messages dropped
    pub dropped: u64,
}

/// Routes framed messages using the mesh graph.
///
/// Messages addressed to this node are verified and delivered: directives go
/// to the dispatcher through the `directives` channel, responses and `eof`s
/// to the response registry. Everything else is re-framed with this node
/// appended to `route_list` and enqueued on the next hop's durable queue.
pub struct MessageRouter {
    node_id: String,
    graph: Arc<Mutex<MeshGraph>>,
    queues: Arc<QueueSet>,
    responses: Arc<ResponseRegistry>,
    security: Arc<dyn SecurityManager>,
    directives: mpsc::Sender<InnerEnvelope>,
    stats: Arc<RouterStats>,
}

impl MessageRouter {
    /// Router for the node `node_id`.
    pub fn new(
        node_id: impl Into<String>,
        graph: Arc<Mutex<MeshGraph>>,
        queues: Arc<QueueSet>,
        responses: Arc<ResponseRegistry>,
        security: Arc<dyn SecurityManager>,
        directives: mpsc::Sender<InnerEnvelope>,
        stats: Arc<RouterStats>,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            graph,
            queues,
            responses,
            security,
            directives,
            stats,
        }
    }

    /// The shared counters.
    pub fn stats(&self) -> &Arc<RouterStats> {
        &self.stats
    }

    /// Sign and route a locally originated envelope.
    pub async fn send(&self, envelope: InnerEnvelope) -> Result<(), RouterError> {
        let recipient = envelope.recipient.clone();
        let signed = self.security.sign(envelope)?;
        let payload = Bytes::from(serde_json::to_vec(&signed)?);
        self.stats.sent.fetch_add(1, Ordering::Relaxed);

        if recipient == self.node_id {
            return self.deliver(signed).await;
        }

        let message = FramedMessage {
            msg_id: Uuid::new_v4().as_u128(),
            header: OuterHeader::new(&self.node_id, &recipient),
            payload,
        };
        self.route(message).await
    }

    /// Route one assembled message, forwarding or delivering as addressed.
    pub async fn route(&self, message: FramedMessage) -> Result<(), RouterError> {
        if message.header.recipient == self.node_id {
            let signed: SignedEnvelope = serde_json::from_slice(&message.payload)?;
            if let Err(e) = self
                .security
                .verify(&signed)
                .and_then(|()| self.security.verify_node(&signed))
            {
                warn!(sender = %signed.m.sender, error = %e, "dropping unverified message");
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                return Ok(());
            }
            return self.deliver(signed).await;
        }

        let next_hop = {
            let graph = self.graph.lock().unwrap_or_else(|e| e.into_inner());
            graph.next_hop(&message.header.recipient).map(str::to_string)
        };

        match next_hop {
            Some(hop) => self.forward(message, &hop).await,
            None => self.unroutable(message).await,
        }
    }

    async fn forward(&self, mut message: FramedMessage, hop: &str) -> Result<(), RouterError> {
        message.header.route_list.push(self.node_id.clone());
        debug!(
            recipient = %message.header.recipient,
            hop,
            hops = message.header.route_list.len(),
            "forwarding message"
        );
        let bytes = encode_framed_message(message.msg_id, &message.header, &message.payload)?;
        self.queues.for_peer(hop)?.put(&bytes)?;
        self.stats.forwarded.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn deliver(&self, signed: SignedEnvelope) -> Result<(), RouterError> {
        self.stats.delivered.fetch_add(1, Ordering::Relaxed);
        match signed.m.message_type {
            MessageType::Directive => self
                .directives
                .send(signed.m)
                .await
                .map_err(|_| RouterError::Shutdown),
            MessageType::Response | MessageType::Eof => {
                self.responses.deliver(signed.m).await;
                Ok(())
            }
        }
    }

    /// No next hop toward the recipient. A message this node originated gets
    /// a synthetic routing `eof` on its response stream; transit messages
    /// are dropped with a warning.
    async fn unroutable(&self, message: FramedMessage) -> Result<(), RouterError> {
        let recipient = message.header.recipient.clone();
        if message.header.sender != self.node_id {
            warn!(
                sender = %message.header.sender,
                %recipient,
                "dropping transit message with no route"
            );
            self.stats.dropped.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }

        let signed: SignedEnvelope = serde_json::from_slice(&message.payload)?;
        warn!(%recipient, message_id = %signed.m.message_id, "no route for local message");
        let eof = InnerEnvelope::eof(
            &self.node_id,
            &self.node_id,
            &signed.m.message_id,
            1,
            1,
            Bytes::from(format!("no route to node {recipient:?}")),
        );
        self.responses.deliver(eof).await;
        Ok(())
    }
}
