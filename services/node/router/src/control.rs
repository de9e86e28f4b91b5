//! Built-in `receptor` control directives.

use crate::work::WorkHandler;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use futures::StreamExt;
use receptor_wire::InnerEnvelope;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// One routing table entry: the first hop and the total path cost.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteEntry {
    /// First hop toward the destination
    pub via: String,
    /// Cost of the whole path
    pub cost: u32,
}

/// Snapshot returned by `receptor:status`, YAML on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeStatus {
    /// Local node id
    pub node_id: String,
    /// Every node reachable through the mesh
    pub known_nodes: Vec<String>,
    /// Destination to (first hop, path cost) table
    pub routing_table: BTreeMap<String, RouteEntry>,
    /// Directly connected peers
    pub connections: Vec<String>,
    /// Messages waiting in durable queues
    pub queued_messages: usize,
    /// Routing counters
    pub stats: crate::router::StatsSnapshot,
}

/// Supplies the live status snapshot to the control handler.
pub trait StatusProvider: Send + Sync {
    /// Current node status.
    fn snapshot(&self) -> NodeStatus;
}

#[derive(Debug, Serialize, Deserialize)]
struct PingBody {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    initial_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    response_time: Option<DateTime<Utc>>,
}

/// Handler for the `receptor` namespace: `ping` and `status`.
pub struct ReceptorControl {
    status: Arc<dyn StatusProvider>,
}

impl ReceptorControl {
    /// Control handler reading status from `status`.
    pub fn new(status: Arc<dyn StatusProvider>) -> Self {
        Self { status }
    }

    fn pong(directive: &InnerEnvelope) -> anyhow::Result<Bytes> {
        // The caller's initial_time rides along so it can compute the
        // round trip; with an empty or unparseable payload the envelope
        // timestamp serves instead.
        let initial_time = serde_json::from_slice::<PingBody>(&directive.raw_payload)
            .ok()
            .and_then(|body| body.initial_time)
            .unwrap_or(directive.timestamp);
        let body = PingBody {
            initial_time: Some(initial_time),
            response_time: Some(Utc::now()),
        };
        Ok(Bytes::from(serde_json::to_vec(&body)?))
    }
}

#[async_trait]
impl WorkHandler for ReceptorControl {
    async fn start(
        &self,
        action: &str,
        directive: &InnerEnvelope,
    ) -> anyhow::Result<BoxStream<'static, anyhow::Result<Bytes>>> {
        let reply = match action {
            "ping" => Self::pong(directive)?,
            "status" => Bytes::from(serde_yaml::to_string(&self.status.snapshot())?),
            other => anyhow::bail!("unknown control action {other:?}"),
        };
        Ok(futures::stream::once(async move { Ok(reply) }).boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::StatsSnapshot;

    struct Fixed;

    impl StatusProvider for Fixed {
        fn snapshot(&self) -> NodeStatus {
            NodeStatus {
                node_id: "a".to_string(),
                known_nodes: vec!["b".to_string()],
                routing_table: [(
                    "b".to_string(),
                    RouteEntry {
                        via: "b".to_string(),
                        cost: 1,
                    },
                )]
                .into_iter()
                .collect(),
                connections: vec!["b".to_string()],
                queued_messages: 0,
                stats: StatsSnapshot::default(),
            }
        }
    }

    fn ping_directive(payload: Bytes) -> InnerEnvelope {
        InnerEnvelope::directive("b", "a", "receptor:ping", payload)
    }

    #[tokio::test]
    async fn test_ping_echoes_initial_time() {
        let control = ReceptorControl::new(Arc::new(Fixed));
        let sent_at = Utc::now();
        let payload = serde_json::to_vec(&PingBody {
            initial_time: Some(sent_at),
            response_time: None,
        })
        .unwrap();

        let directive = ping_directive(Bytes::from(payload));
        let mut stream = control.start("ping", &directive).await.unwrap();
        let reply = stream.next().await.unwrap().unwrap();
        assert!(stream.next().await.is_none());

        let body: PingBody = serde_json::from_slice(&reply).unwrap();
        assert_eq!(body.initial_time, Some(sent_at));
        assert!(body.response_time.is_some());
    }

    #[tokio::test]
    async fn test_ping_falls_back_to_envelope_timestamp() {
        let control = ReceptorControl::new(Arc::new(Fixed));
        let directive = ping_directive(Bytes::new());
        let mut stream = control.start("ping", &directive).await.unwrap();
        let reply = stream.next().await.unwrap().unwrap();
        let body: PingBody = serde_json::from_slice(&reply).unwrap();
        assert_eq!(body.initial_time, Some(directive.timestamp));
        assert!(body.response_time.is_some());
    }

    #[tokio::test]
    async fn test_status_is_yaml() {
        let control = ReceptorControl::new(Arc::new(Fixed));
        let directive = InnerEnvelope::directive("b", "a", "receptor:status", Bytes::new());
        let mut stream = control.start("status", &directive).await.unwrap();
        let reply = stream.next().await.unwrap().unwrap();

        let back: NodeStatus = serde_yaml::from_slice(&reply).unwrap();
        assert_eq!(back.node_id, "a");
        assert_eq!(
            back.routing_table.get("b"),
            Some(&RouteEntry {
                via: "b".to_string(),
                cost: 1,
            })
        );
    }

    #[tokio::test]
    async fn test_unknown_action_is_error() {
        let control = ReceptorControl::new(Arc::new(Fixed));
        let directive = InnerEnvelope::directive("b", "a", "receptor:reboot", Bytes::new());
        let err = match control.start("reboot", &directive).await {
            Ok(_) => panic!("expected an error for unknown action"),
            Err(e) => e,
        };
        assert!(err.to_string().contains("reboot"));
    }
}
