//! Correlation of response streams to outstanding directives.

use dashmap::DashMap;
use receptor_wire::{InnerEnvelope, MessageType};
use tokio::sync::mpsc;
use tracing::{debug, warn};

const STREAM_DEPTH: usize = 64;

/// Maps outstanding directive ids to the channels awaiting their responses.
///
/// An `eof` envelope terminates its stream: it is delivered like any other
/// response and the entry is removed so later stragglers are dropped.
#[derive(Debug, Default)]
pub struct ResponseRegistry {
    streams: DashMap<String, mpsc::Sender<InnerEnvelope>>,
}

impl ResponseRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a response stream for the directive `message_id`.
    pub fn register(&self, message_id: &str) -> mpsc::Receiver<InnerEnvelope> {
        let (tx, rx) = mpsc::channel(STREAM_DEPTH);
        self.streams.insert(message_id.to_string(), tx);
        rx
    }

    /// Drop the stream for `message_id` without delivering anything.
    pub fn forget(&self, message_id: &str) {
        self.streams.remove(message_id);
    }

    /// Number of directives still awaiting their `eof`.
    pub fn outstanding(&self) -> usize {
        self.streams.len()
    }

    /// Deliver a response or `eof` to the stream it correlates to.
    ///
    /// Unknown correlation ids are logged and dropped; they are expected
    /// after a stream's receiver went away or its `eof` already arrived.
    pub async fn deliver(&self, envelope: InnerEnvelope) {
        let Some(correlated) = envelope.in_response_to.clone() else {
            warn!(
                message_id = %envelope.message_id,
                "response without in_response_to dropped"
            );
            return;
        };

        let Some(stream) = self.streams.get(&correlated).map(|s| s.clone()) else {
            warn!(in_response_to = %correlated, "response for unknown directive dropped");
            return;
        };

        let terminal = envelope.message_type == MessageType::Eof;
        if stream.send(envelope).await.is_err() {
            debug!(in_response_to = %correlated, "response stream receiver gone");
            self.streams.remove(&correlated);
            return;
        }
        if terminal {
            self.streams.remove(&correlated);
        }
    }
}
