//! Directive execution: handler registry and response streaming.

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures::stream::BoxStream;
use futures::StreamExt;
use receptor_wire::InnerEnvelope;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, warn};

/// Executes one namespace of directives.
///
/// `start` returns a lazy finite stream of response chunks; each chunk
/// becomes one serial-numbered response envelope. Returning an error, or
/// yielding one from the stream, terminates the reply with a non-zero `eof`
/// carrying the error text.
#[async_trait]
pub trait WorkHandler: Send + Sync {
    /// Begin executing `action` for the given directive envelope.
    async fn start(
        &self,
        action: &str,
        directive: &InnerEnvelope,
    ) -> anyhow::Result<BoxStream<'static, anyhow::Result<Bytes>>>;
}

/// Routes directives to the handler registered for their namespace.
pub struct WorkDispatcher {
    node_id: String,
    handlers: DashMap<String, Arc<dyn WorkHandler>>,
}

impl WorkDispatcher {
    /// Empty dispatcher for the node `node_id`.
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            handlers: DashMap::new(),
        }
    }

    /// Register the handler for one directive namespace.
    pub fn register(&self, namespace: impl Into<String>, handler: Arc<dyn WorkHandler>) {
        self.handlers.insert(namespace.into(), handler);
    }

    /// Registered namespaces, for the status snapshot.
    pub fn namespaces(&self) -> Vec<String> {
        self.handlers.iter().map(|e| e.key().clone()).collect()
    }

    /// Execute a directive, emitting its response stream on `replies`.
    ///
    /// The work runs on its own task; responses carry `serial` starting at 1
    /// and the stream always ends with exactly one `eof`.
    pub fn dispatch(&self, directive: InnerEnvelope, replies: mpsc::Sender<InnerEnvelope>) {
        let node_id = self.node_id.clone();
        let origin = directive.sender.clone();
        let directive_id = directive.message_id.clone();

        let reply_eof = |serial: u64, code: i64, text: String| {
            InnerEnvelope::eof(&node_id, &origin, &directive_id, serial, code, Bytes::from(text))
        };

        let Some((namespace, action)) = directive.split_directive() else {
            warn!(directive = ?directive.directive, "malformed directive");
            let eof = reply_eof(1, 1, format!("malformed directive {:?}", directive.directive));
            tokio::spawn(async move {
                let _ = replies.send(eof).await;
            });
            return;
        };

        let Some(handler) = self.handlers.get(namespace).map(|h| h.clone()) else {
            warn!(namespace, "no handler for directive namespace");
            let eof = reply_eof(1, 1, format!("unknown directive namespace {namespace:?}"));
            tokio::spawn(async move {
                let _ = replies.send(eof).await;
            });
            return;
        };

        let action = action.to_string();
        let ttl = directive.ttl;
        debug!(%directive_id, namespace, action, "dispatching directive");

        tokio::spawn(async move {
            let mut serial: u64 = 0;
            let outcome = {
                let stream_all = async {
                    let mut stream = handler.start(&action, &directive).await?;
                    while let Some(item) = stream.next().await {
                        let chunk = item?;
                        serial += 1;
                        let response = InnerEnvelope::response(
                            &node_id,
                            &origin,
                            &directive_id,
                            serial,
                            chunk,
                        );
                        if replies.send(response).await.is_err() {
                            anyhow::bail!("node loop closed");
                        }
                    }
                    Ok::<(), anyhow::Error>(())
                };
                match ttl {
                    Some(secs) => match timeout(Duration::from_secs(secs), stream_all).await {
                        Ok(result) => result,
                        Err(_) => Err(anyhow::anyhow!("ttl of {secs}s expired")),
                    },
                    None => stream_all.await,
                }
            };

            let eof = match outcome {
                Ok(()) => InnerEnvelope::eof(
                    &node_id,
                    &origin,
                    &directive_id,
                    serial + 1,
                    0,
                    Bytes::new(),
                ),
                Err(e) => {
                    warn!(%directive_id, error = %e, "directive handler failed");
                    InnerEnvelope::eof(
                        &node_id,
                        &origin,
                        &directive_id,
                        serial + 1,
                        1,
                        Bytes::from(e.to_string()),
                    )
                }
            };
            let _ = replies.send(eof).await;
        });
    }
}
