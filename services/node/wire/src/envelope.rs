//! Envelope types carried inside frames.
//!
//! The *outer header* travels in the HEADER frame and is consulted at every
//! hop; the *inner envelope* is the application-level record inside the
//! payload, normally wrapped in a [`SignedEnvelope`].

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Per-hop routing header accompanying a payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OuterHeader {
    /// Originating node id
    pub sender: String,
    /// Final destination node id
    pub recipient: String,
    /// Breadcrumb of node ids the message has been forwarded through
    #[serde(default)]
    pub route_list: Vec<String>,
}

impl OuterHeader {
    /// Create an outer header for a locally originated message
    pub fn new(sender: impl Into<String>, recipient: impl Into<String>) -> Self {
        Self {
            sender: sender.into(),
            recipient: recipient.into(),
            route_list: Vec::new(),
        }
    }
}

/// A fully assembled framed message: outer header plus opaque payload.
#[derive(Debug, Clone)]
pub struct FramedMessage {
    /// 128-bit link-level message id
    pub msg_id: u128,
    /// Routing header from the HEADER frame
    pub header: OuterHeader,
    /// Opaque payload bytes, usually a serialized [`SignedEnvelope`]
    pub payload: Bytes,
}

/// Inner envelope message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    /// Application request addressed to a node
    Directive,
    /// One part of a response stream
    Response,
    /// Final element of a response stream
    Eof,
}

/// Application-level message record.
///
/// Unused fields are omitted from the JSON form; `raw_payload` is base64
/// encoded on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InnerEnvelope {
    /// Unique id of this message
    pub message_id: String,
    /// Originating node id
    pub sender: String,
    /// Destination node id
    pub recipient: String,
    /// Message classification
    pub message_type: MessageType,
    /// Creation time, ISO-8601 UTC
    pub timestamp: DateTime<Utc>,
    /// Opaque payload bytes
    #[serde(with = "base64_bytes", default)]
    pub raw_payload: Bytes,
    /// `namespace:action`, only for directives
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub directive: Option<String>,
    /// Correlating directive id, only for responses and eof
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub in_response_to: Option<String>,
    /// Optional handler time-to-live in seconds
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub ttl: Option<u64>,
    /// Monotonically increasing ordinal within a response stream
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub serial: Option<u64>,
    /// Termination code, only for eof (0 = success)
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub code: Option<i64>,
}

impl InnerEnvelope {
    /// Build a directive envelope addressed to `recipient`.
    pub fn directive(
        sender: impl Into<String>,
        recipient: impl Into<String>,
        directive: impl Into<String>,
        payload: Bytes,
    ) -> Self {
        Self {
            message_id: Uuid::new_v4().to_string(),
            sender: sender.into(),
            recipient: recipient.into(),
            message_type: MessageType::Directive,
            timestamp: Utc::now(),
            raw_payload: payload,
            directive: Some(directive.into()),
            in_response_to: None,
            ttl: None,
            serial: None,
            code: None,
        }
    }

    /// Build one response part correlating to `in_response_to`.
    pub fn response(
        sender: impl Into<String>,
        recipient: impl Into<String>,
        in_response_to: impl Into<String>,
        serial: u64,
        payload: Bytes,
    ) -> Self {
        Self {
            message_id: Uuid::new_v4().to_string(),
            sender: sender.into(),
            recipient: recipient.into(),
            message_type: MessageType::Response,
            timestamp: Utc::now(),
            raw_payload: payload,
            directive: None,
            in_response_to: Some(in_response_to.into()),
            ttl: None,
            serial: Some(serial),
            code: None,
        }
    }

    /// Build the terminating eof for a response stream.
    pub fn eof(
        sender: impl Into<String>,
        recipient: impl Into<String>,
        in_response_to: impl Into<String>,
        serial: u64,
        code: i64,
        payload: Bytes,
    ) -> Self {
        Self {
            message_id: Uuid::new_v4().to_string(),
            sender: sender.into(),
            recipient: recipient.into(),
            message_type: MessageType::Eof,
            timestamp: Utc::now(),
            raw_payload: payload,
            directive: None,
            in_response_to: Some(in_response_to.into()),
            ttl: None,
            serial: Some(serial),
            code: Some(code),
        }
    }

    /// Split the directive into `(namespace, action)`.
    pub fn split_directive(&self) -> Option<(&str, &str)> {
        let directive = self.directive.as_deref()?;
        let (ns, action) = directive.split_once(':')?;
        Some((ns, action))
    }
}

/// Signed wrapper around an inner envelope.
///
/// The signature and certificate fields are produced and consumed by the
/// security manager; the no-op implementation leaves them empty.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedEnvelope {
    /// The inner envelope
    pub m: InnerEnvelope,
    /// Base64-encoded signature over the envelope JSON
    #[serde(default)]
    pub s: String,
    /// PEM certificate of the signer
    #[serde(default)]
    pub c: String,
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded)
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outer_header_json_shape() {
        let header = OuterHeader::new("a", "c");
        let json = serde_json::to_value(&header).unwrap();
        assert_eq!(json["sender"], "a");
        assert_eq!(json["recipient"], "c");
        assert_eq!(json["route_list"], serde_json::json!([]));
    }

    #[test]
    fn test_inner_envelope_roundtrip() {
        let env = InnerEnvelope::directive("a", "b", "receptor:ping", Bytes::from_static(b"\x00\x01"));
        let json = serde_json::to_string(&env).unwrap();
        let back: InnerEnvelope = serde_json::from_str(&json).unwrap();

        assert_eq!(back.message_id, env.message_id);
        assert_eq!(back.message_type, MessageType::Directive);
        assert_eq!(back.directive.as_deref(), Some("receptor:ping"));
        assert_eq!(back.raw_payload, env.raw_payload);
        assert!(back.in_response_to.is_none());
    }

    #[test]
    fn test_message_type_wire_names() {
        assert_eq!(
            serde_json::to_string(&MessageType::Directive).unwrap(),
            "\"directive\""
        );
        assert_eq!(serde_json::to_string(&MessageType::Eof).unwrap(), "\"eof\"");
    }

    #[test]
    fn test_split_directive() {
        let env = InnerEnvelope::directive("a", "b", "demo:echo", Bytes::new());
        assert_eq!(env.split_directive(), Some(("demo", "echo")));

        let mut bad = env.clone();
        bad.directive = Some("nocolon".to_string());
        assert_eq!(bad.split_directive(), None);
    }

    #[test]
    fn test_signed_envelope_defaults() {
        let env = InnerEnvelope::directive("a", "b", "x:y", Bytes::new());
        let json = format!("{{\"m\":{}}}", serde_json::to_string(&env).unwrap());
        let signed: SignedEnvelope = serde_json::from_str(&json).unwrap();
        assert!(signed.s.is_empty());
        assert!(signed.c.is_empty());
    }
}
