//! Command message payloads exchanged in COMMAND frames.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One edge in a route advertisement: `(a, b, cost)` with `cost = None`
/// meaning "delete this edge".
pub type EdgeUpdate = (String, String, Option<u32>);

/// Small control exchanges carried in a single COMMAND frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd")]
pub enum Command {
    /// Handshake greeting, sent by both sides of a new connection
    HI {
        /// Node id of the sender
        id: String,
        /// Advertised capabilities
        #[serde(default)]
        capabilities: HashMap<String, serde_json::Value>,
    },
    /// Route advertisement gossip
    ROUTE {
        /// Node id of the advertising neighbor
        id: String,
        /// Advertised edges
        edges: Vec<EdgeUpdate>,
        /// Node ids already informed of this advertisement
        #[serde(default)]
        seen: Vec<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hi_wire_shape() {
        let cmd = Command::HI {
            id: "node-a".to_string(),
            capabilities: HashMap::new(),
        };
        let json = serde_json::to_value(&cmd).unwrap();
        assert_eq!(json["cmd"], "HI");
        assert_eq!(json["id"], "node-a");
    }

    #[test]
    fn test_route_roundtrip() {
        let cmd = Command::ROUTE {
            id: "b".to_string(),
            edges: vec![
                ("a".to_string(), "b".to_string(), Some(1)),
                ("b".to_string(), "c".to_string(), None),
            ],
            seen: vec!["a".to_string()],
        };

        let json = serde_json::to_string(&cmd).unwrap();
        let back: Command = serde_json::from_str(&json).unwrap();
        assert_eq!(cmd, back);
    }

    #[test]
    fn test_unknown_command_rejected() {
        let err = serde_json::from_str::<Command>("{\"cmd\":\"BOGUS\"}");
        assert!(err.is_err());
    }
}
