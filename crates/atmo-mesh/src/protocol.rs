use serde::{Deserialize, Serialize};

use atmo_core::Result;
use atmo_identity::PublicKey;

/// Messages exchanged between mesh peers.
///
/// Encoded as JSON with a `type` tag. Capability entries travel as raw JSON
/// values so a single malformed entry does not spoil the whole advert.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GossipMessage {
    /// Handshake. Carries the sender's membership token.
    Hello {
        node_id: String,
        name: String,
        /// Absent for nodes running on an unsigned identity.
        #[serde(default)]
        public_key: Option<PublicKey>,
        #[serde(default)]
        token: Option<String>,
        /// Set on the answer to a Hello, so it is not answered again.
        #[serde(default)]
        reply: bool,
    },
    /// Capability advert, the sender's own entries plus relayed ones.
    Capabilities {
        node_id: String,
        entries: Vec<serde_json::Value>,
    },
    /// Keepalive.
    Ping { node_id: String, timestamp: i64 },
    Pong { node_id: String, timestamp: i64 },
    /// Sent before leaving; the receiver forgets the sender's entries.
    Goodbye { node_id: String, reason: String },
}

impl GossipMessage {
    /// Node id the message claims to come from.
    pub fn sender(&self) -> &str {
        match self {
            GossipMessage::Hello { node_id, .. }
            | GossipMessage::Capabilities { node_id, .. }
            | GossipMessage::Ping { node_id, .. }
            | GossipMessage::Pong { node_id, .. }
            | GossipMessage::Goodbye { node_id, .. } => node_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            GossipMessage::Hello { .. } => "hello",
            GossipMessage::Capabilities { .. } => "capabilities",
            GossipMessage::Ping { .. } => "ping",
            GossipMessage::Pong { .. } => "pong",
            GossipMessage::Goodbye { .. } => "goodbye",
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
