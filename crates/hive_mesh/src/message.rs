//! Wire protocol — handshake frames and routed envelopes.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::identity::NodeId;

/// The kind of message carried in an [`Envelope`] (`TYPE` on the wire).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageKind {
    /// Application payload delivered to local subscribers.
    Broadcast,
    /// Asks the route endpoint for its other direct neighbours.
    TraceProbe,
    /// Announces the sender's human-readable name.
    RegisterNode,
    /// Result (or error) of a correlated request.
    MessageReturn,
    /// Tells the receiver its routing table is stale and must be rebuilt.
    UpdateNodeList,
}

/// A routed message.
///
/// `route` holds the hops still ahead of the envelope; each relaying node
/// consumes one. `path` holds the hops already behind it, so a reply can
/// retrace the way back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct Envelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(rename = "TYPE")]
    pub kind: MessageKind,
    pub sender: NodeId,
    #[serde(default)]
    pub route: Vec<NodeId>,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub path: Vec<NodeId>,
}

impl Envelope {
    pub fn new(kind: MessageKind, sender: NodeId, route: Vec<NodeId>, data: Value) -> Self {
        Self {
            message_id: None,
            kind,
            sender,
            route,
            data,
            error: None,
            path: Vec::new(),
        }
    }

    pub fn with_message_id(mut self, id: impl Into<String>) -> Self {
        self.message_id = Some(id.into());
        self
    }

    /// Whether the sender is waiting for a `MESSAGE_RETURN`.
    pub fn expects_reply(&self) -> bool {
        self.message_id.is_some() && self.kind != MessageKind::MessageReturn
    }

    /// The way back to the original sender, nearest hop first.
    pub fn return_route(&self) -> Vec<NodeId> {
        self.path.iter().rev().cloned().collect()
    }

    /// Build the successful `MESSAGE_RETURN` for this request.
    pub fn reply(&self, from: NodeId, data: Value) -> Self {
        Self {
            message_id: self.message_id.clone(),
            kind: MessageKind::MessageReturn,
            sender: from,
            route: self.return_route(),
            data,
            error: None,
            path: Vec::new(),
        }
    }

    /// Build a failed `MESSAGE_RETURN` for this request.
    pub fn error_reply(&self, from: NodeId, error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..self.reply(from, Value::Null)
        }
    }
}

/// One text frame on a mesh connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Frame {
    /// First frame in each direction: the sender's node id.
    Handshake {
        #[serde(rename = "MESH_HANDSHAKE")]
        node_id: NodeId,
    },
    Envelope(Envelope),
}

impl Frame {
    pub fn handshake(node_id: NodeId) -> Self {
        Self::Handshake { node_id }
    }

    /// Serialize the frame to a JSON string for transmission.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize a frame from a JSON string.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

impl From<Envelope> for Frame {
    fn from(envelope: Envelope) -> Self {
        Self::Envelope(envelope)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
