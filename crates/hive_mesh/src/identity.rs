//! Node identity.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifies a mesh node regardless of which transport reaches it.
///
/// Generated once when a [`MeshRouter`](crate::MeshRouter) is built and
/// handed to the server and client it owns; never changes afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    /// Generate a new random node ID (UUID v4).
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Create a NodeId from an existing string.
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Return the inner string representation.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_id_generation() {
        let a = NodeId::generate();
        let b = NodeId::generate();
        assert_ne!(a, b);
        assert!(!a.as_str().is_empty());
    }

    #[test]
    fn test_node_id_from_string() {
        let id = NodeId::from_string("node-123");
        assert_eq!(id.as_str(), "node-123");
        assert_eq!(format!("{id}"), "node-123");
    }

    #[test]
    fn test_node_id_serializes_as_plain_string() {
        let id = NodeId::from_string("abc");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"abc\"");
        let back: NodeId = serde_json::from_str("\"abc\"").unwrap();
        assert_eq!(back, id);
    }
}
