//! Mesh error types.

use std::time::Duration;

use crate::identity::NodeId;

/// Errors that can occur in the hive_mesh crate.
#[derive(Debug, thiserror::Error)]
pub enum MeshError {
    /// A transport-level error (WebSocket connect/send/receive).
    #[error("Transport error: {0}")]
    Transport(String),

    /// No route from the local node reaches the requested target.
    #[error("Route to node '{target}' not found on node '{local}'")]
    RouteNotFound { target: String, local: NodeId },

    /// JSON serialization / deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A correlated call did not complete before its deadline.
    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    /// The first-hop connection of a pending call went away.
    #[error("Connection to {0} lost")]
    ConnectionLost(String),

    /// The remote node answered with an error.
    #[error("Remote error: {0}")]
    Remote(String),

    /// The router is not running.
    #[error("Node not running")]
    NotRunning,

    /// Invalid configuration value.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Inter-process bridge failure.
    #[error("Bridge error: {0}")]
    Bridge(String),

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = MeshError> = std::result::Result<T, E>;
