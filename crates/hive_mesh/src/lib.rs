//! Hive Mesh — self-organizing peer mesh over WebSocket connections.
//!
//! Every node runs a server and at most one outbound client. Nodes discover
//! multi-hop routes to each other by probing, keep the shortest route per
//! destination, and relay messages hop by hop without a central broker.
//!
//! # Architecture
//!
//! - **Connection**: one WebSocket session; exchanges node ids in a
//!   handshake before any envelope is accepted.
//! - **NetServer / NetClient**: accept gated inbound sessions; keep one
//!   outbound session alive with retry and failover.
//! - **MeshRouter**: owns all connections, rebuilds the routing table on
//!   every topology change, relays and dispatches envelopes.
//! - **Bridge**: lets worker processes share the coordinator's node over a
//!   line-delimited JSON pipe and call named handlers across processes.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use hive_mesh::{MeshConfig, MeshRouter, TopologyEvent};
//!
//! # async fn example() -> hive_mesh::Result<()> {
//! let mut config = MeshConfig::default();
//! config.node_name = Some("worker-1".into());
//! config.peers = vec!["ws://10.0.0.2:8080".parse()?];
//!
//! let router = MeshRouter::new(config);
//! let mut events = router.subscribe();
//! router.start().await?;
//!
//! router.broadcast(serde_json::json!({"hello": "mesh"}));
//! while let Some(TopologyEvent::Message(message)) = events.recv().await {
//!     message.send_back(serde_json::json!("ack"))?;
//! }
//! router.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod bridge;
pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod identity;
pub mod logging;
pub mod message;
pub mod pending;
pub mod router;
pub mod routing;
pub mod server;

// ── Re-exports for convenience ──────────────────────────────────────────

pub use bridge::{
    BridgeAction, BridgeCoordinator, BridgeMessage, BridgeWorker, CallHandler, CallOutcome, CallReply, CallResults,
    Responder, WorkerEvent,
};
pub use client::{ClientConfig, ClientState, NetClient};
pub use config::{MeshConfig, PeerUrl};
pub use connection::{Connection, ConnectionObserver};
pub use error::{MeshError, Result};
pub use identity::NodeId;
pub use message::{Envelope, Frame, MessageKind};
pub use router::{IncomingMessage, MeshRouter, TopologyEvent, TopologyObserver};
pub use routing::{NodeNameRegistry, Route, RoutingTable};
pub use server::{NetServer, ServerConfig};
