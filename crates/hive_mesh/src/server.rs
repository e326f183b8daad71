//! Inbound side of the mesh: accepting and gating WebSocket sessions.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tracing::{debug, error, info};

use crate::config::MeshConfig;
use crate::connection::{Connection, ConnectionId, ConnectionObserver, Direction};
use crate::error::MeshError;
use crate::identity::NodeId;
use crate::message::{Envelope, Frame};

/// Request header carrying the shared secret.
pub const SECRET_HEADER: &str = "net-secret";

/// Decides whether an upgrade request with the given `Origin` is accepted.
pub type OriginFilter = Arc<dyn Fn(Option<&str>) -> bool + Send + Sync>;

/// Settings for [`NetServer`].
#[derive(Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub allow_origin: OriginFilter,
    pub secret: Option<String>,
}

impl ServerConfig {
    /// Derive server settings from the node configuration.
    pub fn from_mesh(config: &MeshConfig) -> Self {
        let origins = config.clone();
        Self {
            listen_addr: config.listen_addr,
            allow_origin: Arc::new(move |origin| origins.allows_origin(origin)),
            secret: config.secret.clone(),
        }
    }
}

type ConnectionSet = Arc<RwLock<HashMap<ConnectionId, Connection>>>;

/// Accepts inbound sessions and keeps the set of live ones.
///
/// Every accepted session is greeted with this node's handshake and reported
/// to the downstream observer.
pub struct NetServer {
    node_id: NodeId,
    config: ServerConfig,
    connections: ConnectionSet,
    downstream: Arc<dyn ConnectionObserver>,
    local_addr: Option<SocketAddr>,
    shutdown_tx: Option<broadcast::Sender<()>>,
}

impl NetServer {
    pub fn new(node_id: NodeId, config: ServerConfig, downstream: Arc<dyn ConnectionObserver>) -> Self {
        Self {
            node_id,
            config,
            connections: Arc::new(RwLock::new(HashMap::new())),
            downstream,
            local_addr: None,
            shutdown_tx: None,
        }
    }

    /// Bind the listener and start accepting. Returns the bound address.
    pub async fn start(&mut self) -> Result<SocketAddr, MeshError> {
        if let Some(addr) = self.local_addr {
            return Ok(addr);
        }

        let listener = TcpListener::bind(self.config.listen_addr).await?;
        let addr = listener.local_addr()?;
        info!("Mesh server listening on {addr}");

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        tokio::spawn(accept_loop(
            listener,
            self.node_id.clone(),
            self.config.clone(),
            Arc::clone(&self.connections),
            Arc::clone(&self.downstream),
            shutdown_rx,
        ));

        self.shutdown_tx = Some(shutdown_tx);
        self.local_addr = Some(addr);
        Ok(addr)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Snapshot of the live inbound connections.
    pub fn connections(&self) -> Vec<Connection> {
        self.connections.read().values().cloned().collect()
    }

    /// Stop accepting and close every inbound connection.
    pub fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        let drained: Vec<Connection> = self.connections.write().drain().map(|(_, c)| c).collect();
        for conn in drained {
            debug!("Closing inbound connection from {}", conn.remote_addr());
            conn.close();
        }
        self.local_addr = None;
    }
}

impl Drop for NetServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    node_id: NodeId,
    config: ServerConfig,
    connections: ConnectionSet,
    downstream: Arc<dyn ConnectionObserver>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let tracker: Arc<dyn ConnectionObserver> = Arc::new(InboundTracker {
        connections: Arc::clone(&connections),
        downstream: Arc::clone(&downstream),
    });

    loop {
        tokio::select! {
            accept_result = listener.accept() => {
                match accept_result {
                    Ok((stream, peer_addr)) => {
                        let node_id = node_id.clone();
                        let config = config.clone();
                        let connections = Arc::clone(&connections);
                        let downstream = Arc::clone(&downstream);
                        let tracker = Arc::clone(&tracker);
                        tokio::spawn(async move {
                            let gate = |request: &Request, response: Response| {
                                admit(&config, peer_addr, request, response)
                            };
                            match accept_hdr_async(stream, gate).await {
                                Ok(ws_stream) => {
                                    let conn = Connection::spawn(
                                        ws_stream,
                                        Direction::Inbound,
                                        peer_addr.to_string(),
                                        tracker,
                                    );
                                    connections.write().insert(conn.id(), conn.clone());
                                    conn.send(&Frame::handshake(node_id));
                                    debug!("Accepted mesh connection from {peer_addr}");
                                    downstream.on_open(&conn);
                                    conn.activate();
                                }
                                Err(e) => {
                                    debug!("WebSocket accept failed for {peer_addr}: {e}");
                                }
                            }
                        });
                    }
                    Err(e) => {
                        error!("TCP accept failed: {e}");
                    }
                }
            }
            _ = shutdown.recv() => {
                info!("Mesh server shutting down");
                break;
            }
        }
    }
}

/// Origin and secret gate, evaluated before the upgrade is accepted.
fn admit(
    config: &ServerConfig,
    peer_addr: SocketAddr,
    request: &Request,
    response: Response,
) -> Result<Response, ErrorResponse> {
    let origin = request
        .headers()
        .get("origin")
        .and_then(|v| v.to_str().ok());
    if !(config.allow_origin)(origin) {
        info!("Mesh connection from origin {origin:?} ({peer_addr}) rejected");
        return Err(forbidden("origin not allowed"));
    }

    if let Some(secret) = &config.secret {
        let presented = request
            .headers()
            .get(SECRET_HEADER)
            .and_then(|v| v.to_str().ok());
        if presented != Some(secret.as_str()) {
            info!("Mesh connection from {peer_addr} rejected: bad secret");
            return Err(forbidden("invalid secret"));
        }
    }

    Ok(response)
}

fn forbidden(reason: &str) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(reason.to_string()));
    *response.status_mut() = StatusCode::FORBIDDEN;
    response
}

/// Keeps the live set current and forwards everything downstream.
struct InboundTracker {
    connections: ConnectionSet,
    downstream: Arc<dyn ConnectionObserver>,
}

impl ConnectionObserver for InboundTracker {
    fn on_handshake_complete(&self, conn: &Connection) {
        self.downstream.on_handshake_complete(conn);
    }

    fn on_message(&self, conn: &Connection, envelope: Envelope) {
        self.downstream.on_message(conn, envelope);
    }

    fn on_error(&self, conn: &Connection, error: &MeshError) {
        self.downstream.on_error(conn, error);
    }

    fn on_close(&self, conn: &Connection) {
        self.connections.write().remove(&conn.id());
        self.downstream.on_close(conn);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
