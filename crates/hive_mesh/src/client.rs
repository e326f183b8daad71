//! Outbound side of the mesh: one supervised connection with failover.
//!
//! [`NetClient`] keeps at most one outbound [`Connection`] alive. A supervisor
//! task walks the configured peer list: every failed connect bumps the attempt
//! counter, and once it exceeds `max_attempts` the next URL (wrapping) is
//! tried. Any disconnection restarts the cycle from the first URL.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};

use crate::config::{MeshConfig, PeerUrl};
use crate::connection::{Connection, ConnectionId, ConnectionObserver, Direction};
use crate::error::MeshError;
use crate::identity::NodeId;
use crate::message::{Envelope, Frame};
use crate::server::SECRET_HEADER;

/// Settings for [`NetClient`].
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub peers: Vec<PeerUrl>,
    pub max_attempts: u32,
    pub reconnect_delay: Duration,
}

impl ClientConfig {
    pub fn from_mesh(config: &MeshConfig) -> Self {
        Self {
            peers: config.peers.clone(),
            max_attempts: config.max_connection_attempts,
            reconnect_delay: config.reconnect_delay,
        }
    }
}

/// Observable state of the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Idle,
    Connecting { url_index: usize, attempt: u32 },
    Connected { url_index: usize },
}

/// Position in the peer list and failures against the current entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconnectState {
    pub url_index: usize,
    pub attempt: u32,
}

impl ReconnectState {
    /// Record one failed connect.
    pub fn record_failure(&mut self, max_attempts: u32, url_count: usize) {
        self.attempt += 1;
        if self.attempt > max_attempts {
            self.attempt = 0;
            self.url_index = (self.url_index + 1) % url_count.max(1);
        }
    }

    /// Start over from the first URL.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Maintains one outbound connection to the first reachable configured peer.
pub struct NetClient {
    node_id: NodeId,
    config: ClientConfig,
    state: Arc<RwLock<ClientState>>,
    current: Arc<RwLock<Option<Connection>>>,
    downstream: Arc<dyn ConnectionObserver>,
    shutdown_tx: Option<broadcast::Sender<()>>,
}

impl NetClient {
    pub fn new(node_id: NodeId, config: ClientConfig, downstream: Arc<dyn ConnectionObserver>) -> Self {
        Self {
            node_id,
            config,
            state: Arc::new(RwLock::new(ClientState::Idle)),
            current: Arc::new(RwLock::new(None)),
            downstream,
            shutdown_tx: None,
        }
    }

    /// Start the supervisor. Does nothing without configured peers.
    pub fn start(&mut self) {
        if self.shutdown_tx.is_some() || self.config.peers.is_empty() {
            return;
        }
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let supervisor = Supervisor {
            node_id: self.node_id.clone(),
            config: self.config.clone(),
            state: Arc::clone(&self.state),
            current: Arc::clone(&self.current),
            downstream: Arc::clone(&self.downstream),
        };
        tokio::spawn(supervisor.run(shutdown_rx));
        self.shutdown_tx = Some(shutdown_tx);
    }

    pub fn state(&self) -> ClientState {
        *self.state.read()
    }

    /// The current outbound connection, if any.
    pub fn connection(&self) -> Option<Connection> {
        self.current.read().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.current.read().as_ref().is_some_and(Connection::is_connected)
    }

    /// Forward a frame to the current connection. Dropped when there is none.
    pub fn send(&self, frame: &Frame) -> bool {
        match self.current.read().as_ref() {
            Some(conn) => conn.send(frame),
            None => false,
        }
    }

    /// Stop the supervisor and close the current connection.
    pub fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(conn) = self.current.write().take() {
            conn.close();
        }
        *self.state.write() = ClientState::Idle;
    }
}

impl Drop for NetClient {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

struct Supervisor {
    node_id: NodeId,
    config: ClientConfig,
    state: Arc<RwLock<ClientState>>,
    current: Arc<RwLock<Option<Connection>>>,
    downstream: Arc<dyn ConnectionObserver>,
}

impl Supervisor {
    async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        let (lost_tx, mut lost_rx) = mpsc::unbounded_channel::<ConnectionId>();
        let mut reconnect = ReconnectState::default();

        loop {
            // Connect phase: retry until some peer answers.
            let (ws, url_index) = loop {
                *self.state.write() = ClientState::Connecting {
                    url_index: reconnect.url_index,
                    attempt: reconnect.attempt,
                };
                let peer = &self.config.peers[reconnect.url_index];

                tokio::select! {
                    result = connect(peer) => match result {
                        Ok(ws) => break (ws, reconnect.url_index),
                        Err(e) => {
                            warn!("Connect to {} failed (attempt {}): {e}", peer.url, reconnect.attempt);
                            reconnect.record_failure(self.config.max_attempts, self.config.peers.len());
                        }
                    },
                    _ = shutdown.recv() => return,
                }

                tokio::select! {
                    _ = tokio::time::sleep(self.config.reconnect_delay) => {}
                    _ = shutdown.recv() => return,
                }
            };

            let peer_url = self.config.peers[url_index].url.clone();
            let tracker: Arc<dyn ConnectionObserver> = Arc::new(ClientTracker {
                lost: lost_tx.clone(),
                downstream: Arc::clone(&self.downstream),
            });
            let conn = Connection::spawn(ws, Direction::Outbound, peer_url.clone(), tracker);
            *self.current.write() = Some(conn.clone());
            *self.state.write() = ClientState::Connected { url_index };
            info!("Connected to mesh peer {peer_url}");

            conn.send(&Frame::handshake(self.node_id.clone()));
            self.downstream.on_open(&conn);
            conn.activate();

            // Hold until this connection goes away. Signals from earlier
            // connections are stale and skipped.
            loop {
                tokio::select! {
                    lost = lost_rx.recv() => match lost {
                        Some(id) if id == conn.id() => break,
                        Some(_) => continue,
                        None => return,
                    },
                    _ = shutdown.recv() => {
                        conn.close();
                        return;
                    }
                }
            }

            debug!("Lost connection to {peer_url}, restarting reconnect cycle");
            self.current.write().take();
            conn.close();
            self.downstream.on_close(&conn);
            reconnect.reset();
        }
    }
}

async fn connect(peer: &PeerUrl) -> Result<WebSocketStream<MaybeTlsStream<TcpStream>>, MeshError> {
    let mut request = peer
        .ws_url()
        .into_client_request()
        .map_err(|e| MeshError::Transport(format!("Invalid peer url {}: {e}", peer.url)))?;
    if let Some(secret) = &peer.secret {
        let value = HeaderValue::from_str(secret)
            .map_err(|e| MeshError::Config(format!("Invalid secret for {}: {e}", peer.url)))?;
        request.headers_mut().insert(SECRET_HEADER, value);
    }

    let (ws, _) = connect_async(request)
        .await
        .map_err(|e| MeshError::Transport(format!("Connect to {} failed: {e}", peer.url)))?;
    Ok(ws)
}

/// Forwards events downstream and reports loss to the supervisor, which
/// delivers the close itself once the connection is torn down.
struct ClientTracker {
    lost: mpsc::UnboundedSender<ConnectionId>,
    downstream: Arc<dyn ConnectionObserver>,
}

impl ConnectionObserver for ClientTracker {
    fn on_handshake_complete(&self, conn: &Connection) {
        self.downstream.on_handshake_complete(conn);
    }

    fn on_message(&self, conn: &Connection, envelope: Envelope) {
        self.downstream.on_message(conn, envelope);
    }

    fn on_error(&self, conn: &Connection, error: &MeshError) {
        self.downstream.on_error(conn, error);
        let _ = self.lost.send(conn.id());
    }

    fn on_close(&self, conn: &Connection) {
        let _ = self.lost.send(conn.id());
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
