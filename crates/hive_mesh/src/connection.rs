//! A single framed WebSocket session with one peer.
//!
//! Each [`Connection`] runs two background tasks: a writer draining an
//! outbound queue into the socket and a reader parsing inbound text frames.
//! Events are reported to one [`ConnectionObserver`], attached when the
//! connection is spawned and detached by [`Connection::close`]. The reader
//! stays parked until [`Connection::activate`] so the owner can register the
//! connection before any inbound event fires.

use std::fmt;
use std::sync::Arc;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{Notify, mpsc};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, trace, warn};

use crate::error::MeshError;
use crate::identity::NodeId;
use crate::message::{Envelope, Frame};

/// Receives lifecycle and message events from connections.
///
/// Callbacks run on the connection's reader task and must not block.
pub trait ConnectionObserver: Send + Sync {
    fn on_open(&self, _conn: &Connection) {}
    fn on_handshake_complete(&self, _conn: &Connection) {}
    fn on_message(&self, _conn: &Connection, _envelope: Envelope) {}
    fn on_error(&self, _conn: &Connection, _error: &MeshError) {}
    fn on_close(&self, _conn: &Connection) {}
}

/// Local identifier of a connection (not the remote node id).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ConnectionId(uuid::Uuid);

impl ConnectionId {
    fn generate() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which side opened the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Point-in-time description of a connection.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub direction: Direction,
    pub remote_addr: String,
    pub peer_id: Option<NodeId>,
    pub connected: bool,
    pub connected_at: DateTime<Utc>,
}

/// Handle to one mesh session. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

struct Inner {
    id: ConnectionId,
    direction: Direction,
    remote_addr: String,
    peer_id: OnceLock<NodeId>,
    connected: AtomicBool,
    connected_at: DateTime<Utc>,
    outbound: mpsc::UnboundedSender<Message>,
    observer: RwLock<Option<Arc<dyn ConnectionObserver>>>,
    activated: Notify,
}

impl Connection {
    /// Take ownership of an established WebSocket and start its I/O tasks.
    pub fn spawn<S>(
        ws: WebSocketStream<S>,
        direction: Direction,
        remote_addr: impl Into<String>,
        observer: Arc<dyn ConnectionObserver>,
    ) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (mut sink, mut stream) = ws.split();
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Message>();

        let conn = Self {
            inner: Arc::new(Inner {
                id: ConnectionId::generate(),
                direction,
                remote_addr: remote_addr.into(),
                peer_id: OnceLock::new(),
                connected: AtomicBool::new(true),
                connected_at: Utc::now(),
                outbound,
                observer: RwLock::new(Some(observer)),
                activated: Notify::new(),
            }),
        };

        let addr = conn.inner.remote_addr.clone();
        tokio::spawn(async move {
            while let Some(msg) = outbound_rx.recv().await {
                let closing = matches!(msg, Message::Close(_));
                if let Err(e) = sink.send(msg).await {
                    debug!("Write error to {addr}: {e}");
                    break;
                }
                if closing {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let reader = conn.clone();
        tokio::spawn(async move {
            reader.inner.activated.notified().await;
            while let Some(msg) = stream.next().await {
                match msg {
                    Ok(Message::Text(text)) => reader.handle_text(&text),
                    Ok(Message::Close(_)) => {
                        debug!("Peer {} sent close", reader.inner.remote_addr);
                        break;
                    }
                    Ok(_) => {} // Ignore binary/ping/pong
                    Err(e) => {
                        debug!("Read error from {}: {e}", reader.inner.remote_addr);
                        reader.inner.connected.store(false, Ordering::SeqCst);
                        if let Some(observer) = reader.observer() {
                            observer.on_error(&reader, &MeshError::Transport(e.to_string()));
                        }
                        break;
                    }
                }
            }

            reader.inner.connected.store(false, Ordering::SeqCst);
            if let Some(observer) = reader.observer() {
                observer.on_close(&reader);
            }
        });

        conn
    }

    /// Start delivering inbound events to the observer.
    pub fn activate(&self) {
        self.inner.activated.notify_one();
    }

    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    pub fn direction(&self) -> Direction {
        self.inner.direction
    }

    pub fn remote_addr(&self) -> &str {
        &self.inner.remote_addr
    }

    /// Node id of the remote peer, known once its handshake arrived.
    pub fn peer_id(&self) -> Option<&NodeId> {
        self.inner.peer_id.get()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    pub fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            id: self.inner.id,
            direction: self.inner.direction,
            remote_addr: self.inner.remote_addr.clone(),
            peer_id: self.peer_id().cloned(),
            connected: self.is_connected(),
            connected_at: self.inner.connected_at,
        }
    }

    /// Queue a frame for sending. Returns `false` (and drops the frame) when
    /// the session is no longer connected.
    pub fn send(&self, frame: &Frame) -> bool {
        if !self.is_connected() {
            return false;
        }
        let json = match frame.to_json() {
            Ok(json) => json,
            Err(e) => {
                warn!("Failed to serialize frame for {}: {e}", self.inner.remote_addr);
                return false;
            }
        };
        self.inner.outbound.send(Message::Text(json.into())).is_ok()
    }

    /// Detach the observer, then close the transport. No further events are
    /// reported for this connection.
    pub fn close(&self) {
        self.inner.observer.write().take();
        if self.inner.connected.swap(false, Ordering::SeqCst) {
            let _ = self.inner.outbound.send(Message::Close(None));
        }
        // Unpark a never-activated reader so it can drain and exit.
        self.inner.activated.notify_one();
    }

    fn observer(&self) -> Option<Arc<dyn ConnectionObserver>> {
        self.inner.observer.read().clone()
    }

    fn handle_text(&self, text: &str) {
        let frame = match Frame::from_json(text) {
            Ok(frame) => frame,
            Err(e) => {
                trace!("Discarding malformed frame from {}: {e}", self.inner.remote_addr);
                return;
            }
        };

        match frame {
            Frame::Handshake { node_id } => {
                if node_id.as_str().is_empty() {
                    trace!("Discarding empty handshake from {}", self.inner.remote_addr);
                    return;
                }
                if self.inner.peer_id.set(node_id).is_err() {
                    debug!("Ignoring repeated handshake from {}", self.inner.remote_addr);
                    return;
                }
                if let Some(observer) = self.observer() {
                    observer.on_handshake_complete(self);
                }
            }
            Frame::Envelope(envelope) => {
                if self.peer_id().is_none() {
                    debug!(
                        "Dropping {:?} from {} received before handshake",
                        envelope.kind, self.inner.remote_addr
                    );
                    return;
                }
                if let Some(observer) = self.observer() {
                    observer.on_message(self, envelope);
                }
            }
        }
    }
}

impl PartialEq for Connection {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for Connection {}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("direction", &self.inner.direction)
            .field("remote_addr", &self.inner.remote_addr)
            .field("peer_id", &self.peer_id())
            .field("connected", &self.is_connected())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::message::MessageKind;
    use std::time::Duration;
    use tokio::net::{TcpListener, TcpStream};
    use tokio_tungstenite::{MaybeTlsStream, accept_async, connect_async};

    /// Observer that records every callback as a string.
    pub(crate) struct Recorder(pub mpsc::UnboundedSender<String>);

    impl ConnectionObserver for Recorder {
        fn on_handshake_complete(&self, conn: &Connection) {
            let peer = conn.peer_id().map(|p| p.to_string()).unwrap_or_default();
            let _ = self.0.send(format!("handshake:{peer}"));
        }
        fn on_message(&self, _conn: &Connection, envelope: Envelope) {
            let _ = self.0.send(format!("message:{}", envelope.data));
        }
        fn on_error(&self, _conn: &Connection, _error: &MeshError) {
            let _ = self.0.send("error".to_string());
        }
        fn on_close(&self, _conn: &Connection) {
            let _ = self.0.send("close".to_string());
        }
    }

    type RawClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

    /// Accept one server-side `Connection` and hand back the raw client socket.
    async fn pair() -> (Connection, RawClient, mpsc::UnboundedReceiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = mpsc::unbounded_channel();

        let accept = tokio::spawn(async move {
            let (stream, peer) = listener.accept().await.unwrap();
            let ws = accept_async(stream).await.unwrap();
            let conn =
                Connection::spawn(ws, Direction::Inbound, peer.to_string(), Arc::new(Recorder(tx)));
            conn.activate();
            conn
        });

        let (client, _) = connect_async(format!("ws://{addr}")).await.unwrap();
        let conn = accept.await.unwrap();
        (conn, client, rx)
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<String>) -> String {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("event in time")
            .expect("channel open")
    }

    fn text(s: &str) -> Message {
        Message::Text(s.to_string().into())
    }

    #[tokio::test]
    async fn test_handshake_is_exactly_once() {
        let (conn, mut client, mut rx) = pair().await;
        assert!(conn.peer_id().is_none());

        client.send(text(r#"{"MESH_HANDSHAKE":"peer-1"}"#)).await.unwrap();
        client.send(text(r#"{"MESH_HANDSHAKE":"peer-2"}"#)).await.unwrap();
        client
            .send(text(r#"{"TYPE":"BROADCAST","SENDER":"peer-1","ROUTE":[],"DATA":7}"#))
            .await
            .unwrap();

        assert_eq!(next_event(&mut rx).await, "handshake:peer-1");
        // The second handshake is swallowed; the next event is the message.
        assert_eq!(next_event(&mut rx).await, "message:7");
        assert_eq!(conn.peer_id(), Some(&NodeId::from("peer-1")));
    }

    #[tokio::test]
    async fn test_malformed_and_early_frames_are_dropped() {
        let (_conn, mut client, mut rx) = pair().await;

        client
            .send(text(r#"{"TYPE":"BROADCAST","SENDER":"x","ROUTE":[],"DATA":1}"#))
            .await
            .unwrap();
        client.send(text("{{{ garbage")).await.unwrap();
        client.send(text(r#"{"MESH_HANDSHAKE":"peer-1"}"#)).await.unwrap();
        client
            .send(text(r#"{"TYPE":"BROADCAST","SENDER":"x","ROUTE":[],"DATA":2}"#))
            .await
            .unwrap();

        assert_eq!(next_event(&mut rx).await, "handshake:peer-1");
        assert_eq!(next_event(&mut rx).await, "message:2");
    }

    #[tokio::test]
    async fn test_send_reaches_remote() {
        let (conn, mut client, _rx) = pair().await;
        let env = Envelope::new(
            MessageKind::Broadcast,
            NodeId::from("me"),
            vec![],
            serde_json::json!("hello"),
        );
        assert!(conn.send(&Frame::from(env.clone())));

        let msg = tokio::time::timeout(Duration::from_secs(2), client.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let Message::Text(body) = msg else {
            panic!("expected text frame");
        };
        assert_eq!(Frame::from_json(&body).unwrap(), Frame::Envelope(env));
    }

    #[tokio::test]
    async fn test_remote_close_reports_close() {
        let (conn, mut client, mut rx) = pair().await;
        client.close(None).await.unwrap();

        assert_eq!(next_event(&mut rx).await, "close");
        assert!(!conn.is_connected());
        assert!(!conn.send(&Frame::handshake(NodeId::from("late"))));
    }

    #[tokio::test]
    async fn test_local_close_detaches_observer() {
        let (conn, mut client, mut rx) = pair().await;
        conn.close();
        assert!(!conn.is_connected());

        // The remote sees the close frame...
        let msg = tokio::time::timeout(Duration::from_secs(2), client.next())
            .await
            .unwrap();
        assert!(matches!(msg, Some(Ok(Message::Close(_))) | None));

        // ...but no close event is re-delivered locally.
        let nothing = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await;
        assert!(nothing.is_err() || nothing.unwrap().is_none());
    }
}
