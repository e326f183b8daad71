//! MeshRouter owns every connection and routes envelopes between nodes.
//!
//! Connection lifecycle and message events from the [`NetServer`] and
//! [`NetClient`] are funnelled into one event-loop task, which keeps the
//! connection set current, relays envelopes whose `ROUTE` is not yet empty
//! and dispatches the rest locally. Every open, close or handshake starts a
//! rebuild of the routing table by probing; rebuilds carry a generation
//! number and only the newest one may commit.

use std::collections::HashSet;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, trace, warn};

use crate::client::{ClientConfig, NetClient};
use crate::config::MeshConfig;
use crate::connection::{Connection, ConnectionObserver};
use crate::error::{MeshError, Result};
use crate::identity::NodeId;
use crate::message::{Envelope, Frame, MessageKind};
use crate::pending::PendingCalls;
use crate::routing::{NodeNameRegistry, Route, RouteDiscovery, RoutingTable};
use crate::server::{NetServer, ServerConfig};

// ---------------------------------------------------------------------------
// Application-facing observers
// ---------------------------------------------------------------------------

/// Receives messages delivered to this node and routing table changes.
///
/// Callbacks run on the router's tasks and must not block.
pub trait TopologyObserver: Send + Sync {
    fn on_message(&self, _message: &IncomingMessage) {}
    fn on_network_change(&self, _nodes: &[NodeId]) {}
}

/// A `BROADCAST` payload that reached this node.
#[derive(Clone)]
pub struct IncomingMessage {
    pub sender: NodeId,
    pub data: Value,
    pub received_at: DateTime<Utc>,
    return_route: Vec<NodeId>,
    origin: Weak<Shared>,
}

impl IncomingMessage {
    /// Hops back to the sender, nearest first.
    pub fn return_route(&self) -> &[NodeId] {
        &self.return_route
    }

    /// Reply to the sender along the way the message came.
    pub fn send_back(&self, data: Value) -> Result<()> {
        let shared = self.origin.upgrade().ok_or(MeshError::NotRunning)?;
        shared.ensure_running()?;
        let envelope = Envelope::new(MessageKind::Broadcast, shared.id.clone(), Vec::new(), data);
        shared.send_along(&self.return_route, envelope)
    }

    #[cfg(test)]
    pub(crate) fn detached(sender: NodeId, data: Value) -> Self {
        Self {
            sender,
            data,
            received_at: Utc::now(),
            return_route: Vec::new(),
            origin: Weak::new(),
        }
    }
}

impl fmt::Debug for IncomingMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IncomingMessage")
            .field("sender", &self.sender)
            .field("data", &self.data)
            .field("received_at", &self.received_at)
            .field("return_route", &self.return_route)
            .finish()
    }
}

/// Events delivered by [`MeshRouter::subscribe`].
#[derive(Debug, Clone)]
pub enum TopologyEvent {
    Message(IncomingMessage),
    NetworkChanged(Vec<NodeId>),
}

struct ChannelObserver(mpsc::UnboundedSender<TopologyEvent>);

impl TopologyObserver for ChannelObserver {
    fn on_message(&self, message: &IncomingMessage) {
        let _ = self.0.send(TopologyEvent::Message(message.clone()));
    }

    fn on_network_change(&self, nodes: &[NodeId]) {
        let _ = self.0.send(TopologyEvent::NetworkChanged(nodes.to_vec()));
    }
}

// ---------------------------------------------------------------------------
// Connection events
// ---------------------------------------------------------------------------

enum RouterEvent {
    Opened(Connection),
    HandshakeComplete(Connection),
    Message(Connection, Envelope),
    Failed(Connection, String),
    Closed(Connection),
}

/// Feeds connection callbacks into the router's event loop.
struct RouterSink {
    events: mpsc::UnboundedSender<RouterEvent>,
}

impl ConnectionObserver for RouterSink {
    fn on_open(&self, conn: &Connection) {
        let _ = self.events.send(RouterEvent::Opened(conn.clone()));
    }

    fn on_handshake_complete(&self, conn: &Connection) {
        let _ = self.events.send(RouterEvent::HandshakeComplete(conn.clone()));
    }

    fn on_message(&self, conn: &Connection, envelope: Envelope) {
        let _ = self.events.send(RouterEvent::Message(conn.clone(), envelope));
    }

    fn on_error(&self, conn: &Connection, error: &MeshError) {
        let _ = self
            .events
            .send(RouterEvent::Failed(conn.clone(), error.to_string()));
    }

    fn on_close(&self, conn: &Connection) {
        let _ = self.events.send(RouterEvent::Closed(conn.clone()));
    }
}

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

struct Shared {
    id: NodeId,
    config: MeshConfig,
    running: AtomicBool,
    local_addr: RwLock<Option<SocketAddr>>,
    /// Inbound and outbound connections in open order.
    connections: RwLock<Vec<Connection>>,
    table: RwLock<RoutingTable>,
    names: RwLock<NodeNameRegistry>,
    pending: Mutex<PendingCalls>,
    observers: RwLock<Vec<Arc<dyn TopologyObserver>>>,
    generation: AtomicU64,
    /// A local topology change has not yet been announced to the mesh.
    announce_pending: AtomicBool,
}

impl Shared {
    fn ensure_running(&self) -> Result<()> {
        if self.running.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(MeshError::NotRunning)
        }
    }

    fn route_not_found(&self, target: impl Into<String>) -> MeshError {
        MeshError::RouteNotFound {
            target: target.into(),
            local: self.id.clone(),
        }
    }

    fn upsert(&self, conn: &Connection) {
        if !conn.is_connected() {
            return;
        }
        let mut connections = self.connections.write();
        if !connections.iter().any(|c| c.id() == conn.id()) {
            connections.push(conn.clone());
        }
    }

    /// Distinct handshaken peers of live direct connections.
    fn direct_peers(&self) -> Vec<NodeId> {
        let connections = self.connections.read();
        let mut seen = HashSet::new();
        connections
            .iter()
            .filter(|c| c.is_connected())
            .filter_map(|c| c.peer_id())
            .filter(|peer| **peer != self.id && seen.insert((*peer).clone()))
            .cloned()
            .collect()
    }

    fn connection_to(&self, peer: &NodeId) -> Option<Connection> {
        self.connections
            .read()
            .iter()
            .find(|c| c.is_connected() && c.peer_id() == Some(peer))
            .cloned()
    }

    /// Send an envelope through the first hop, leaving the remaining hops in
    /// its `ROUTE`.
    fn send_along(&self, hops: &[NodeId], mut envelope: Envelope) -> Result<()> {
        let Some((first, rest)) = hops.split_first() else {
            return Err(self.route_not_found(envelope.sender.as_str()));
        };
        let conn = self
            .connection_to(first)
            .ok_or_else(|| self.route_not_found(first.as_str()))?;
        envelope.route = rest.to_vec();
        if conn.send(&Frame::from(envelope)) {
            Ok(())
        } else {
            Err(MeshError::ConnectionLost(first.to_string()))
        }
    }

    fn send_reply(&self, mut reply: Envelope) {
        let hops = std::mem::take(&mut reply.route);
        if let Err(e) = self.send_along(&hops, reply) {
            debug!("Could not return reply: {e}");
        }
    }

    /// Answer a request; does nothing for fire-and-forget envelopes.
    fn reply_to(&self, request: &Envelope, data: Value) {
        if request.expects_reply() {
            self.send_reply(request.reply(self.id.clone(), data));
        }
    }

    /// Send a request along `hops` and wait for its `MESSAGE_RETURN`.
    async fn request(&self, hops: &[NodeId], kind: MessageKind, data: Value) -> Result<Value> {
        let Some(first_hop) = hops.first().cloned() else {
            return Err(self.route_not_found(""));
        };
        let message_id = uuid::Uuid::new_v4().to_string();
        let rx = self.pending.lock().register(&message_id, first_hop.clone());

        let envelope = Envelope::new(kind, self.id.clone(), Vec::new(), data)
            .with_message_id(message_id.clone());
        if let Err(e) = self.send_along(hops, envelope) {
            self.pending.lock().remove(&message_id);
            return Err(e);
        }

        let timeout = self.config.request_timeout;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(MeshError::ConnectionLost(first_hop.to_string())),
            Err(_) => {
                self.pending.lock().remove(&message_id);
                Err(MeshError::Timeout(timeout))
            }
        }
    }

    fn observers(&self) -> Vec<Arc<dyn TopologyObserver>> {
        self.observers.read().clone()
    }

    /// Stop background tasks and drop all routing state. Shared by
    /// [`MeshRouter::stop`] and `Drop`.
    fn teardown(&self, life: &mut Lifecycle) {
        if let Some(tx) = life.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(mut client) = life.client.take() {
            client.stop();
        }
        if let Some(mut server) = life.server.take() {
            server.stop();
        }

        self.running.store(false, Ordering::SeqCst);
        self.generation.fetch_add(1, Ordering::SeqCst);
        let connections: Vec<Connection> = self.connections.write().drain(..).collect();
        for conn in connections {
            conn.close();
        }
        *self.table.write() = RoutingTable::new();
        self.pending.lock().cancel_all();
        *self.local_addr.write() = None;
    }

    // -- Event handling ----------------------------------------------------

    fn handle_event(self: &Arc<Self>, event: RouterEvent) {
        match event {
            RouterEvent::Opened(conn) => {
                debug!("Connection {} opened ({})", conn.id(), conn.remote_addr());
                self.upsert(&conn);
                self.start_rebuild(true);
            }
            RouterEvent::HandshakeComplete(conn) => {
                if let Some(peer) = conn.peer_id() {
                    info!("Handshake complete with {peer} ({})", conn.remote_addr());
                }
                self.upsert(&conn);
                self.start_rebuild(true);
            }
            RouterEvent::Message(conn, envelope) => {
                self.upsert(&conn);
                self.handle_envelope(&conn, envelope);
            }
            RouterEvent::Failed(conn, error) => {
                debug!("Connection {} error: {error}", conn.remote_addr());
            }
            RouterEvent::Closed(conn) => {
                debug!("Connection {} closed ({})", conn.id(), conn.remote_addr());
                self.connections.write().retain(|c| c.id() != conn.id());
                if let Some(peer) = conn.peer_id() {
                    if self.connection_to(peer).is_none() {
                        let failed = self.pending.lock().fail_via(peer);
                        if failed > 0 {
                            debug!("Rejected {failed} pending call(s) routed via {peer}");
                        }
                    }
                }
                self.start_rebuild(true);
            }
        }
    }

    fn handle_envelope(self: &Arc<Self>, conn: &Connection, mut envelope: Envelope) {
        let Some(arrival) = conn.peer_id().cloned() else {
            return;
        };
        envelope.path.push(arrival.clone());

        if envelope.route.is_empty() {
            self.dispatch_local(&arrival, envelope);
            return;
        }

        let next = envelope.route.remove(0);
        let relayed = match self.connection_to(&next) {
            Some(next_conn) => {
                trace!("Relaying {:?} from {} to {next}", envelope.kind, envelope.sender);
                next_conn.send(&Frame::from(envelope.clone()))
            }
            None => false,
        };
        if relayed {
            return;
        }

        let error = self.route_not_found(next.as_str());
        if envelope.expects_reply() {
            debug!("Relay of {:?} failed, answering sender: {error}", envelope.kind);
            self.send_reply(envelope.error_reply(self.id.clone(), error.to_string()));
        } else {
            debug!("Dropping relayed {:?} from {}: {error}", envelope.kind, envelope.sender);
        }
    }

    fn dispatch_local(self: &Arc<Self>, arrival: &NodeId, envelope: Envelope) {
        match envelope.kind {
            MessageKind::TraceProbe => {
                let neighbours: Vec<Value> = self
                    .direct_peers()
                    .into_iter()
                    .filter(|peer| peer != arrival && *peer != envelope.sender)
                    .map(|peer| Value::String(peer.to_string()))
                    .collect();
                self.reply_to(&envelope, Value::Array(neighbours));
            }
            MessageKind::Broadcast => {
                let message = IncomingMessage {
                    sender: envelope.sender.clone(),
                    data: envelope.data.clone(),
                    received_at: Utc::now(),
                    return_route: envelope.return_route(),
                    origin: Arc::downgrade(self),
                };
                for observer in self.observers() {
                    observer.on_message(&message);
                }
                self.reply_to(&envelope, Value::Null);
            }
            MessageKind::RegisterNode => {
                match envelope.data.as_str() {
                    Some(name) => {
                        debug!("Node {} registered as '{name}'", envelope.sender);
                        self.names.write().register(envelope.sender.clone(), name);
                    }
                    None => debug!("Ignoring REGISTER_NODE without a name from {}", envelope.sender),
                }
                self.reply_to(&envelope, Value::Null);
            }
            MessageKind::MessageReturn => {
                if !self.pending.lock().complete(&envelope) {
                    trace!("Discarding unmatched MESSAGE_RETURN {:?}", envelope.message_id);
                }
            }
            MessageKind::UpdateNodeList => {
                debug!("Node {} reported a topology change", envelope.sender);
                self.start_rebuild(false);
            }
        }
    }

    // -- Route discovery -----------------------------------------------------

    fn start_rebuild(self: &Arc<Self>, local_change: bool) {
        if !self.running.load(Ordering::SeqCst) {
            return;
        }
        if local_change {
            self.announce_pending.store(true, Ordering::SeqCst);
        }
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let shared = Arc::clone(self);
        tokio::spawn(async move {
            shared.rebuild(generation).await;
        });
    }

    fn is_superseded(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) != generation || !self.running.load(Ordering::SeqCst)
    }

    /// Probe the mesh breadth-first and commit the result unless a newer
    /// rebuild started meanwhile. Returns whether this rebuild committed.
    async fn rebuild(self: Arc<Self>, generation: u64) -> bool {
        let mut discovery = RouteDiscovery::new(self.id.clone(), self.direct_peers());

        while let Some(route) = discovery.next_route() {
            if self.is_superseded(generation) {
                trace!("Rebuild {generation} superseded");
                return false;
            }
            let neighbours = match self
                .request(route.hops(), MessageKind::TraceProbe, Value::Null)
                .await
            {
                Ok(value) => serde_json::from_value::<Vec<NodeId>>(value).unwrap_or_else(|e| {
                    debug!("Bad probe result from {}: {e}", route.destination());
                    Vec::new()
                }),
                Err(e) => {
                    debug!("Probe to {} failed: {e}", route.destination());
                    Vec::new()
                }
            };
            discovery.offer_neighbours(&route, &neighbours);
        }

        let table = discovery.finish();
        let routes: Vec<Route> = table.iter().cloned().collect();
        let nodes = table.destinations();
        let changed = {
            let mut current = self.table.write();
            if self.is_superseded(generation) {
                trace!("Rebuild {generation} superseded before commit");
                return false;
            }
            let changed = current.hop_counts() != table.hop_counts();
            *current = table;
            changed
        };

        if changed {
            info!("Routing table rebuilt: {} reachable node(s)", nodes.len());
            for observer in self.observers() {
                observer.on_network_change(&nodes);
            }
        }

        if let Some(name) = &self.config.node_name {
            for route in &routes {
                let envelope = Envelope::new(
                    MessageKind::RegisterNode,
                    self.id.clone(),
                    Vec::new(),
                    Value::String(name.clone()),
                );
                if let Err(e) = self.send_along(route.hops(), envelope) {
                    debug!("REGISTER_NODE to {} failed: {e}", route.destination());
                }
            }
        }

        if self.announce_pending.swap(false, Ordering::SeqCst) {
            for route in &routes {
                let envelope =
                    Envelope::new(MessageKind::UpdateNodeList, self.id.clone(), Vec::new(), Value::Null);
                if let Err(e) = self.send_along(route.hops(), envelope) {
                    debug!("UPDATE_NODE_LIST to {} failed: {e}", route.destination());
                }
            }
        }

        true
    }
}

async fn event_loop(
    shared: Arc<Shared>,
    mut events: mpsc::UnboundedReceiver<RouterEvent>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            Some(event) = events.recv() => shared.handle_event(event),
            _ = shutdown.recv() => {
                debug!("Router event loop shutting down");
                break;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// MeshRouter
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Lifecycle {
    server: Option<NetServer>,
    client: Option<NetClient>,
    shutdown_tx: Option<broadcast::Sender<()>>,
}

/// One mesh node: its server, its outbound client and the routing state
/// shared between them.
pub struct MeshRouter {
    shared: Arc<Shared>,
    lifecycle: tokio::sync::Mutex<Lifecycle>,
}

impl MeshRouter {
    /// Create a router with a freshly generated node id.
    pub fn new(config: MeshConfig) -> Self {
        Self::with_node_id(NodeId::generate(), config)
    }

    pub fn with_node_id(id: NodeId, config: MeshConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                id,
                config,
                running: AtomicBool::new(false),
                local_addr: RwLock::new(None),
                connections: RwLock::new(Vec::new()),
                table: RwLock::new(RoutingTable::new()),
                names: RwLock::new(NodeNameRegistry::new()),
                pending: Mutex::new(PendingCalls::new()),
                observers: RwLock::new(Vec::new()),
                generation: AtomicU64::new(0),
                announce_pending: AtomicBool::new(false),
            }),
            lifecycle: tokio::sync::Mutex::new(Lifecycle::default()),
        }
    }

    pub fn id(&self) -> &NodeId {
        &self.shared.id
    }

    pub fn config(&self) -> &MeshConfig {
        &self.shared.config
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Address the server is bound to while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.shared.local_addr.read()
    }

    /// Bind the server, start the event loop and the outbound client.
    /// Returns the bound address; a second call is a no-op.
    pub async fn start(&self) -> Result<SocketAddr> {
        let mut life = self.lifecycle.lock().await;
        if let Some(addr) = self.local_addr() {
            return Ok(addr);
        }

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let sink: Arc<dyn ConnectionObserver> = Arc::new(RouterSink { events: event_tx });

        let mut server = NetServer::new(
            self.shared.id.clone(),
            ServerConfig::from_mesh(&self.shared.config),
            Arc::clone(&sink),
        );
        let addr = server.start().await?;

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        self.shared.running.store(true, Ordering::SeqCst);
        *self.shared.local_addr.write() = Some(addr);
        tokio::spawn(event_loop(Arc::clone(&self.shared), event_rx, shutdown_rx));

        let mut client = NetClient::new(
            self.shared.id.clone(),
            ClientConfig::from_mesh(&self.shared.config),
            sink,
        );
        client.start();

        life.server = Some(server);
        life.client = Some(client);
        life.shutdown_tx = Some(shutdown_tx);
        info!("Mesh node {} started on {addr}", self.shared.id);
        Ok(addr)
    }

    /// Close every connection and stop all background tasks.
    pub async fn stop(&self) {
        let mut life = self.lifecycle.lock().await;
        self.shared.teardown(&mut life);
        info!("Mesh node {} stopped", self.shared.id);
    }

    // -- Queries -------------------------------------------------------------

    /// Every reachable node, in discovery order.
    pub fn nodes(&self) -> Vec<NodeId> {
        self.shared.table.read().destinations()
    }

    pub fn routes(&self) -> Vec<Route> {
        self.shared.table.read().iter().cloned().collect()
    }

    pub fn route_to(&self, node: &NodeId) -> Option<Route> {
        self.shared.table.read().get(node).cloned()
    }

    pub fn node_name(&self, node: &NodeId) -> Option<String> {
        self.shared.names.read().name_of(node).map(str::to_string)
    }

    /// Live direct connections, one per peer.
    pub fn connections(&self) -> Vec<Connection> {
        let connections = self.shared.connections.read();
        let mut seen = HashSet::new();
        connections
            .iter()
            .filter(|c| match c.peer_id() {
                Some(peer) => seen.insert(peer.clone()),
                None => true,
            })
            .cloned()
            .collect()
    }

    // -- Observers -------------------------------------------------------------

    pub fn add_observer(&self, observer: Arc<dyn TopologyObserver>) {
        self.shared.observers.write().push(observer);
    }

    /// Channel-backed observer.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<TopologyEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.add_observer(Arc::new(ChannelObserver(tx)));
        rx
    }

    // -- Messaging -------------------------------------------------------------

    /// Send `data` to every reachable node, one unicast per route. Returns
    /// how many sends were handed to a connection; never fails.
    pub fn broadcast(&self, data: Value) -> usize {
        if !self.is_running() {
            return 0;
        }
        let mut sent = 0;
        for route in self.routes() {
            let envelope =
                Envelope::new(MessageKind::Broadcast, self.shared.id.clone(), Vec::new(), data.clone());
            match self.shared.send_along(route.hops(), envelope) {
                Ok(()) => sent += 1,
                Err(e) => debug!("Broadcast to {} failed: {e}", route.destination()),
            }
        }
        sent
    }

    /// Send `data` to one node, named by its registered name or its id.
    pub fn send_to_node(&self, identificator: &str, data: Value) -> Result<()> {
        self.shared.ensure_running()?;
        let route = self
            .resolve(identificator)
            .ok_or_else(|| self.shared.route_not_found(identificator))?;
        let envelope = Envelope::new(MessageKind::Broadcast, self.shared.id.clone(), Vec::new(), data);
        self.shared.send_along(route.hops(), envelope)
    }

    /// Send a request along `route` and wait for the destination's reply.
    pub async fn send_with_result(&self, route: &Route, kind: MessageKind, data: Value) -> Result<Value> {
        self.shared.ensure_running()?;
        self.shared.request(route.hops(), kind, data).await
    }

    /// Run one rebuild to completion and return the reachable nodes.
    pub async fn refresh_routes(&self) -> Result<Vec<NodeId>> {
        self.shared.ensure_running()?;
        let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
        if !Arc::clone(&self.shared).rebuild(generation).await {
            warn!("Route refresh superseded by a newer topology change");
        }
        Ok(self.nodes())
    }

    /// Names resolve first, preferring the earliest registration that is
    /// reachable; otherwise the identificator is taken as a node id.
    fn resolve(&self, identificator: &str) -> Option<Route> {
        let table = self.shared.table.read();
        let names = self.shared.names.read();
        names
            .named(identificator)
            .find_map(|id| table.get(id))
            .or_else(|| table.get(&NodeId::from(identificator)))
            .cloned()
    }
}

impl Drop for MeshRouter {
    fn drop(&mut self) {
        self.shared.teardown(self.lifecycle.get_mut());
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
