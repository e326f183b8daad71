//! Process bridge: worker processes sharing the coordinator's mesh node.
//!
//! Only the coordinator owns a [`MeshRouter`]. Workers talk to it over a
//! byte pipe (a spawned child's stdin/stdout in production) carrying one JSON
//! [`BridgeMessage`] per line. Every message is stamped with a topic, the
//! fingerprint of the mesh configuration, and messages for another topic are
//! ignored on both ends.
//!
//! Besides mesh operations, both sides can register named call handlers.
//! The coordinator calls a handler on one worker or on all of them; a worker
//! fans a call out to the coordinator and every other worker. Fan-outs
//! collect one [`CallOutcome`] per responder into [`CallResults`].

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, join_all};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace, warn};

use crate::error::{MeshError, Result};
use crate::identity::NodeId;
use crate::router::{IncomingMessage, MeshRouter, TopologyObserver};

/// Environment variable carrying the bridge topic into spawned workers.
pub const TOPIC_ENV: &str = "HIVE_MESH_TOPIC";

/// What a call handler answers: a value, or an error message.
pub type CallReply = std::result::Result<Value, String>;

/// A named call handler registered with [`BridgeCoordinator::on_call`] or
/// [`BridgeWorker::on_call`].
pub type CallHandler = Arc<dyn Fn(Value) -> BoxFuture<'static, CallReply> + Send + Sync>;

type Handlers = Arc<RwLock<HashMap<String, CallHandler>>>;

fn register_handler<F, Fut>(handlers: &Handlers, name: String, handler: F)
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = CallReply> + Send + 'static,
{
    let handler: CallHandler = Arc::new(move |params| handler(params).boxed());
    if handlers.write().insert(name.clone(), handler).is_some() {
        debug!("Replaced bridge call handler '{name}'");
    }
}

async fn run_handler(handlers: &Handlers, action: &str, params: Value) -> CallReply {
    let handler = handlers.read().get(action).cloned();
    match handler {
        Some(handler) => handler(params).await,
        None => Err(format!("no handler for '{action}'")),
    }
}

/// Keep a handler's own message; describe anything else.
fn reply_error(error: MeshError) -> String {
    match error {
        MeshError::Remote(message) => message,
        other => other.to_string(),
    }
}

/// Mesh operation a worker asks the coordinator to perform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BridgeAction {
    Broadcast { data: Value },
    SendToNode { target: String, data: Value },
    ListNodes,
    NodeId,
    /// Run the named handler on the coordinator and every other worker.
    /// Answered with a serialized [`CallResults`].
    Call { action: String, params: Value },
}

/// One line on the bridge pipe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BridgeMessage {
    /// Worker → coordinator.
    Request {
        topic: String,
        correlation_id: String,
        action: BridgeAction,
    },
    /// Answer to a `Request` (coordinator → worker) or to a `Call`
    /// (worker → coordinator), carrying the same id.
    Response {
        topic: String,
        correlation_id: String,
        result: CallReply,
    },
    /// Coordinator → worker, a broadcast the mesh delivered to this node.
    Event {
        topic: String,
        sender: NodeId,
        data: Value,
    },
    /// Coordinator → worker, run a registered handler.
    Call {
        topic: String,
        correlation_id: String,
        action: String,
        params: Value,
    },
}

impl BridgeMessage {
    pub fn topic(&self) -> &str {
        match self {
            Self::Request { topic, .. }
            | Self::Response { topic, .. }
            | Self::Event { topic, .. }
            | Self::Call { topic, .. } => topic,
        }
    }

    /// Serialize as one newline-terminated line.
    pub fn to_line(&self) -> Result<String> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }

    pub fn from_line(line: &str) -> Result<Self> {
        Ok(serde_json::from_str(line.trim_end())?)
    }
}

/// Who answered one leg of a fan-out call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Responder {
    Coordinator,
    Worker(u64),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallOutcome {
    pub responder: Responder,
    pub result: CallReply,
}

/// Aggregated outcome of a fan-out call, one entry per responder.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CallResults {
    pub results: Vec<CallOutcome>,
}

impl CallResults {
    /// At least one responder answered without an error.
    pub fn is_valid(&self) -> bool {
        self.first_result().is_some()
    }

    pub fn first_result(&self) -> Option<&Value> {
        self.results.iter().find_map(|outcome| outcome.result.as_ref().ok())
    }

    pub fn first_error(&self) -> Option<&str> {
        self.results
            .iter()
            .find_map(|outcome| outcome.result.as_ref().err().map(String::as_str))
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &CallOutcome> {
        self.results.iter()
    }
}

/// Drain `rx` into `writer`, one line per message.
async fn write_lines<W>(mut writer: W, mut rx: mpsc::UnboundedReceiver<BridgeMessage>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(message) = rx.recv().await {
        let line = match message.to_line() {
            Ok(line) => line,
            Err(e) => {
                warn!("Failed to encode bridge message: {e}");
                continue;
            }
        };
        if writer.write_all(line.as_bytes()).await.is_err() || writer.flush().await.is_err() {
            debug!("Bridge pipe closed for writing");
            break;
        }
    }
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

type WorkerSet = Arc<RwLock<HashMap<u64, mpsc::UnboundedSender<BridgeMessage>>>>;

struct OutstandingCall {
    worker: u64,
    tx: oneshot::Sender<CallReply>,
}

/// Coordinator state shared with each worker's reader task.
struct Hub {
    router: Arc<MeshRouter>,
    topic: String,
    workers: WorkerSet,
    handlers: Handlers,
    calls: Mutex<HashMap<String, OutstandingCall>>,
    timeout: Duration,
}

impl Hub {
    async fn call_worker(&self, worker_id: u64, action: &str, params: Value) -> Result<Value> {
        let sender = self.workers.read().get(&worker_id).cloned();
        let Some(sender) = sender else {
            return Err(MeshError::Bridge(format!("no bridge worker {worker_id}")));
        };

        let correlation_id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.calls
            .lock()
            .insert(correlation_id.clone(), OutstandingCall { worker: worker_id, tx });

        let call = BridgeMessage::Call {
            topic: self.topic.clone(),
            correlation_id: correlation_id.clone(),
            action: action.to_string(),
            params,
        };
        if sender.send(call).is_err() {
            self.calls.lock().remove(&correlation_id);
            return Err(MeshError::Bridge(format!("bridge worker {worker_id} detached")));
        }

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(message))) => Err(MeshError::Remote(message)),
            Ok(Err(_)) => Err(MeshError::Bridge(format!("bridge worker {worker_id} detached"))),
            Err(_) => {
                self.calls.lock().remove(&correlation_id);
                Err(MeshError::Timeout(self.timeout))
            }
        }
    }

    /// Call every worker except `caller`. A worker-initiated fan-out also
    /// runs the coordinator's own handler, listed first.
    async fn fan_out(&self, action: &str, params: Value, caller: Option<u64>) -> CallResults {
        let mut ids: Vec<u64> = self
            .workers
            .read()
            .keys()
            .copied()
            .filter(|id| Some(*id) != caller)
            .collect();
        ids.sort_unstable();

        let local = async {
            match caller {
                Some(_) => Some(CallOutcome {
                    responder: Responder::Coordinator,
                    result: run_handler(&self.handlers, action, params.clone()).await,
                }),
                None => None,
            }
        };
        let remote = join_all(ids.into_iter().map(|id| {
            let params = params.clone();
            async move {
                CallOutcome {
                    responder: Responder::Worker(id),
                    result: self.call_worker(id, action, params).await.map_err(reply_error),
                }
            }
        }));

        let (local, remote) = futures::join!(local, remote);
        CallResults {
            results: local.into_iter().chain(remote).collect(),
        }
    }

    async fn execute(&self, worker_id: u64, action: BridgeAction) -> Result<Value> {
        let router = &self.router;
        match action {
            BridgeAction::Broadcast { data } => Ok(Value::from(router.broadcast(data))),
            BridgeAction::SendToNode { target, data } => {
                router.send_to_node(&target, data)?;
                Ok(Value::Null)
            }
            BridgeAction::ListNodes => Ok(serde_json::to_value(router.nodes())?),
            BridgeAction::NodeId => Ok(Value::String(router.id().to_string())),
            BridgeAction::Call { action, params } => {
                let results = self.fan_out(&action, params, Some(worker_id)).await;
                Ok(serde_json::to_value(results)?)
            }
        }
    }

    /// Settle an outstanding call, but only from the worker it was sent to.
    fn settle(&self, worker_id: u64, correlation_id: &str, result: CallReply) {
        let call = {
            let mut calls = self.calls.lock();
            let owned = calls
                .get(correlation_id)
                .is_some_and(|call| call.worker == worker_id);
            if owned { calls.remove(correlation_id) } else { None }
        };
        match call {
            Some(call) => {
                let _ = call.tx.send(result);
            }
            None => trace!("Discarding response {correlation_id} from worker {worker_id}"),
        }
    }

    fn detach(&self, worker_id: u64) {
        self.workers.write().remove(&worker_id);
        self.calls.lock().retain(|_, call| call.worker != worker_id);
        debug!("Bridge worker {worker_id} detached");
    }
}

/// Serves bridge requests against the router, fans mesh broadcasts out to
/// every attached worker and calls handlers registered on them.
pub struct BridgeCoordinator {
    hub: Arc<Hub>,
    next_worker: AtomicU64,
}

impl BridgeCoordinator {
    /// Calls to workers expire after the router's `request_timeout`.
    pub fn new(router: Arc<MeshRouter>) -> Self {
        let topic = router.config().fingerprint();
        let timeout = router.config().request_timeout;
        let workers: WorkerSet = Arc::new(RwLock::new(HashMap::new()));
        router.add_observer(Arc::new(EventForwarder {
            topic: topic.clone(),
            workers: Arc::clone(&workers),
        }));
        Self {
            hub: Arc::new(Hub {
                router,
                topic,
                workers,
                handlers: Arc::new(RwLock::new(HashMap::new())),
                calls: Mutex::new(HashMap::new()),
                timeout,
            }),
            next_worker: AtomicU64::new(1),
        }
    }

    pub fn topic(&self) -> &str {
        &self.hub.topic
    }

    pub fn router(&self) -> &Arc<MeshRouter> {
        &self.hub.router
    }

    pub fn worker_count(&self) -> usize {
        self.hub.workers.read().len()
    }

    pub fn worker_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.hub.workers.read().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Register the handler workers reach through their fan-out calls.
    pub fn on_call<F, Fut>(&self, name: impl Into<String>, handler: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = CallReply> + Send + 'static,
    {
        register_handler(&self.hub.handlers, name.into(), handler);
    }

    /// Run `action` on one worker. A handler error comes back as
    /// [`MeshError::Remote`].
    pub async fn call_worker(&self, worker_id: u64, action: &str, params: Value) -> Result<Value> {
        self.hub.call_worker(worker_id, action, params).await
    }

    /// Run `action` on every attached worker, in worker id order.
    pub async fn call_all(&self, action: &str, params: Value) -> CallResults {
        self.hub.fan_out(action, params, None).await
    }

    /// Serve one worker over the given pipe halves. Returns the worker's
    /// local id; the worker is dropped when its reader reaches EOF.
    pub fn attach<R, W>(&self, reader: R, writer: W) -> u64
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let worker_id = self.next_worker.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        self.hub.workers.write().insert(worker_id, tx.clone());
        tokio::spawn(write_lines(writer, rx));

        let hub = Arc::clone(&self.hub);
        tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            loop {
                let line = match lines.next_line().await {
                    Ok(Some(line)) => line,
                    Ok(None) => break,
                    Err(e) => {
                        debug!("Bridge read error from worker {worker_id}: {e}");
                        break;
                    }
                };
                let message = match BridgeMessage::from_line(&line) {
                    Ok(message) => message,
                    Err(e) => {
                        trace!("Discarding malformed bridge line from worker {worker_id}: {e}");
                        continue;
                    }
                };
                if message.topic() != hub.topic {
                    trace!(
                        "Ignoring bridge message for topic {} from worker {worker_id}",
                        message.topic()
                    );
                    continue;
                }
                match message {
                    BridgeMessage::Request {
                        correlation_id,
                        action,
                        ..
                    } => {
                        // Fan-out calls wait on other workers, so each
                        // request runs off the reader task.
                        let hub = Arc::clone(&hub);
                        let tx = tx.clone();
                        tokio::spawn(async move {
                            let result = hub.execute(worker_id, action).await.map_err(|e| e.to_string());
                            let _ = tx.send(BridgeMessage::Response {
                                topic: hub.topic.clone(),
                                correlation_id,
                                result,
                            });
                        });
                    }
                    BridgeMessage::Response {
                        correlation_id,
                        result,
                        ..
                    } => hub.settle(worker_id, &correlation_id, result),
                    BridgeMessage::Event { .. } | BridgeMessage::Call { .. } => {
                        trace!("Ignoring coordinator-bound message from worker {worker_id}");
                    }
                }
            }
            hub.detach(worker_id);
        });

        worker_id
    }

    /// Spawn `command` as a worker with piped stdio and the topic exported
    /// in [`TOPIC_ENV`].
    pub fn spawn_worker(&self, mut command: Command) -> Result<Child> {
        command
            .env(TOPIC_ENV, &self.hub.topic)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .kill_on_drop(true);
        let mut child = command.spawn()?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| MeshError::Bridge("worker stdin not piped".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| MeshError::Bridge("worker stdout not piped".into()))?;
        let worker_id = self.attach(stdout, stdin);
        info!("Spawned bridge worker {worker_id} (pid {:?})", child.id());
        Ok(child)
    }
}

struct EventForwarder {
    topic: String,
    workers: WorkerSet,
}

impl TopologyObserver for EventForwarder {
    fn on_message(&self, message: &IncomingMessage) {
        for worker in self.workers.read().values() {
            let _ = worker.send(BridgeMessage::Event {
                topic: self.topic.clone(),
                sender: message.sender.clone(),
                data: message.data.clone(),
            });
        }
    }
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

/// A broadcast forwarded by the coordinator.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerEvent {
    pub sender: NodeId,
    pub data: Value,
}

type ReplySlots = Arc<Mutex<HashMap<String, oneshot::Sender<CallReply>>>>;

/// Worker-side handle issuing mesh operations through the coordinator.
pub struct BridgeWorker {
    topic: String,
    outbound: mpsc::UnboundedSender<BridgeMessage>,
    pending: ReplySlots,
    handlers: Handlers,
    timeout: Duration,
}

impl BridgeWorker {
    /// Speak the bridge protocol over the given pipe halves. Returns the
    /// handle and the stream of forwarded broadcasts.
    pub fn new<R, W>(
        topic: impl Into<String>,
        reader: R,
        writer: W,
        timeout: Duration,
    ) -> (Self, mpsc::UnboundedReceiver<WorkerEvent>)
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let topic = topic.into();
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let pending: ReplySlots = Arc::new(Mutex::new(HashMap::new()));
        let handlers: Handlers = Arc::new(RwLock::new(HashMap::new()));
        tokio::spawn(write_lines(writer, outbound_rx));

        let reader_topic = topic.clone();
        let reader_pending = Arc::clone(&pending);
        let reader_handlers = Arc::clone(&handlers);
        let reader_outbound = outbound.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let Ok(message) = BridgeMessage::from_line(&line) else {
                    trace!("Discarding malformed bridge line");
                    continue;
                };
                if message.topic() != reader_topic {
                    trace!("Ignoring bridge message for topic {}", message.topic());
                    continue;
                }
                match message {
                    BridgeMessage::Response {
                        correlation_id,
                        result,
                        ..
                    } => match reader_pending.lock().remove(&correlation_id) {
                        Some(slot) => {
                            let _ = slot.send(result);
                        }
                        None => trace!("Discarding response with unknown id {correlation_id}"),
                    },
                    BridgeMessage::Event { sender, data, .. } => {
                        let _ = events_tx.send(WorkerEvent { sender, data });
                    }
                    BridgeMessage::Call {
                        topic,
                        correlation_id,
                        action,
                        params,
                    } => {
                        let handlers = Arc::clone(&reader_handlers);
                        let outbound = reader_outbound.clone();
                        tokio::spawn(async move {
                            let result = run_handler(&handlers, &action, params).await;
                            let _ = outbound.send(BridgeMessage::Response {
                                topic,
                                correlation_id,
                                result,
                            });
                        });
                    }
                    BridgeMessage::Request { .. } => {}
                }
            }
            // Coordinator gone: fail everything still waiting.
            reader_pending.lock().clear();
        });

        (
            Self {
                topic,
                outbound,
                pending,
                handlers,
                timeout,
            },
            events_rx,
        )
    }

    /// Connect over this process's stdin/stdout, taking the topic from
    /// [`TOPIC_ENV`].
    pub fn from_stdio(timeout: Duration) -> Result<(Self, mpsc::UnboundedReceiver<WorkerEvent>)> {
        let topic = stdio_topic(std::env::var(TOPIC_ENV).ok())?;
        Ok(Self::new(topic, tokio::io::stdin(), tokio::io::stdout(), timeout))
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Register the handler the coordinator (and, through it, other
    /// workers) can call on this worker.
    pub fn on_call<F, Fut>(&self, name: impl Into<String>, handler: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = CallReply> + Send + 'static,
    {
        register_handler(&self.handlers, name.into(), handler);
    }

    /// Send one action and wait for the matching response.
    pub async fn request(&self, action: BridgeAction) -> Result<Value> {
        let correlation_id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(correlation_id.clone(), tx);

        let request = BridgeMessage::Request {
            topic: self.topic.clone(),
            correlation_id: correlation_id.clone(),
            action,
        };
        if self.outbound.send(request).is_err() {
            self.pending.lock().remove(&correlation_id);
            return Err(MeshError::Bridge("coordinator pipe closed".into()));
        }

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(message))) => Err(MeshError::Remote(message)),
            Ok(Err(_)) => Err(MeshError::Bridge("coordinator pipe closed".into())),
            Err(_) => {
                self.pending.lock().remove(&correlation_id);
                Err(MeshError::Timeout(self.timeout))
            }
        }
    }

    pub async fn broadcast(&self, data: Value) -> Result<usize> {
        let sent = self.request(BridgeAction::Broadcast { data }).await?;
        Ok(serde_json::from_value(sent)?)
    }

    pub async fn send_to_node(&self, target: impl Into<String>, data: Value) -> Result<()> {
        self.request(BridgeAction::SendToNode {
            target: target.into(),
            data,
        })
        .await
        .map(|_| ())
    }

    pub async fn list_nodes(&self) -> Result<Vec<NodeId>> {
        let nodes = self.request(BridgeAction::ListNodes).await?;
        Ok(serde_json::from_value(nodes)?)
    }

    pub async fn node_id(&self) -> Result<NodeId> {
        let id = self.request(BridgeAction::NodeId).await?;
        Ok(serde_json::from_value(id)?)
    }

    /// Run `action` on the coordinator and every other worker. The
    /// coordinator's own timeout applies to each worker leg, so this
    /// worker's timeout should be the longer of the two.
    pub async fn call_all(&self, action: impl Into<String>, params: Value) -> Result<CallResults> {
        let results = self
            .request(BridgeAction::Call {
                action: action.into(),
                params,
            })
            .await?;
        Ok(serde_json::from_value(results)?)
    }
}

fn stdio_topic(value: Option<String>) -> Result<String> {
    match value {
        Some(topic) if !topic.is_empty() => Ok(topic),
        _ => Err(MeshError::Bridge(format!("{TOPIC_ENV} is not set"))),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
