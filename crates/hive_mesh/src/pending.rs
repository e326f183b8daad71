//! Pending correlated calls awaiting a `MESSAGE_RETURN`.

use std::collections::HashMap;

use serde_json::Value;
use tokio::sync::oneshot;

use crate::error::MeshError;
use crate::identity::NodeId;
use crate::message::Envelope;

pub type CallResult = Result<Value, MeshError>;

struct PendingCall {
    tx: oneshot::Sender<CallResult>,
    first_hop: NodeId,
}

/// Tracks in-flight requests by message id and routes replies back to the
/// awaiting caller. The caller enforces the deadline and calls
/// [`remove`](PendingCalls::remove) when it expires.
#[derive(Default)]
pub struct PendingCalls {
    pending: HashMap<String, PendingCall>,
}

impl PendingCalls {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a call sent through `first_hop`, returning the receiver that
    /// will deliver its outcome.
    pub fn register(&mut self, message_id: &str, first_hop: NodeId) -> oneshot::Receiver<CallResult> {
        let (tx, rx) = oneshot::channel();
        self.pending
            .insert(message_id.to_string(), PendingCall { tx, first_hop });
        rx
    }

    /// Settle a call from its `MESSAGE_RETURN`. An `ERROR` field rejects it.
    /// Returns `false` for unknown (late or duplicate) replies.
    pub fn complete(&mut self, reply: &Envelope) -> bool {
        let Some(message_id) = reply.message_id.as_deref() else {
            return false;
        };
        let outcome = match &reply.error {
            Some(error) => Err(MeshError::Remote(error.clone())),
            None => Ok(reply.data.clone()),
        };
        self.settle(message_id, outcome)
    }

    pub fn resolve(&mut self, message_id: &str, value: Value) -> bool {
        self.settle(message_id, Ok(value))
    }

    pub fn reject(&mut self, message_id: &str, error: MeshError) -> bool {
        self.settle(message_id, Err(error))
    }

    /// Reject every call whose first hop was `peer`. Returns how many.
    pub fn fail_via(&mut self, peer: &NodeId) -> usize {
        let lost: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, call)| call.first_hop == *peer)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &lost {
            self.reject(id, MeshError::ConnectionLost(peer.to_string()));
        }
        lost.len()
    }

    /// Forget a call without settling it.
    pub fn remove(&mut self, message_id: &str) -> bool {
        self.pending.remove(message_id).is_some()
    }

    pub fn has_pending(&self, message_id: &str) -> bool {
        self.pending.contains_key(message_id)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Drop every call; waiting receivers see a closed channel.
    pub fn cancel_all(&mut self) {
        self.pending.clear();
    }

    fn settle(&mut self, message_id: &str, outcome: CallResult) -> bool {
        match self.pending.remove(message_id) {
            Some(call) => call.tx.send(outcome).is_ok(),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageKind;
    use serde_json::json;

    fn hop(s: &str) -> NodeId {
        NodeId::from(s)
    }

    fn reply(id: &str, data: Value, error: Option<&str>) -> Envelope {
        let mut env = Envelope::new(MessageKind::MessageReturn, hop("remote"), vec![], data)
            .with_message_id(id);
        env.error = error.map(str::to_string);
        env
    }

    #[tokio::test]
    async fn test_complete_delivers_data() {
        let mut calls = PendingCalls::new();
        let rx = calls.register("m1", hop("b"));
        assert!(calls.has_pending("m1"));

        assert!(calls.complete(&reply("m1", json!(["c", "d"]), None)));
        assert_eq!(rx.await.unwrap().unwrap(), json!(["c", "d"]));
        assert_eq!(calls.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_error_field_rejects() {
        let mut calls = PendingCalls::new();
        let rx = calls.register("m1", hop("b"));
        assert!(calls.complete(&reply("m1", Value::Null, Some("no route"))));
        match rx.await.unwrap() {
            Err(MeshError::Remote(msg)) => assert_eq!(msg, "no route"),
            other => panic!("expected remote error, got {other:?}"),
        }
    }

    #[test]
    fn test_unknown_and_duplicate_replies_are_ignored() {
        let mut calls = PendingCalls::new();
        let _rx = calls.register("m1", hop("b"));
        assert!(!calls.complete(&reply("other", Value::Null, None)));
        assert!(calls.resolve("m1", Value::Null));
        assert!(!calls.resolve("m1", Value::Null));

        let no_id = Envelope::new(MessageKind::MessageReturn, hop("x"), vec![], Value::Null);
        assert!(!calls.complete(&no_id));
    }

    #[tokio::test]
    async fn test_fail_via_rejects_only_matching_first_hop() {
        let mut calls = PendingCalls::new();
        let via_b = calls.register("m1", hop("b"));
        let via_c = calls.register("m2", hop("c"));

        assert_eq!(calls.fail_via(&hop("b")), 1);
        assert!(matches!(via_b.await.unwrap(), Err(MeshError::ConnectionLost(_))));
        assert!(calls.has_pending("m2"));

        assert!(calls.reject("m2", MeshError::Timeout(std::time::Duration::from_secs(1))));
        assert!(matches!(via_c.await.unwrap(), Err(MeshError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_remove_and_cancel_all() {
        let mut calls = PendingCalls::new();
        let rx1 = calls.register("m1", hop("b"));
        let rx2 = calls.register("m2", hop("b"));

        assert!(calls.remove("m1"));
        assert!(!calls.remove("m1"));
        assert!(rx1.await.is_err());

        calls.cancel_all();
        assert_eq!(calls.pending_count(), 0);
        assert!(rx2.await.is_err());
    }
}
