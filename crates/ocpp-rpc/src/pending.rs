//! Correlation tables for in-flight calls.
//!
//! Both tables are owned by the peer task; all access is serialized through
//! its mailbox, so plain maps suffice.

use std::collections::HashMap;

use serde_json::Value;
use tokio::{sync::oneshot, time::Instant};
use tokio_util::sync::CancellationToken;

use crate::error::RpcError;

pub(crate) type CallSink = oneshot::Sender<Result<Value, RpcError>>;

/// An outbound call awaiting its CALLRESULT or CALLERROR.
pub(crate) struct PendingCall {
    pub(crate) method: String,
    pub(crate) deadline: Instant,
    pub(crate) sink: CallSink,
}

/// Outbound pending-call table: correlation, deadlines, fan-out failure.
#[derive(Default)]
pub(crate) struct PendingCalls {
    entries: HashMap<String, PendingCall>,
}

impl PendingCalls {
    pub(crate) fn insert(&mut self, message_id: String, call: PendingCall) {
        // Message ids are ulids generated by us; a collision would be a bug.
        debug_assert!(!self.entries.contains_key(&message_id));
        self.entries.insert(message_id, call);
    }

    /// Resolve a pending call. Returns `false` on a correlation miss.
    pub(crate) fn resolve(&mut self, message_id: &str, outcome: Result<Value, RpcError>) -> bool {
        match self.entries.remove(message_id) {
            Some(call) => {
                let _ = call.sink.send(outcome);
                true
            }
            None => false,
        }
    }

    /// Drop an entry without notifying the caller (abort path).
    pub(crate) fn remove(&mut self, message_id: &str) -> bool {
        self.entries.remove(message_id).is_some()
    }

    pub(crate) fn contains(&self, message_id: &str) -> bool {
        self.entries.contains_key(message_id)
    }

    pub(crate) fn method_of(&self, message_id: &str) -> Option<&str> {
        self.entries.get(message_id).map(|c| c.method.as_str())
    }

    /// The earliest deadline across all entries.
    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.entries.values().map(|c| c.deadline).min()
    }

    /// Resolve every call whose deadline has passed with the synthetic
    /// timeout error. Returns how many expired.
    pub(crate) fn expire_due(&mut self, now: Instant) -> usize {
        let due: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, call)| call.deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &due {
            self.resolve(id, Err(RpcError::timeout()));
        }
        due.len()
    }

    /// Resolve every entry with `error` (disconnect / close fan-out).
    pub(crate) fn fail_all(&mut self, error: &RpcError) {
        for (_, call) in self.entries.drain() {
            let _ = call.sink.send(Err(error.clone()));
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// An inbound call whose handler is still running.
pub(crate) struct PendingResponse {
    cancel: CancellationToken,
}

/// Inbound pending-response table: handler cancellation and at-most-one
/// reply per message id.
#[derive(Default)]
pub(crate) struct PendingResponses {
    entries: HashMap<String, PendingResponse>,
}

impl PendingResponses {
    /// Track an accepted inbound call; the returned token is handed to the
    /// handler as its disconnect signal.
    pub(crate) fn insert(&mut self, message_id: String, parent: &CancellationToken) -> CancellationToken {
        let token = parent.child_token();
        self.entries.insert(
            message_id,
            PendingResponse {
                cancel: token.clone(),
            },
        );
        token
    }

    /// Mark an inbound call replied. Returns `false` when the entry is gone
    /// (already replied or cancelled), in which case no frame may be sent.
    pub(crate) fn complete(&mut self, message_id: &str) -> bool {
        self.entries.remove(message_id).is_some()
    }

    /// Fire every handler signal and clear the table.
    pub(crate) fn cancel_all(&mut self) {
        for (_, entry) in self.entries.drain() {
            entry.cancel.cancel();
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;

    fn pending(method: &str, deadline: Instant) -> (PendingCall, oneshot::Receiver<Result<Value, RpcError>>) {
        let (tx, rx) = oneshot::channel();
        (
            PendingCall {
                method: method.into(),
                deadline,
                sink: tx,
            },
            rx,
        )
    }

    #[tokio::test]
    async fn resolve_delivers_and_removes() {
        let mut calls = PendingCalls::default();
        let (call, rx) = pending("Heartbeat", Instant::now() + Duration::from_secs(1));
        calls.insert("m1".into(), call);
        assert_eq!(calls.method_of("m1"), Some("Heartbeat"));

        assert!(calls.resolve("m1", Ok(json!({"ok": true}))));
        assert!(calls.is_empty());
        assert_eq!(rx.await.expect("sink"), Ok(json!({"ok": true})));

        assert!(!calls.resolve("m1", Ok(json!({}))), "correlation miss");
    }

    #[tokio::test]
    async fn expiry_sends_synthetic_timeouts() {
        let now = Instant::now();
        let mut calls = PendingCalls::default();
        let (early, early_rx) = pending("A", now + Duration::from_millis(10));
        let (late, _late_rx) = pending("B", now + Duration::from_secs(10));
        calls.insert("a".into(), early);
        calls.insert("b".into(), late);

        assert_eq!(calls.next_deadline(), Some(now + Duration::from_millis(10)));
        assert_eq!(calls.expire_due(now + Duration::from_millis(20)), 1);
        assert_eq!(calls.len(), 1);
        let err = early_rx.await.expect("sink").expect_err("timed out");
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn fail_all_broadcasts_the_error() {
        let mut calls = PendingCalls::default();
        let (a, a_rx) = pending("A", Instant::now() + Duration::from_secs(1));
        let (b, b_rx) = pending("B", Instant::now() + Duration::from_secs(1));
        calls.insert("a".into(), a);
        calls.insert("b".into(), b);

        calls.fail_all(&RpcError::disconnected());
        assert!(calls.is_empty());
        for rx in [a_rx, b_rx] {
            let err = rx.await.expect("sink").expect_err("disconnected");
            assert_eq!(err.description, "Client disconnected");
        }
    }

    #[test]
    fn responses_complete_exactly_once() {
        let parent = CancellationToken::new();
        let mut responses = PendingResponses::default();
        let _signal = responses.insert("m1".into(), &parent);

        assert!(responses.complete("m1"));
        assert!(!responses.complete("m1"), "second reply is a no-op");
    }

    #[test]
    fn cancel_all_fires_handler_signals() {
        let parent = CancellationToken::new();
        let mut responses = PendingResponses::default();
        let signal = responses.insert("m1".into(), &parent);

        responses.cancel_all();
        assert!(signal.is_cancelled());
        assert!(responses.is_empty());
    }
}
