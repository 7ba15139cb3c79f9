//! Outbound call admission.
//!
//! A strict-FIFO gate bounded by the peer's call concurrency. Owned by the
//! peer task; a parked submission leaves the queue only by admission or
//! abort.

use std::{collections::VecDeque, time::Duration};

use serde_json::Value;

use crate::{error::RpcError, pending::CallSink};

/// An outbound call waiting for (or holding) a concurrency slot.
pub(crate) struct QueuedCall {
    pub(crate) message_id: String,
    pub(crate) method: String,
    pub(crate) params: Value,
    pub(crate) timeout: Option<Duration>,
    pub(crate) no_reply: bool,
    pub(crate) sink: CallSink,
}

pub(crate) struct CallQueue {
    waiting: VecDeque<QueuedCall>,
    active: usize,
    concurrency: usize,
}

impl CallQueue {
    pub(crate) fn new(concurrency: usize) -> Self {
        Self {
            waiting: VecDeque::new(),
            active: 0,
            concurrency,
        }
    }

    /// Admit `call` if a slot is free, otherwise park it in arrival order.
    pub(crate) fn admit(&mut self, call: QueuedCall) -> Option<QueuedCall> {
        if self.active < self.concurrency {
            self.active += 1;
            Some(call)
        } else {
            self.waiting.push_back(call);
            None
        }
    }

    /// Release the slot of a completed call and admit the next in line.
    pub(crate) fn release(&mut self) -> Option<QueuedCall> {
        debug_assert!(self.active > 0);
        self.active = self.active.saturating_sub(1);
        let next = self.waiting.pop_front()?;
        self.active += 1;
        Some(next)
    }

    /// Remove an aborted submission from the waiting line; no side effects.
    pub(crate) fn take_waiting(&mut self, message_id: &str) -> Option<QueuedCall> {
        let index = self
            .waiting
            .iter()
            .position(|call| call.message_id == message_id)?;
        self.waiting.remove(index)
    }

    /// Reject every parked submission with `error`.
    pub(crate) fn reject_waiting(&mut self, error: &RpcError) {
        for call in self.waiting.drain(..) {
            let _ = call.sink.send(Err(error.clone()));
        }
    }

    /// Reject parked submissions and forget active slots. Used when the
    /// in-flight calls they account for have already been failed wholesale.
    pub(crate) fn reset(&mut self, error: &RpcError) {
        self.reject_waiting(error);
        self.active = 0;
    }

    pub(crate) fn active(&self) -> usize {
        self.active
    }

    pub(crate) fn is_idle(&self) -> bool {
        self.active == 0 && self.waiting.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tokio::sync::oneshot;

    use super::*;

    fn call(id: &str) -> (QueuedCall, oneshot::Receiver<Result<Value, RpcError>>) {
        let (tx, rx) = oneshot::channel();
        (
            QueuedCall {
                message_id: id.into(),
                method: "M".into(),
                params: json!({}),
                timeout: None,
                no_reply: false,
                sink: tx,
            },
            rx,
        )
    }

    #[test]
    fn admission_is_bounded_and_fifo() {
        let mut queue = CallQueue::new(2);
        let (a, _ra) = call("a");
        let (b, _rb) = call("b");
        let (c, _rc) = call("c");
        let (d, _rd) = call("d");

        assert!(queue.admit(a).is_some());
        assert!(queue.admit(b).is_some());
        assert!(queue.admit(c).is_none(), "over the cap: parked");
        assert!(queue.admit(d).is_none());
        assert_eq!(queue.active(), 2);

        let next = queue.release().expect("c admitted next");
        assert_eq!(next.message_id, "c");
        let next = queue.release().expect("d after c");
        assert_eq!(next.message_id, "d");
        assert_eq!(queue.active(), 2);

        assert!(queue.release().is_none());
        assert!(queue.release().is_none());
        assert!(queue.is_idle());
    }

    #[test]
    fn aborted_submissions_leave_without_side_effects() {
        let mut queue = CallQueue::new(1);
        let (a, _ra) = call("a");
        let (b, mut rb) = call("b");
        assert!(queue.admit(a).is_some());
        assert!(queue.admit(b).is_none());

        let taken = queue.take_waiting("b").expect("parked");
        assert_eq!(taken.message_id, "b");
        drop(taken);
        assert!(rb.try_recv().is_err(), "no value was sent");

        // Slot accounting is untouched by the abort.
        assert!(queue.release().is_none());
        assert!(queue.is_idle());
    }

    #[tokio::test]
    async fn reject_waiting_notifies_parked_callers() {
        let mut queue = CallQueue::new(1);
        let (a, _ra) = call("a");
        let (b, rb) = call("b");
        assert!(queue.admit(a).is_some());
        assert!(queue.admit(b).is_none());

        queue.reject_waiting(&RpcError::closing());
        let err = rb.await.expect("sink").expect_err("rejected");
        assert_eq!(err.description, "Client closing");
    }
}
