//! Inbound routing: response correlation, sequence tracking and event fan-out.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::error::{GatewayError, TransportError};
use crate::events::{GatewayEvent, NodeInvokeRequest};
use crate::protocol::ResponseFrame;

pub type CallResult = std::result::Result<Value, GatewayError>;

/// Outstanding requests waiting for a response frame with the same id.
#[derive(Default)]
pub struct PendingCalls {
    calls: Mutex<HashMap<String, oneshot::Sender<CallResult>>>,
}

impl PendingCalls {
    pub fn register(&self, id: &str) -> oneshot::Receiver<CallResult> {
        let (tx, rx) = oneshot::channel();
        self.calls.lock().insert(id.to_string(), tx);
        rx
    }

    /// Drop a pending entry without completing it (send failure or timeout).
    pub fn cancel(&self, id: &str) -> bool {
        self.calls.lock().remove(id).is_some()
    }

    /// Fulfill the call matching `response.id`. Unknown ids are dropped.
    pub fn complete(&self, response: ResponseFrame) -> bool {
        let Some(sender) = self.calls.lock().remove(&response.id) else {
            debug!(id = %response.id, "Dropping response for unknown request id");
            return false;
        };
        let result = response.into_result().map_err(GatewayError::Remote);
        // The caller may have stopped waiting.
        let _ = sender.send(result);
        true
    }

    /// Reject every outstanding call with `error`, returning how many there were.
    pub fn fail_all(&self, error: &TransportError) -> usize {
        let drained: Vec<_> = self.calls.lock().drain().collect();
        let count = drained.len();
        for (_, sender) in drained {
            let _ = sender.send(Err(GatewayError::Transport(error.clone())));
        }
        count
    }

    pub fn len(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Observability counters for event sequence numbers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SequenceStats {
    /// Highest sequence number observed on the current connection
    pub last_seq: Option<u64>,
    /// Number of times a frame skipped ahead of `last_seq + 1`
    pub gaps: u64,
    /// Total frames skipped across all gaps
    pub missed: u64,
}

#[derive(Default)]
pub struct SequenceTracker {
    stats: Mutex<SequenceStats>,
}

impl SequenceTracker {
    pub fn observe(&self, seq: u64) {
        let mut stats = self.stats.lock();
        // `seq` is untrusted wire input; no arithmetic here may overflow.
        match stats.last_seq {
            Some(last) if seq <= last => {
                debug!(last_seq = last, seq, "Event sequence did not advance");
            }
            Some(last) if seq - last > 1 => {
                let missed = seq - last - 1;
                stats.gaps = stats.gaps.saturating_add(1);
                stats.missed = stats.missed.saturating_add(missed);
                stats.last_seq = Some(seq);
                warn!(last_seq = last, seq, missed, "Event sequence gap");
            }
            _ => stats.last_seq = Some(seq),
        }
    }

    /// Forget the watermark; counters are kept. Called on each new connection.
    pub fn reset_watermark(&self) {
        self.stats.lock().last_seq = None;
    }

    pub fn stats(&self) -> SequenceStats {
        *self.stats.lock()
    }
}

type EventHandler = Arc<dyn Fn(&GatewayEvent) + Send + Sync>;
type NodeInvokeHandler = Arc<dyn Fn(&NodeInvokeRequest) + Send + Sync>;

/// Handle returned by [`EventBus::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Ordered multi-subscriber event fan-out.
///
/// Handlers run in subscription order, synchronously on the session task. A
/// panicking handler is logged and does not stop delivery to the rest.
#[derive(Default)]
pub struct EventBus {
    handlers: RwLock<Vec<(SubscriptionId, EventHandler)>>,
    node_invoke: RwLock<Option<NodeInvokeHandler>>,
    next_id: Mutex<u64>,
}

impl EventBus {
    pub fn subscribe<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&GatewayEvent) + Send + Sync + 'static,
    {
        let id = {
            let mut next = self.next_id.lock();
            *next += 1;
            SubscriptionId(*next)
        };
        self.handlers.write().push((id, Arc::new(handler)));
        id
    }

    /// Subscribe with an unbounded channel, for consumers that need to await.
    pub fn subscribe_channel(&self) -> (SubscriptionId, mpsc::UnboundedReceiver<GatewayEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.subscribe(move |event| {
            let _ = tx.send(event.clone());
        });
        (id, rx)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut handlers = self.handlers.write();
        let before = handlers.len();
        handlers.retain(|(existing, _)| *existing != id);
        handlers.len() != before
    }

    /// Install the node-invoke handler, replacing any previous one.
    pub fn set_node_invoke_handler<F>(&self, handler: F)
    where
        F: Fn(&NodeInvokeRequest) + Send + Sync + 'static,
    {
        *self.node_invoke.write() = Some(Arc::new(handler));
    }

    pub fn publish(&self, event: &GatewayEvent) {
        // Snapshot so handlers may subscribe/unsubscribe without deadlocking.
        let handlers: Vec<EventHandler> = self
            .handlers
            .read()
            .iter()
            .map(|(_, handler)| Arc::clone(handler))
            .collect();

        for handler in handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(event))).is_err() {
                warn!(event = %event.name(), "Event handler panicked");
            }
        }
    }

    pub fn dispatch_node_invoke(&self, request: &NodeInvokeRequest) {
        let handler = self.node_invoke.read().clone();
        match handler {
            Some(handler) => {
                if catch_unwind(AssertUnwindSafe(|| handler(request))).is_err() {
                    warn!(invoke_id = %request.id, "Node invoke handler panicked");
                }
            }
            None => debug!(invoke_id = %request.id, "No node invoke handler installed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn response(id: &str) -> ResponseFrame {
        ResponseFrame {
            id: id.to_string(),
            ok: true,
            payload: Some(json!({"id": id})),
            error: None,
        }
    }

    #[tokio::test]
    async fn test_complete_matches_by_id() {
        let pending = PendingCalls::default();
        let first = pending.register("a");
        let second = pending.register("b");

        assert!(pending.complete(response("b")));
        assert!(pending.complete(response("a")));

        assert_eq!(first.await.unwrap().unwrap(), json!({"id": "a"}));
        assert_eq!(second.await.unwrap().unwrap(), json!({"id": "b"}));
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_id_leaves_others_untouched() {
        let pending = PendingCalls::default();
        let rx = pending.register("a");

        assert!(!pending.complete(response("stale")));
        assert_eq!(pending.len(), 1);

        pending.complete(response("a"));
        assert!(rx.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_remote_error_rejects_call() {
        let pending = PendingCalls::default();
        let rx = pending.register("a");
        pending.complete(ResponseFrame {
            id: "a".to_string(),
            ok: false,
            payload: None,
            error: None,
        });
        assert!(matches!(rx.await.unwrap(), Err(GatewayError::Remote(_))));
    }

    #[tokio::test]
    async fn test_fail_all_rejects_every_call() {
        let pending = PendingCalls::default();
        let first = pending.register("a");
        let second = pending.register("b");

        let error = TransportError::Closed {
            code: 1006,
            reason: "gone".to_string(),
        };
        assert_eq!(pending.fail_all(&error), 2);

        for rx in [first, second] {
            match rx.await.unwrap() {
                Err(GatewayError::Transport(TransportError::Closed { code, .. })) => {
                    assert_eq!(code, 1006)
                }
                other => panic!("unexpected result: {:?}", other),
            }
        }
        assert!(pending.is_empty());
    }

    #[test]
    fn test_sequence_gap_counting() {
        let tracker = SequenceTracker::default();
        tracker.observe(1);
        tracker.observe(2);
        tracker.observe(5);
        tracker.observe(4);
        tracker.observe(9);

        let stats = tracker.stats();
        assert_eq!(stats.last_seq, Some(9));
        assert_eq!(stats.gaps, 2);
        assert_eq!(stats.missed, 5);
    }

    #[test]
    fn test_extreme_sequence_numbers_do_not_overflow() {
        let tracker = SequenceTracker::default();
        tracker.observe(u64::MAX);
        tracker.observe(7);
        tracker.observe(u64::MAX);

        let stats = tracker.stats();
        assert_eq!(stats.last_seq, Some(u64::MAX));
        assert_eq!(stats.gaps, 0);

        let tracker = SequenceTracker::default();
        tracker.observe(0);
        tracker.observe(u64::MAX);
        let stats = tracker.stats();
        assert_eq!(stats.last_seq, Some(u64::MAX));
        assert_eq!(stats.gaps, 1);
        assert_eq!(stats.missed, u64::MAX - 1);
    }

    #[test]
    fn test_reset_watermark_keeps_counters() {
        let tracker = SequenceTracker::default();
        tracker.observe(1);
        tracker.observe(3);
        tracker.reset_watermark();
        tracker.observe(1);

        let stats = tracker.stats();
        assert_eq!(stats.last_seq, Some(1));
        assert_eq!(stats.gaps, 1);
    }

    #[test]
    fn test_handlers_run_in_order_and_survive_panics() {
        let bus = EventBus::default();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let first = seen.clone();
        bus.subscribe(move |event| first.lock().push(format!("first:{}", event.name())));
        bus.subscribe(|_| panic!("boom"));
        let third = seen.clone();
        bus.subscribe(move |event| third.lock().push(format!("third:{}", event.name())));

        bus.publish(&GatewayEvent::Tick { ts: None });
        bus.publish(&GatewayEvent::Health(json!({})));

        assert_eq!(
            *seen.lock(),
            vec!["first:tick", "third:tick", "first:health", "third:health"]
        );
    }

    #[test]
    fn test_unsubscribe() {
        let bus = EventBus::default();
        let count = Arc::new(Mutex::new(0));
        let counter = count.clone();
        let id = bus.subscribe(move |_| *counter.lock() += 1);

        bus.publish(&GatewayEvent::Tick { ts: None });
        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        bus.publish(&GatewayEvent::Tick { ts: None });
        assert_eq!(*count.lock(), 1);
    }

    #[tokio::test]
    async fn test_subscribe_channel() {
        let bus = EventBus::default();
        let (_, mut rx) = bus.subscribe_channel();
        bus.publish(&GatewayEvent::Tick { ts: Some(1) });
        assert_eq!(rx.recv().await.unwrap(), GatewayEvent::Tick { ts: Some(1) });
    }

    #[test]
    fn test_node_invoke_handler() {
        let bus = EventBus::default();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        bus.set_node_invoke_handler(move |request| sink.lock().push(request.id.clone()));

        bus.dispatch_node_invoke(&NodeInvokeRequest {
            id: "i1".to_string(),
            node_id: "mac".to_string(),
            command: "system.run".to_string(),
            params: Value::Null,
        });
        assert_eq!(*seen.lock(), vec!["i1"]);
    }
}
