//! Typed gateway events.
//!
//! Event frames are decoded once, at the socket boundary, into [`GatewayEvent`].
//! Known event names whose payload does not fit the expected shape degrade to
//! [`GatewayEvent::Other`] so delivery order is preserved.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::protocol::{CHALLENGE_EVENT, EventFrame};

pub const TICK_EVENT: &str = "tick";
pub const HEALTH_EVENT: &str = "health";
pub const PRESENCE_EVENT: &str = "presence";
pub const SHUTDOWN_EVENT: &str = "shutdown";
pub const APPROVAL_REQUESTED_EVENT: &str = "exec.approval.requested";
pub const APPROVAL_RESOLVED_EVENT: &str = "exec.approval.resolved";
pub const NODE_INVOKE_EVENT: &str = "node.invoke.request";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Challenge {
    pub nonce: String,
    #[serde(default)]
    pub ts: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Shutdown {
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub restart_expected_ms: Option<u64>,
}

/// A pending approval as the gateway describes it, both in
/// `exec.approval.requested` events and in snapshot listings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalRequested {
    pub id: String,
    pub command: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    /// Agent the command runs for
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    #[serde(default)]
    pub requested_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_at: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalResolved {
    pub id: String,
    pub decision: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_by: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeInvokeRequest {
    pub id: String,
    pub node_id: String,
    pub command: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum GatewayEvent {
    Challenge(Challenge),
    Tick { ts: Option<i64> },
    Health(Value),
    Presence(Value),
    Shutdown(Shutdown),
    ApprovalRequested(ApprovalRequested),
    ApprovalResolved(ApprovalResolved),
    NodeInvoke(NodeInvokeRequest),
    Other { event: String, payload: Value },
}

impl GatewayEvent {
    pub fn decode(frame: &EventFrame) -> Self {
        let payload = &frame.payload;
        match frame.event.as_str() {
            CHALLENGE_EVENT => typed(frame, GatewayEvent::Challenge),
            TICK_EVENT => GatewayEvent::Tick {
                ts: payload.get("ts").and_then(Value::as_i64),
            },
            HEALTH_EVENT => GatewayEvent::Health(payload.clone()),
            PRESENCE_EVENT => GatewayEvent::Presence(payload.clone()),
            SHUTDOWN_EVENT => {
                if payload.is_null() {
                    GatewayEvent::Shutdown(Shutdown::default())
                } else {
                    typed(frame, GatewayEvent::Shutdown)
                }
            }
            APPROVAL_REQUESTED_EVENT => typed(frame, GatewayEvent::ApprovalRequested),
            APPROVAL_RESOLVED_EVENT => typed(frame, GatewayEvent::ApprovalResolved),
            NODE_INVOKE_EVENT => typed(frame, GatewayEvent::NodeInvoke),
            _ => other(frame),
        }
    }

    /// Wire name of the event.
    pub fn name(&self) -> &str {
        match self {
            GatewayEvent::Challenge(_) => CHALLENGE_EVENT,
            GatewayEvent::Tick { .. } => TICK_EVENT,
            GatewayEvent::Health(_) => HEALTH_EVENT,
            GatewayEvent::Presence(_) => PRESENCE_EVENT,
            GatewayEvent::Shutdown(_) => SHUTDOWN_EVENT,
            GatewayEvent::ApprovalRequested(_) => APPROVAL_REQUESTED_EVENT,
            GatewayEvent::ApprovalResolved(_) => APPROVAL_RESOLVED_EVENT,
            GatewayEvent::NodeInvoke(_) => NODE_INVOKE_EVENT,
            GatewayEvent::Other { event, .. } => event,
        }
    }
}

fn typed<T: DeserializeOwned>(frame: &EventFrame, wrap: fn(T) -> GatewayEvent) -> GatewayEvent {
    match serde_json::from_value::<T>(frame.payload.clone()) {
        Ok(payload) => wrap(payload),
        Err(err) => {
            warn!(event = %frame.event, error = %err, "Malformed event payload");
            other(frame)
        }
    }
}

fn other(frame: &EventFrame) -> GatewayEvent {
    GatewayEvent::Other {
        event: frame.event.clone(),
        payload: frame.payload.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn frame(event: &str, payload: Value) -> EventFrame {
        EventFrame {
            event: event.to_string(),
            payload,
            seq: None,
        }
    }

    #[test]
    fn test_decode_challenge() {
        let event = GatewayEvent::decode(&frame(CHALLENGE_EVENT, json!({"nonce": "abc", "ts": 5})));
        assert_eq!(
            event,
            GatewayEvent::Challenge(Challenge {
                nonce: "abc".to_string(),
                ts: Some(5)
            })
        );
    }

    #[test]
    fn test_decode_approval_requested() {
        let event = GatewayEvent::decode(&frame(
            APPROVAL_REQUESTED_EVENT,
            json!({
                "id": "a1",
                "command": "git",
                "args": ["push"],
                "scopeId": "main",
                "requestedAt": 1000,
                "timeoutAt": 121000
            }),
        ));
        let GatewayEvent::ApprovalRequested(request) = event else {
            panic!("expected approval request");
        };
        assert_eq!(request.scope_id.as_deref(), Some("main"));
        assert_eq!(request.node_id, None);
        assert_eq!(request.args, vec!["push"]);
        assert_eq!(request.timeout_at, Some(121_000));
    }

    #[test]
    fn test_decode_node_invoke() {
        let event = GatewayEvent::decode(&frame(
            NODE_INVOKE_EVENT,
            json!({"id": "i1", "nodeId": "mac", "command": "system.run"}),
        ));
        assert!(matches!(event, GatewayEvent::NodeInvoke(ref invoke) if invoke.node_id == "mac"));
        assert_eq!(event.name(), NODE_INVOKE_EVENT);
    }

    #[test]
    fn test_shutdown_without_payload() {
        let event = GatewayEvent::decode(&frame(SHUTDOWN_EVENT, Value::Null));
        assert_eq!(event, GatewayEvent::Shutdown(Shutdown::default()));
    }

    #[test]
    fn test_malformed_known_event_degrades_to_other() {
        let event = GatewayEvent::decode(&frame(APPROVAL_RESOLVED_EVENT, json!({"id": 5})));
        assert!(matches!(event, GatewayEvent::Other { ref event, .. } if event == APPROVAL_RESOLVED_EVENT));
    }

    #[test]
    fn test_unknown_event_is_other() {
        let event = GatewayEvent::decode(&frame("chat", json!({"text": "hi"})));
        assert_eq!(event.name(), "chat");
        assert!(matches!(event, GatewayEvent::Other { .. }));
    }
}
