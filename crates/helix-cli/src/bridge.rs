//! Wiring between the gateway session and the approval coordinator.
//!
//! Inbound: `exec.approval.requested` events and snapshot listings become
//! coordinator submissions; `exec.approval.resolved` events are applied as
//! remote decisions. Outbound: local terminal decisions (operator, policy,
//! timeout) are sent back with `approvals.resolve`.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use helix_gateway::methods;
use helix_gateway::{
    ApprovalRequested, ApprovalResolved, GatewayEvent, GatewaySession, HelloOk, SessionObserver,
};
use helix_security::{
    ApprovalCallback, ApprovalCoordinator, ApprovalDecision, ApprovalRequest, ApprovalSubmission,
    Resolution, ResolutionOrigin, ResolveOutcome, Scope, SubmitOutcome,
};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::output;

/// Resolver recorded for remote decisions that do not name who made them.
const REMOTE_FALLBACK: &str = "gateway";

/// Forwards local decisions to the gateway and prints approval activity.
pub struct GatewayResolver {
    session: Arc<GatewaySession>,
}

impl GatewayResolver {
    pub fn new(session: Arc<GatewaySession>) -> Self {
        Self { session }
    }
}

#[async_trait]
impl ApprovalCallback for GatewayResolver {
    async fn request_approval(&self, request: &ApprovalRequest) -> Result<()> {
        output::print_pending(request);
        Ok(())
    }

    async fn on_resolved(&self, resolution: &Resolution) -> Result<()> {
        output::print_resolution(&resolution.entry);
        if resolution.origin == ResolutionOrigin::Remote {
            return Ok(());
        }

        let id = resolution.request.id.clone();
        let params = resolve_params(&id, resolution.entry.decision);
        let session = self.session.clone();
        // The gateway answer must not hold up the bridge loop.
        tokio::spawn(async move {
            match session.request(methods::APPROVALS_RESOLVE, params).await {
                Ok(_) => debug!(approval_id = %id, "Decision delivered to gateway"),
                Err(err) => warn!(approval_id = %id, error = %err, "Failed to deliver decision"),
            }
        });
        Ok(())
    }

    async fn on_escalated(&self, request: &ApprovalRequest) -> Result<()> {
        output::print_pending(request);
        Ok(())
    }
}

/// Fires a snapshot sync after every successful handshake.
struct ConnectedSignal {
    tx: mpsc::UnboundedSender<()>,
}

impl SessionObserver for ConnectedSignal {
    fn on_connected(&self, _hello: &HelloOk) {
        let _ = self.tx.send(());
    }
}

pub struct ApprovalBridge {
    session: Arc<GatewaySession>,
    coordinator: Arc<ApprovalCoordinator>,
}

impl ApprovalBridge {
    pub fn new(session: Arc<GatewaySession>, coordinator: Arc<ApprovalCoordinator>) -> Self {
        Self {
            session,
            coordinator,
        }
    }

    /// Subscribe to the session and run the bridge loop on its own task.
    /// Call before `GatewaySession::start` so the first handshake is seen.
    pub fn spawn(self) -> JoinHandle<()> {
        let (subscription, events) = self.session.events().subscribe_channel();
        let (connected_tx, connected) = mpsc::unbounded_channel();
        self.session
            .add_observer(Arc::new(ConnectedSignal { tx: connected_tx }));

        tokio::spawn(async move {
            self.run(events, connected).await;
            self.session.events().unsubscribe(subscription);
        })
    }

    async fn run(
        &self,
        mut events: mpsc::UnboundedReceiver<GatewayEvent>,
        mut connected: mpsc::UnboundedReceiver<()>,
    ) {
        loop {
            tokio::select! {
                Some(event) = events.recv() => self.handle_event(event).await,
                Some(()) = connected.recv() => {
                    self.sync_snapshot().await;
                }
                else => break,
            }
        }
        debug!("Approval bridge stopped");
    }

    pub async fn handle_event(&self, event: GatewayEvent) {
        match event {
            GatewayEvent::ApprovalRequested(requested) => self.submit(requested).await,
            GatewayEvent::ApprovalResolved(resolved) => self.apply_resolved(resolved).await,
            GatewayEvent::Shutdown(shutdown) => {
                info!(
                    reason = shutdown.reason.as_deref().unwrap_or("unspecified"),
                    restart_expected_ms = ?shutdown.restart_expected_ms,
                    "Gateway is shutting down"
                );
            }
            _ => {}
        }
    }

    /// Pull the gateway's pending approvals and submit each one. Returns how
    /// many entries were newly tracked.
    pub async fn sync_snapshot(&self) -> usize {
        let payload = match self
            .session
            .request(methods::APPROVALS_SNAPSHOT, json!({}))
            .await
        {
            Ok(payload) => payload,
            Err(err) => {
                warn!(error = %err, "Approval snapshot request failed");
                return 0;
            }
        };

        let entries = parse_snapshot(payload);
        let total = entries.len();
        let mut added = 0;
        for requested in entries {
            if self.submit_entry(requested).await {
                added += 1;
            }
        }
        info!(total, added, "Approval snapshot synced");
        added
    }

    async fn submit(&self, requested: ApprovalRequested) {
        self.submit_entry(requested).await;
    }

    async fn submit_entry(&self, requested: ApprovalRequested) -> bool {
        let id = requested.id.clone();
        match self.coordinator.submit(submission_from(requested)).await {
            Ok(SubmitOutcome::Duplicate(_)) => false,
            Ok(_) => true,
            Err(err) => {
                warn!(approval_id = %id, error = %err, "Rejected approval request");
                false
            }
        }
    }

    async fn apply_resolved(&self, resolved: ApprovalResolved) {
        let Some(decision) = parse_decision(&resolved.decision) else {
            warn!(
                approval_id = %resolved.id,
                decision = %resolved.decision,
                "Unrecognized remote decision"
            );
            return;
        };
        let resolver = remote_resolver(resolved.resolved_by.as_deref());
        match self
            .coordinator
            .apply_remote(&resolved.id, decision, &resolver)
            .await
        {
            ResolveOutcome::Resolved(_) => {}
            ResolveOutcome::AlreadyResolved(request) => {
                debug!(approval_id = %request.id, state = ?request.state, "Remote decision for resolved request")
            }
            ResolveOutcome::Unknown => {
                debug!(approval_id = %resolved.id, "Remote decision for unknown request")
            }
        }
    }
}

pub fn submission_from(requested: ApprovalRequested) -> ApprovalSubmission {
    ApprovalSubmission {
        id: Some(requested.id),
        command: requested.command,
        args: requested.args,
        scope: Scope::new(requested.scope_id, requested.node_id),
    }
}

pub fn remote_resolver(resolved_by: Option<&str>) -> String {
    let who = resolved_by
        .map(str::trim)
        .filter(|who| !who.is_empty())
        .unwrap_or(REMOTE_FALLBACK);
    format!("remote:{}", who)
}

pub fn parse_decision(decision: &str) -> Option<ApprovalDecision> {
    serde_json::from_value(Value::String(decision.trim().to_lowercase())).ok()
}

fn resolve_params(id: &str, decision: ApprovalDecision) -> Value {
    json!({ "id": id, "decision": decision })
}

/// Accepts a bare array or an object holding `approvals` / `pending`.
/// Entries that do not decode are skipped.
pub fn parse_snapshot(payload: Value) -> Vec<ApprovalRequested> {
    let items = match payload {
        Value::Array(items) => items,
        Value::Object(mut map) => match map.remove("approvals").or_else(|| map.remove("pending")) {
            Some(Value::Array(items)) => items,
            _ => Vec::new(),
        },
        _ => Vec::new(),
    };

    items
        .into_iter()
        .filter_map(|item| match serde_json::from_value::<ApprovalRequested>(item) {
            Ok(requested) => Some(requested),
            Err(err) => {
                warn!(error = %err, "Skipping malformed snapshot entry");
                None
            }
        })
        .collect()
}
