//! Approval coordinator for commands the policy defers to a human.
//!
//! Requests move `Pending → Approved | Denied` exactly once. Manual decisions,
//! remote decisions, policy auto-resolution and timeout timers all funnel into
//! the same check-and-set, performed under one lock with no suspension point
//! between reading `Pending` and writing the terminal state, so whichever
//! arrives first wins and the others observe the terminal state.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::engine::evaluate_document;
use crate::error::ApprovalError;
use crate::models::{
    ApprovalDecision, ApprovalRequest, ApprovalState, ApprovalSubmission, HistoryEntry,
    PolicyLocation, RESOLVER_POLICY, RESOLVER_TIMEOUT, TimeoutAction, Verdict, VerdictKind,
    command_line,
};
use crate::store::PolicyStore;

/// Escalated requests wait this many timeout windows before the next deadline.
const ESCALATION_FACTOR: u64 = 2;

/// Resolved requests kept for idempotent resolves and duplicate detection.
const MAX_RESOLVED_RETAINED: usize = 1024;

/// Where a terminal decision came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionOrigin {
    /// Decided here: operator action, policy match or timeout
    Local,
    /// Decided elsewhere and reported back to us
    Remote,
}

/// A committed terminal transition.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub request: ApprovalRequest,
    pub entry: HistoryEntry,
    pub origin: ResolutionOrigin,
}

/// Result of a resolve call.
#[derive(Debug, Clone)]
pub enum ResolveOutcome {
    /// This call performed the terminal transition
    Resolved(Resolution),
    /// The request was already terminal; nothing changed
    AlreadyResolved(ApprovalRequest),
    /// No request with that id exists
    Unknown,
}

impl ResolveOutcome {
    pub fn state(&self) -> Option<ApprovalState> {
        match self {
            ResolveOutcome::Resolved(resolution) => Some(resolution.request.state),
            ResolveOutcome::AlreadyResolved(request) => Some(request.state),
            ResolveOutcome::Unknown => None,
        }
    }
}

/// Result of handing an execution attempt to the coordinator.
#[derive(Debug, Clone)]
pub enum SubmitOutcome {
    /// Parked waiting for a decision or timeout
    Pending(ApprovalRequest),
    /// The policy matched an allow/deny rule and resolved it immediately
    AutoResolved {
        resolution: Resolution,
        verdict: Verdict,
    },
    /// A request with this id already exists; returned unchanged
    Duplicate(ApprovalRequest),
}

impl SubmitOutcome {
    pub fn request(&self) -> &ApprovalRequest {
        match self {
            SubmitOutcome::Pending(request) | SubmitOutcome::Duplicate(request) => request,
            SubmitOutcome::AutoResolved { resolution, .. } => &resolution.request,
        }
    }
}

/// Callback trait for approval notifications.
///
/// Implement this trait to forward approval activity elsewhere (e.g. send the
/// decision back over the gateway connection).
#[async_trait]
pub trait ApprovalCallback: Send + Sync {
    /// Called when a request is parked waiting for a human.
    async fn request_approval(&self, request: &ApprovalRequest) -> anyhow::Result<()>;

    /// Called once per terminal transition.
    async fn on_resolved(&self, resolution: &Resolution) -> anyhow::Result<()> {
        let _ = resolution;
        Ok(())
    }

    /// Called when an `escalate` timeout re-parks a request.
    async fn on_escalated(&self, request: &ApprovalRequest) -> anyhow::Result<()> {
        let _ = request;
        Ok(())
    }
}

struct Tracked {
    request: ApprovalRequest,
    timer: Option<AbortHandle>,
    /// Bumped every time the deadline moves so stale timers can tell
    epoch: u64,
}

#[derive(Default)]
struct CoordinatorState {
    /// Pending requests only; terminal ones move to `resolved`.
    requests: HashMap<String, Tracked>,
    resolved: HashMap<String, ApprovalRequest>,
    /// Oldest first; evicted past `MAX_RESOLVED_RETAINED`.
    resolved_order: VecDeque<String>,
    history: Vec<HistoryEntry>,
}

impl CoordinatorState {
    fn lookup(&self, id: &str) -> Option<&ApprovalRequest> {
        self.requests
            .get(id)
            .map(|tracked| &tracked.request)
            .or_else(|| self.resolved.get(id))
    }

    fn retire(&mut self, request: ApprovalRequest) {
        let id = request.id.clone();
        if self.resolved.insert(id.clone(), request).is_none() {
            self.resolved_order.push_back(id);
        }
        while self.resolved_order.len() > MAX_RESOLVED_RETAINED {
            if let Some(oldest) = self.resolved_order.pop_front() {
                self.resolved.remove(&oldest);
            }
        }
    }
}

enum TimeoutTransition {
    Resolved(Resolution),
    Escalated(ApprovalRequest),
    Noop,
}

pub struct ApprovalCoordinator {
    store: Arc<PolicyStore>,
    state: Mutex<CoordinatorState>,
    callback: Option<Arc<dyn ApprovalCallback>>,
    auto_resolve: bool,
}

impl ApprovalCoordinator {
    pub fn new(store: Arc<PolicyStore>) -> Self {
        Self {
            store,
            state: Mutex::new(CoordinatorState::default()),
            callback: None,
            auto_resolve: true,
        }
    }

    /// Set the callback for approval notifications.
    pub fn with_callback(mut self, callback: Arc<dyn ApprovalCallback>) -> Self {
        self.callback = Some(callback);
        self
    }

    /// When disabled every submission is parked, even if a rule matches.
    pub fn with_auto_resolve(mut self, enabled: bool) -> Self {
        self.auto_resolve = enabled;
        self
    }

    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn store(&self) -> &Arc<PolicyStore> {
        &self.store
    }

    /// Evaluate an execution attempt and either resolve it from policy or park it.
    pub async fn submit(
        self: &Arc<Self>,
        submission: ApprovalSubmission,
    ) -> Result<SubmitOutcome, ApprovalError> {
        self.create(submission, true).await
    }

    /// Park an execution attempt for a human decision without consulting the policy.
    pub async fn park(
        self: &Arc<Self>,
        submission: ApprovalSubmission,
    ) -> Result<SubmitOutcome, ApprovalError> {
        self.create(submission, false).await
    }

    async fn create(
        self: &Arc<Self>,
        submission: ApprovalSubmission,
        consult_policy: bool,
    ) -> Result<SubmitOutcome, ApprovalError> {
        if submission.command.trim().is_empty() {
            return Err(ApprovalError::EmptyCommand);
        }

        let id = submission
            .id
            .clone()
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let line = command_line(&submission.command, &submission.args);

        let outcome = {
            let mut state = self.state.lock();
            if let Some(existing) = state.lookup(&id) {
                debug!(approval_id = %id, "Duplicate approval request ignored");
                return Ok(SubmitOutcome::Duplicate(existing.clone()));
            }

            let (verdict, timeout_seconds) = self.store.read(|document| {
                let verdict = (consult_policy && self.auto_resolve)
                    .then(|| evaluate_document(document, &line, &submission.scope));
                (verdict, document.timeout_seconds)
            });

            let now = now_ms();
            let mut request = ApprovalRequest {
                id: id.clone(),
                command: submission.command,
                args: submission.args,
                scope: submission.scope,
                requested_at: now,
                timeout_at: None,
                state: ApprovalState::Pending,
                escalated: false,
            };

            match verdict {
                Some(verdict) if verdict.kind != VerdictKind::RequiresApproval => {
                    let decision = match verdict.kind {
                        VerdictKind::Approved => ApprovalDecision::Approved,
                        _ => ApprovalDecision::Denied,
                    };
                    request.state = decision.as_state();
                    let entry = history_entry(&request, decision, RESOLVER_POLICY);
                    state.history.push(entry.clone());
                    state.retire(request.clone());
                    info!(approval_id = %id, %decision, reason = %verdict.reason, "Approval resolved by policy");
                    SubmitOutcome::AutoResolved {
                        resolution: Resolution {
                            request,
                            entry,
                            origin: ResolutionOrigin::Local,
                        },
                        verdict,
                    }
                }
                _ => {
                    let timer = if timeout_seconds > 0 {
                        request.timeout_at = Some(now + secs_to_ms(timeout_seconds));
                        Some(self.arm_timer(&id, 0, Duration::from_secs(timeout_seconds)))
                    } else {
                        None
                    };
                    state.requests.insert(
                        id.clone(),
                        Tracked {
                            request: request.clone(),
                            timer,
                            epoch: 0,
                        },
                    );
                    info!(approval_id = %id, command = %line, "Approval request pending");
                    SubmitOutcome::Pending(request)
                }
            }
        };

        if let Some(callback) = &self.callback {
            let result = match &outcome {
                SubmitOutcome::Pending(request) => callback.request_approval(request).await,
                SubmitOutcome::AutoResolved { resolution, .. } => {
                    callback.on_resolved(resolution).await
                }
                SubmitOutcome::Duplicate(_) => Ok(()),
            };
            if let Err(err) = result {
                warn!(approval_id = %id, error = %err, "Approval callback failed");
            }
        }

        Ok(outcome)
    }

    /// Apply a manual decision. Resolving a terminal request is a no-op that
    /// reports the existing state.
    pub async fn resolve(
        &self,
        id: &str,
        decision: ApprovalDecision,
        resolver: &str,
    ) -> ResolveOutcome {
        let outcome = self.transition(id, decision, resolver, ResolutionOrigin::Local);
        self.notify_resolved(&outcome).await;
        outcome
    }

    /// Apply a decision made elsewhere (e.g. another operator on the gateway).
    pub async fn apply_remote(
        &self,
        id: &str,
        decision: ApprovalDecision,
        resolver: &str,
    ) -> ResolveOutcome {
        let outcome = self.transition(id, decision, resolver, ResolutionOrigin::Remote);
        self.notify_resolved(&outcome).await;
        outcome
    }

    /// Add `<first token> *` to the global allow list and approve the request,
    /// both or neither.
    pub async fn always_allow(
        &self,
        id: &str,
        resolver: &str,
    ) -> Result<ResolveOutcome, ApprovalError> {
        let outcome = {
            let mut state = self.state.lock();
            let Some(tracked) = state.requests.get(id) else {
                return Ok(match state.resolved.get(id) {
                    Some(request) => ResolveOutcome::AlreadyResolved(request.clone()),
                    None => ResolveOutcome::Unknown,
                });
            };

            let pattern = derive_allow_pattern(&tracked.request.command_line())
                .ok_or(ApprovalError::EmptyCommand)?;
            // The write stays under the lock so a racing timeout cannot resolve the
            // request between persisting the pattern and approving. The policy file is
            // small and local, so the worker is blocked only briefly.
            self.store
                .add_always_allow(&PolicyLocation::Global, &pattern)?;

            match finish(
                &mut state,
                id,
                ApprovalDecision::Approved,
                resolver,
                ResolutionOrigin::Local,
                true,
            ) {
                Some(resolution) => {
                    info!(approval_id = %id, pattern = %pattern, "Approval resolved with always-allow");
                    ResolveOutcome::Resolved(resolution)
                }
                None => ResolveOutcome::Unknown,
            }
        };

        self.notify_resolved(&outcome).await;
        Ok(outcome)
    }

    pub fn get(&self, id: &str) -> Option<ApprovalRequest> {
        self.state.lock().lookup(id).cloned()
    }

    /// All pending requests, escalated first, then oldest first.
    pub fn pending(&self) -> Vec<ApprovalRequest> {
        let state = self.state.lock();
        let mut pending: Vec<ApprovalRequest> = state
            .requests
            .values()
            .map(|tracked| tracked.request.clone())
            .collect();
        pending.sort_by(|a, b| {
            b.escalated
                .cmp(&a.escalated)
                .then(a.requested_at.cmp(&b.requested_at))
                .then(a.id.cmp(&b.id))
        });
        pending
    }

    /// Append-only history of terminal requests.
    pub fn history(&self) -> Vec<HistoryEntry> {
        self.state.lock().history.clone()
    }

    /// Cancel every outstanding timeout timer. Pending requests stay pending.
    pub fn shutdown(&self) {
        let mut state = self.state.lock();
        for tracked in state.requests.values_mut() {
            if let Some(timer) = tracked.timer.take() {
                timer.abort();
            }
        }
    }

    fn transition(
        &self,
        id: &str,
        decision: ApprovalDecision,
        resolver: &str,
        origin: ResolutionOrigin,
    ) -> ResolveOutcome {
        let mut state = self.state.lock();
        if !state.requests.contains_key(id) {
            if let Some(request) = state.resolved.get(id) {
                return ResolveOutcome::AlreadyResolved(request.clone());
            }
            debug!(approval_id = %id, "Resolve for unknown approval id");
            return ResolveOutcome::Unknown;
        }

        match finish(&mut state, id, decision, resolver, origin, true) {
            Some(resolution) => {
                info!(approval_id = %id, %decision, resolver, "Approval resolved");
                ResolveOutcome::Resolved(resolution)
            }
            None => ResolveOutcome::Unknown,
        }
    }

    async fn notify_resolved(&self, outcome: &ResolveOutcome) {
        if let (ResolveOutcome::Resolved(resolution), Some(callback)) = (outcome, &self.callback)
            && let Err(err) = callback.on_resolved(resolution).await
        {
            warn!(approval_id = %resolution.request.id, error = %err, "Approval callback failed");
        }
    }

    fn arm_timer(self: &Arc<Self>, id: &str, epoch: u64, delay: Duration) -> AbortHandle {
        let weak: Weak<Self> = Arc::downgrade(self);
        let id = id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(coordinator) = weak.upgrade() {
                coordinator.expire(&id, epoch).await;
            }
        })
        .abort_handle()
    }

    async fn expire(self: &Arc<Self>, id: &str, epoch: u64) {
        let (action, timeout_seconds) = self
            .store
            .read(|document| (document.default_timeout_action, document.timeout_seconds));

        let transition = {
            let mut state = self.state.lock();
            let Some(tracked) = state.requests.get_mut(id) else {
                return;
            };
            if tracked.epoch != epoch {
                return;
            }

            match action {
                TimeoutAction::Deny | TimeoutAction::Approve => {
                    let decision = if action == TimeoutAction::Approve {
                        ApprovalDecision::Approved
                    } else {
                        ApprovalDecision::Denied
                    };
                    match finish(
                        &mut state,
                        id,
                        decision,
                        RESOLVER_TIMEOUT,
                        ResolutionOrigin::Local,
                        false,
                    ) {
                        Some(resolution) => {
                            info!(approval_id = %id, %decision, "Approval timed out");
                            TimeoutTransition::Resolved(resolution)
                        }
                        None => TimeoutTransition::Noop,
                    }
                }
                TimeoutAction::Escalate if tracked.request.escalated || timeout_seconds == 0 => {
                    tracked.request.timeout_at = None;
                    tracked.timer = None;
                    tracked.epoch += 1;
                    warn!(approval_id = %id, "Escalated approval still pending, waiting for an operator");
                    TimeoutTransition::Noop
                }
                TimeoutAction::Escalate => {
                    let extended = timeout_seconds.saturating_mul(ESCALATION_FACTOR);
                    tracked.epoch += 1;
                    tracked.request.escalated = true;
                    tracked.request.timeout_at = Some(now_ms() + secs_to_ms(extended));
                    tracked.timer =
                        Some(self.arm_timer(id, tracked.epoch, Duration::from_secs(extended)));
                    let request = tracked.request.clone();
                    info!(approval_id = %id, extended_secs = extended, "Approval escalated");
                    TimeoutTransition::Escalated(request)
                }
            }
        };

        if let Some(callback) = &self.callback {
            let result = match &transition {
                TimeoutTransition::Resolved(resolution) => callback.on_resolved(resolution).await,
                TimeoutTransition::Escalated(request) => callback.on_escalated(request).await,
                TimeoutTransition::Noop => Ok(()),
            };
            if let Err(err) = result {
                warn!(approval_id = %id, error = %err, "Approval callback failed");
            }
        }
    }
}

/// Terminal transition plus history append. Moves the request out of the
/// pending map. Caller holds the state lock.
fn finish(
    state: &mut CoordinatorState,
    id: &str,
    decision: ApprovalDecision,
    resolver: &str,
    origin: ResolutionOrigin,
    cancel_timer: bool,
) -> Option<Resolution> {
    let Tracked {
        mut request, timer, ..
    } = state.requests.remove(id)?;
    request.state = decision.as_state();
    if let Some(timer) = timer
        && cancel_timer
    {
        timer.abort();
    }

    let entry = history_entry(&request, decision, resolver);
    state.history.push(entry.clone());
    state.retire(request.clone());
    Some(Resolution {
        request,
        entry,
        origin,
    })
}

fn history_entry(request: &ApprovalRequest, decision: ApprovalDecision, resolver: &str) -> HistoryEntry {
    HistoryEntry {
        id: request.id.clone(),
        command: request.command_line(),
        decision,
        resolver: resolver.to_string(),
        resolved_at: now_ms(),
    }
}

/// `git push origin main` → `git *`.
pub fn derive_allow_pattern(command: &str) -> Option<String> {
    command
        .split_whitespace()
        .next()
        .map(|token| format!("{} *", token))
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn secs_to_ms(secs: u64) -> i64 {
    i64::try_from(secs.saturating_mul(1000)).unwrap_or(i64::MAX)
}
