//! Policy document and approval models.
//!
//! The policy document is the persisted/exchanged shape edited by operators:
//!
//! ```json
//! {
//!   "globalDeny": ["rm -rf *"],
//!   "globalAllow": ["git *"],
//!   "perAgent": { "main": { "allow": [], "deny": [] } },
//!   "perNode": { "mac-mini": { "allow": [], "deny": [], "overrideDefault": false } },
//!   "timeoutSeconds": 120,
//!   "defaultTimeoutAction": "deny",
//!   "defaultPolicy": "deny"
//! }
//! ```

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Resolver identity recorded when a request times out.
pub const RESOLVER_TIMEOUT: &str = "timeout";
/// Resolver identity recorded when the policy engine decides without a human.
pub const RESOLVER_POLICY: &str = "policy";
/// Resolver identity used for manual decisions that carry no operator name.
pub const RESOLVER_OPERATOR: &str = "operator";

fn default_timeout_seconds() -> u64 {
    120
}

/// Allow/deny lists for a single agent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentPolicy {
    #[serde(default)]
    pub allow: Vec<String>,
    #[serde(default)]
    pub deny: Vec<String>,
}

/// Allow/deny lists for a single node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodePolicy {
    #[serde(default)]
    pub allow: Vec<String>,
    #[serde(default)]
    pub deny: Vec<String>,
    /// Let this node's own lists stand in for the global default policy
    #[serde(default)]
    pub override_default: bool,
}

/// Outcome for commands that match no allow/deny pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DefaultPolicy {
    /// Unmatched commands require a human decision
    #[default]
    Deny,
    /// Unmatched commands run without approval
    Allow,
}

/// What happens when a pending approval reaches its deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeoutAction {
    #[default]
    Deny,
    Approve,
    /// Re-park the request with a longer deadline and raised priority
    Escalate,
}

/// The full policy document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyDocument {
    #[serde(default)]
    pub global_deny: Vec<String>,
    #[serde(default)]
    pub global_allow: Vec<String>,
    #[serde(default)]
    pub per_agent: BTreeMap<String, AgentPolicy>,
    #[serde(default)]
    pub per_node: BTreeMap<String, NodePolicy>,
    /// Approval timeout in seconds (0 disables the timeout)
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    #[serde(default)]
    pub default_timeout_action: TimeoutAction,
    #[serde(default)]
    pub default_policy: DefaultPolicy,
}

impl Default for PolicyDocument {
    fn default() -> Self {
        Self {
            global_deny: Vec::new(),
            global_allow: Vec::new(),
            per_agent: BTreeMap::new(),
            per_node: BTreeMap::new(),
            timeout_seconds: default_timeout_seconds(),
            default_timeout_action: TimeoutAction::default(),
            default_policy: DefaultPolicy::default(),
        }
    }
}

impl PolicyDocument {
    /// Mutable access to the list addressed by `location` and `list`,
    /// creating the agent/node entry if needed.
    pub(crate) fn list_mut(&mut self, location: &PolicyLocation, list: ListKind) -> &mut Vec<String> {
        match (location, list) {
            (PolicyLocation::Global, ListKind::Allow) => &mut self.global_allow,
            (PolicyLocation::Global, ListKind::Deny) => &mut self.global_deny,
            (PolicyLocation::Agent(id), ListKind::Allow) => {
                &mut self.per_agent.entry(id.clone()).or_default().allow
            }
            (PolicyLocation::Agent(id), ListKind::Deny) => {
                &mut self.per_agent.entry(id.clone()).or_default().deny
            }
            (PolicyLocation::Node(id), ListKind::Allow) => {
                &mut self.per_node.entry(id.clone()).or_default().allow
            }
            (PolicyLocation::Node(id), ListKind::Deny) => {
                &mut self.per_node.entry(id.clone()).or_default().deny
            }
        }
    }
}

/// Partial update applied with [`crate::PolicyStore::patch`].
///
/// Top-level lists replace the current list wholesale. Map entries are merged
/// by key; a `null` entry removes that agent/node override.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub global_deny: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub global_allow: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub per_agent: Option<BTreeMap<String, Option<AgentPolicy>>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub per_node: Option<BTreeMap<String, Option<NodePolicy>>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_timeout_action: Option<TimeoutAction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_policy: Option<DefaultPolicy>,
}

/// Which collection of the document a pattern lives in.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "lowercase")]
pub enum PolicyLocation {
    Global,
    Agent(String),
    Node(String),
}

impl fmt::Display for PolicyLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PolicyLocation::Global => write!(f, "global"),
            PolicyLocation::Agent(id) => write!(f, "agent:{}", id),
            PolicyLocation::Node(id) => write!(f, "node:{}", id),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListKind {
    Allow,
    Deny,
}

impl fmt::Display for ListKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListKind::Allow => write!(f, "allow"),
            ListKind::Deny => write!(f, "deny"),
        }
    }
}

/// A pattern that failed to compile, with where it was found.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InvalidPattern {
    pub location: PolicyLocation,
    pub list: ListKind,
    pub pattern: String,
    pub reason: String,
}

/// Execution context a command targets.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Scope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
}

impl Scope {
    pub fn new(agent_id: Option<String>, node_id: Option<String>) -> Self {
        Self { agent_id, node_id }
    }

    pub fn agent(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: Some(agent_id.into()),
            node_id: None,
        }
    }

    pub fn node(node_id: impl Into<String>) -> Self {
        Self {
            agent_id: None,
            node_id: Some(node_id.into()),
        }
    }

    pub fn with_node(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }
}

/// Result of evaluating a command against the policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerdictKind {
    Approved,
    Denied,
    RequiresApproval,
}

/// The rule that produced a verdict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MatchedRule {
    pub location: PolicyLocation,
    pub list: ListKind,
    pub pattern: String,
}

/// Policy verdict with a human-readable reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Verdict {
    pub kind: VerdictKind,
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rule: Option<MatchedRule>,
}

impl Verdict {
    pub(crate) fn matched(kind: VerdictKind, rule: MatchedRule) -> Self {
        Self {
            kind,
            reason: rule.pattern.clone(),
            rule: Some(rule),
        }
    }

    pub(crate) fn fallback(kind: VerdictKind, reason: impl Into<String>) -> Self {
        Self {
            kind,
            reason: reason.into(),
            rule: None,
        }
    }

    pub fn is_approved(&self) -> bool {
        self.kind == VerdictKind::Approved
    }

    pub fn is_denied(&self) -> bool {
        self.kind == VerdictKind::Denied
    }

    pub fn requires_approval(&self) -> bool {
        self.kind == VerdictKind::RequiresApproval
    }
}

/// Lifecycle state of an approval request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalState {
    #[default]
    Pending,
    Approved,
    Denied,
}

impl ApprovalState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, ApprovalState::Pending)
    }
}

/// A terminal decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalDecision {
    #[serde(alias = "approve", alias = "allow", alias = "allow-once", alias = "allow-always")]
    Approved,
    #[serde(alias = "deny", alias = "reject", alias = "rejected")]
    Denied,
}

impl ApprovalDecision {
    pub fn as_state(self) -> ApprovalState {
        match self {
            ApprovalDecision::Approved => ApprovalState::Approved,
            ApprovalDecision::Denied => ApprovalState::Denied,
        }
    }
}

impl fmt::Display for ApprovalDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApprovalDecision::Approved => write!(f, "approved"),
            ApprovalDecision::Denied => write!(f, "denied"),
        }
    }
}

/// An execution attempt handed to the coordinator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalSubmission {
    /// Identifier assigned upstream; a local id is generated when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub command: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, flatten)]
    pub scope: Scope,
}

impl ApprovalSubmission {
    pub fn new(command: impl Into<String>, scope: Scope) -> Self {
        Self {
            id: None,
            command: command.into(),
            args: Vec::new(),
            scope,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }
}

/// Record of an approval request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalRequest {
    pub id: String,
    pub command: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, flatten)]
    pub scope: Scope,
    /// Unix timestamp (milliseconds) when the request was created
    pub requested_at: i64,
    /// Unix timestamp (milliseconds) when the request times out
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_at: Option<i64>,
    pub state: ApprovalState,
    /// Raised when an `escalate` timeout re-parked the request
    #[serde(default)]
    pub escalated: bool,
}

impl ApprovalRequest {
    /// The command text evaluated by the policy: the command followed by its arguments.
    pub fn command_line(&self) -> String {
        command_line(&self.command, &self.args)
    }
}

pub(crate) fn command_line(command: &str, args: &[String]) -> String {
    let command = command.trim();
    if args.is_empty() {
        command.to_string()
    } else {
        format!("{} {}", command, args.join(" "))
    }
}

/// Append-only record of a terminal approval request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub id: String,
    pub command: String,
    pub decision: ApprovalDecision,
    pub resolver: String,
    /// Unix timestamp (milliseconds) of the terminal transition
    pub resolved_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_document_defaults() {
        let doc = PolicyDocument::default();
        assert!(doc.global_allow.is_empty());
        assert_eq!(doc.timeout_seconds, 120);
        assert_eq!(doc.default_timeout_action, TimeoutAction::Deny);
        assert_eq!(doc.default_policy, DefaultPolicy::Deny);
    }

    #[test]
    fn test_document_wire_shape() {
        let json = r#"{
            "globalDeny": ["rm -rf *"],
            "globalAllow": ["git *"],
            "perAgent": {"main": {"allow": ["ls"], "deny": []}},
            "perNode": {"mac": {"allow": [], "deny": ["sudo *"], "overrideDefault": true}},
            "timeoutSeconds": 60,
            "defaultTimeoutAction": "escalate"
        }"#;
        let doc: PolicyDocument = serde_json::from_str(json).unwrap();
        assert_eq!(doc.global_deny, vec!["rm -rf *"]);
        assert_eq!(doc.per_agent["main"].allow, vec!["ls"]);
        assert!(doc.per_node["mac"].override_default);
        assert_eq!(doc.timeout_seconds, 60);
        assert_eq!(doc.default_timeout_action, TimeoutAction::Escalate);
        assert_eq!(doc.default_policy, DefaultPolicy::Deny);

        let value = serde_json::to_value(&doc).unwrap();
        assert_eq!(value["perNode"]["mac"]["overrideDefault"], true);
        assert_eq!(value["defaultTimeoutAction"], "escalate");
    }

    #[test]
    fn test_patch_null_entry_deserializes_to_removal() {
        let patch: PolicyPatch =
            serde_json::from_str(r#"{"perAgent": {"main": null, "ops": {"allow": ["ls"]}}}"#)
                .unwrap();
        let per_agent = patch.per_agent.unwrap();
        assert_eq!(per_agent["main"], None);
        assert_eq!(per_agent["ops"].as_ref().unwrap().allow, vec!["ls"]);
    }

    #[test]
    fn test_decision_aliases() {
        let approve: ApprovalDecision = serde_json::from_str(r#""allow-once""#).unwrap();
        let deny: ApprovalDecision = serde_json::from_str(r#""deny""#).unwrap();
        assert_eq!(approve, ApprovalDecision::Approved);
        assert_eq!(deny, ApprovalDecision::Denied);
        assert_eq!(serde_json::to_string(&approve).unwrap(), r#""approved""#);
    }

    #[test]
    fn test_command_line_joins_args() {
        assert_eq!(command_line(" git ", &[]), "git");
        assert_eq!(
            command_line("git", &["push".to_string(), "origin".to_string()]),
            "git push origin"
        );
    }

    #[test]
    fn test_request_serializes_flat_scope() {
        let request = ApprovalRequest {
            id: "a1".to_string(),
            command: "ls".to_string(),
            args: Vec::new(),
            scope: Scope::agent("main").with_node("mac"),
            requested_at: 10,
            timeout_at: None,
            state: ApprovalState::Pending,
            escalated: false,
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["agentId"], "main");
        assert_eq!(value["nodeId"], "mac");
        assert_eq!(value["requestedAt"], 10);
        assert!(value.get("timeoutAt").is_none());
    }
}
