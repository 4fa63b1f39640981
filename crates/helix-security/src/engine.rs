//! Policy evaluation.
//!
//! Commands are checked in a fixed order:
//!
//! ```text
//!   command ──► deny lists  (node → agent → global) ──► Denied
//!                   │ miss
//!                   ▼
//!               allow lists (node → agent → global) ──► Approved
//!                   │ miss
//!                   ▼
//!               effective default ── deny ──► RequiresApproval
//!                                  └ allow ─► Approved
//! ```
//!
//! Deny strictly dominates allow: a deny match in any applicable scope wins
//! over an allow match in any scope. The effective default is the document's
//! `defaultPolicy`, unless the target node sets `overrideDefault`, in which
//! case the node's own lists decide it: a node with an allow list runs in
//! allowlist mode (default deny), a node with only a deny list runs in
//! denylist mode (default allow), and a node with neither falls back to the
//! global setting. The reason string names which source was used.

use std::sync::Arc;

use crate::models::{
    DefaultPolicy, ListKind, MatchedRule, PolicyDocument, PolicyLocation, Scope, Verdict,
    VerdictKind,
};
use crate::pattern::first_match;
use crate::store::PolicyStore;

pub struct PolicyEngine {
    store: Arc<PolicyStore>,
}

impl PolicyEngine {
    pub fn new(store: Arc<PolicyStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<PolicyStore> {
        &self.store
    }

    /// Evaluate `command` against the current policy document.
    pub fn evaluate(&self, command: &str, scope: &Scope) -> Verdict {
        self.store
            .read(|document| evaluate_document(document, command, scope))
    }
}

/// Evaluate `command` against an explicit document. Never mutates it.
pub fn evaluate_document(document: &PolicyDocument, command: &str, scope: &Scope) -> Verdict {
    let command = command.trim();

    for (location, patterns) in applicable_lists(document, scope, ListKind::Deny) {
        let label = format!("{}.deny", location);
        if let Some(pattern) = first_match(patterns, command, &label) {
            return Verdict::matched(
                VerdictKind::Denied,
                MatchedRule {
                    location,
                    list: ListKind::Deny,
                    pattern: pattern.to_string(),
                },
            );
        }
    }

    for (location, patterns) in applicable_lists(document, scope, ListKind::Allow) {
        let label = format!("{}.allow", location);
        if let Some(pattern) = first_match(patterns, command, &label) {
            return Verdict::matched(
                VerdictKind::Approved,
                MatchedRule {
                    location,
                    list: ListKind::Allow,
                    pattern: pattern.to_string(),
                },
            );
        }
    }

    let (policy, source) = effective_default(document, scope);
    match policy {
        DefaultPolicy::Deny => Verdict::fallback(
            VerdictKind::RequiresApproval,
            format!("no matching rule ({}: deny)", source),
        ),
        DefaultPolicy::Allow => Verdict::fallback(
            VerdictKind::Approved,
            format!("no matching rule ({}: allow)", source),
        ),
    }
}

/// Lists of the requested kind in precedence order: node, agent, global.
fn applicable_lists<'a>(
    document: &'a PolicyDocument,
    scope: &Scope,
    list: ListKind,
) -> Vec<(PolicyLocation, &'a [String])> {
    let mut lists = Vec::with_capacity(3);

    if let Some(node_id) = scope.node_id.as_deref()
        && let Some(node) = document.per_node.get(node_id)
    {
        let patterns = match list {
            ListKind::Allow => &node.allow,
            ListKind::Deny => &node.deny,
        };
        lists.push((PolicyLocation::Node(node_id.to_string()), patterns.as_slice()));
    }

    if let Some(agent_id) = scope.agent_id.as_deref()
        && let Some(agent) = document.per_agent.get(agent_id)
    {
        let patterns = match list {
            ListKind::Allow => &agent.allow,
            ListKind::Deny => &agent.deny,
        };
        lists.push((PolicyLocation::Agent(agent_id.to_string()), patterns.as_slice()));
    }

    let global = match list {
        ListKind::Allow => &document.global_allow,
        ListKind::Deny => &document.global_deny,
    };
    lists.push((PolicyLocation::Global, global.as_slice()));
    lists
}

fn effective_default(document: &PolicyDocument, scope: &Scope) -> (DefaultPolicy, String) {
    if let Some(node_id) = scope.node_id.as_deref()
        && let Some(node) = document.per_node.get(node_id)
        && node.override_default
    {
        if !node.allow.is_empty() {
            return (
                DefaultPolicy::Deny,
                format!("node override '{}' allowlist", node_id),
            );
        }
        if !node.deny.is_empty() {
            return (
                DefaultPolicy::Allow,
                format!("node override '{}' denylist", node_id),
            );
        }
    }
    (document.default_policy, "default".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AgentPolicy, NodePolicy};

    fn engine(document: PolicyDocument) -> PolicyEngine {
        PolicyEngine::new(Arc::new(PolicyStore::new(document)))
    }

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_deny_wins_over_allow_in_same_scope() {
        let engine = engine(PolicyDocument {
            global_deny: strings(&["rm -rf *"]),
            global_allow: strings(&["rm -rf /tmp"]),
            ..PolicyDocument::default()
        });

        let verdict = engine.evaluate("rm -rf /tmp", &Scope::default());
        assert_eq!(verdict.kind, VerdictKind::Denied);
        assert_eq!(verdict.reason, "rm -rf *");
    }

    #[test]
    fn test_deny_wins_regardless_of_list_order() {
        let engine = engine(PolicyDocument {
            global_allow: strings(&["rm -rf /tmp", "rm *"]),
            global_deny: strings(&["ls", "rm -rf *"]),
            ..PolicyDocument::default()
        });
        assert!(engine.evaluate("rm -rf /tmp", &Scope::default()).is_denied());
    }

    #[test]
    fn test_global_deny_beats_node_allow() {
        let mut document = PolicyDocument {
            global_deny: strings(&["sudo *"]),
            ..PolicyDocument::default()
        };
        document.per_node.insert(
            "mac".to_string(),
            NodePolicy {
                allow: strings(&["sudo *"]),
                ..NodePolicy::default()
            },
        );
        let engine = engine(document);

        let verdict = engine.evaluate("sudo reboot", &Scope::node("mac"));
        assert!(verdict.is_denied());
        assert_eq!(verdict.rule.unwrap().location, PolicyLocation::Global);
    }

    #[test]
    fn test_node_deny_checked_before_agent_and_global() {
        let mut document = PolicyDocument {
            global_deny: strings(&["git *"]),
            ..PolicyDocument::default()
        };
        document.per_node.insert(
            "mac".to_string(),
            NodePolicy {
                deny: strings(&["git push *"]),
                ..NodePolicy::default()
            },
        );
        document.per_agent.insert(
            "main".to_string(),
            AgentPolicy {
                deny: strings(&["git *"]),
                ..AgentPolicy::default()
            },
        );
        let engine = engine(document);

        let verdict = engine.evaluate("git push origin", &Scope::agent("main").with_node("mac"));
        let rule = verdict.rule.unwrap();
        assert_eq!(rule.location, PolicyLocation::Node("mac".to_string()));
        assert_eq!(rule.pattern, "git push *");

        let verdict = engine.evaluate("git status", &Scope::agent("main").with_node("mac"));
        assert_eq!(
            verdict.rule.unwrap().location,
            PolicyLocation::Agent("main".to_string())
        );
    }

    #[test]
    fn test_allow_match_approves() {
        let engine = engine(PolicyDocument {
            global_allow: strings(&["git *"]),
            ..PolicyDocument::default()
        });
        let verdict = engine.evaluate("git status", &Scope::default());
        assert!(verdict.is_approved());
        assert_eq!(verdict.reason, "git *");
    }

    #[test]
    fn test_agent_lists_only_apply_to_that_agent() {
        let mut document = PolicyDocument::default();
        document.per_agent.insert(
            "main".to_string(),
            AgentPolicy {
                allow: strings(&["npm *"]),
                ..AgentPolicy::default()
            },
        );
        let engine = engine(document);

        assert!(engine.evaluate("npm test", &Scope::agent("main")).is_approved());
        assert!(
            engine
                .evaluate("npm test", &Scope::agent("other"))
                .requires_approval()
        );
    }

    #[test]
    fn test_default_deny_requires_approval() {
        let engine = engine(PolicyDocument::default());
        let verdict = engine.evaluate("git status", &Scope::default());
        assert_eq!(verdict.kind, VerdictKind::RequiresApproval);
        assert_eq!(verdict.reason, "no matching rule (default: deny)");
        assert!(verdict.rule.is_none());
    }

    #[test]
    fn test_default_allow_approves() {
        let engine = engine(PolicyDocument {
            default_policy: DefaultPolicy::Allow,
            ..PolicyDocument::default()
        });
        let verdict = engine.evaluate("git status", &Scope::default());
        assert!(verdict.is_approved());
        assert_eq!(verdict.reason, "no matching rule (default: allow)");
    }

    #[test]
    fn test_invalid_patterns_are_skipped() {
        let engine = engine(PolicyDocument {
            global_deny: strings(&["", "rm *"]),
            ..PolicyDocument::default()
        });
        assert!(engine.evaluate("rm file", &Scope::default()).is_denied());
    }

    #[test]
    fn test_override_default_with_allowlist_defaults_to_deny() {
        let mut document = PolicyDocument {
            default_policy: DefaultPolicy::Allow,
            ..PolicyDocument::default()
        };
        document.per_node.insert(
            "kiosk".to_string(),
            NodePolicy {
                allow: strings(&["open *"]),
                deny: Vec::new(),
                override_default: true,
            },
        );
        let engine = engine(document);

        let verdict = engine.evaluate("curl example.com", &Scope::node("kiosk"));
        assert_eq!(verdict.kind, VerdictKind::RequiresApproval);
        assert_eq!(
            verdict.reason,
            "no matching rule (node override 'kiosk' allowlist: deny)"
        );
    }

    #[test]
    fn test_override_default_with_denylist_defaults_to_allow() {
        let mut document = PolicyDocument::default();
        document.per_node.insert(
            "build".to_string(),
            NodePolicy {
                allow: Vec::new(),
                deny: strings(&["rm *"]),
                override_default: true,
            },
        );
        let engine = engine(document);

        let verdict = engine.evaluate("make all", &Scope::node("build"));
        assert!(verdict.is_approved());
        assert_eq!(
            verdict.reason,
            "no matching rule (node override 'build' denylist: allow)"
        );
    }

    #[test]
    fn test_override_default_with_empty_lists_uses_global_default() {
        let mut document = PolicyDocument::default();
        document.per_node.insert(
            "mac".to_string(),
            NodePolicy {
                override_default: true,
                ..NodePolicy::default()
            },
        );
        let engine = engine(document);

        let verdict = engine.evaluate("ls", &Scope::node("mac"));
        assert_eq!(verdict.reason, "no matching rule (default: deny)");
    }

    // Without the flag a node's lists never change the fallback: the
    // effective default is always the global one.
    #[test]
    fn test_node_lists_without_override_keep_global_default() {
        let mut document = PolicyDocument {
            default_policy: DefaultPolicy::Allow,
            ..PolicyDocument::default()
        };
        document.per_node.insert(
            "kiosk".to_string(),
            NodePolicy {
                allow: strings(&["open *"]),
                deny: Vec::new(),
                override_default: false,
            },
        );
        let engine = engine(document);

        let verdict = engine.evaluate("curl example.com", &Scope::node("kiosk"));
        assert!(verdict.is_approved());
        assert_eq!(verdict.reason, "no matching rule (default: allow)");
    }

    #[test]
    fn test_evaluation_reflects_store_mutation() {
        let store = Arc::new(PolicyStore::in_memory());
        let engine = PolicyEngine::new(store.clone());
        assert!(engine.evaluate("git status", &Scope::default()).requires_approval());

        store
            .add_always_allow(&PolicyLocation::Global, "git *")
            .unwrap();
        assert!(engine.evaluate("git status", &Scope::default()).is_approved());
    }
}
