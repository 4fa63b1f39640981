//! Semantic method names and their wire equivalents.

pub const CONNECT: &str = "connect";
pub const APPROVALS_SNAPSHOT: &str = "approvals.snapshot";
pub const APPROVALS_REQUEST: &str = "approvals.request";
pub const APPROVALS_RESOLVE: &str = "approvals.resolve";
pub const POLICY_GET: &str = "policy.get";
pub const POLICY_SET: &str = "policy.set";
pub const POLICY_NODE_GET: &str = "policy.node.get";
pub const POLICY_NODE_SET: &str = "policy.node.set";
pub const NODE_INVOKE_RESULT: &str = "node.invoke.result";
pub const HEALTH: &str = "health";

const METHOD_TABLE: &[(&str, &str)] = &[
    (CONNECT, "connect"),
    (APPROVALS_SNAPSHOT, "exec.approval.list"),
    (APPROVALS_REQUEST, "exec.approval.request"),
    (APPROVALS_RESOLVE, "exec.approval.resolve"),
    (POLICY_GET, "exec.approvals.get"),
    (POLICY_SET, "exec.approvals.set"),
    (POLICY_NODE_GET, "exec.approvals.node.get"),
    (POLICY_NODE_SET, "exec.approvals.node.set"),
    (NODE_INVOKE_RESULT, "node.invoke.result"),
    (HEALTH, "health"),
];

/// Wire name for `method`; unmapped names pass through unchanged.
pub fn wire_method(method: &str) -> &str {
    METHOD_TABLE
        .iter()
        .find(|(semantic, _)| *semantic == method)
        .map(|(_, wire)| *wire)
        .unwrap_or(method)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mapped_methods() {
        assert_eq!(wire_method(APPROVALS_SNAPSHOT), "exec.approval.list");
        assert_eq!(wire_method(APPROVALS_RESOLVE), "exec.approval.resolve");
        assert_eq!(wire_method(POLICY_NODE_SET), "exec.approvals.node.set");
        assert_eq!(wire_method(CONNECT), "connect");
    }

    #[test]
    fn test_unmapped_method_passes_through() {
        assert_eq!(wire_method("chat.send"), "chat.send");
        assert_eq!(wire_method(""), "");
    }

    #[test]
    fn test_wire_names_are_not_remapped() {
        assert_eq!(wire_method("exec.approval.list"), "exec.approval.list");
    }
}
