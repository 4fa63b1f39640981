use anyhow::Result;
use colored::{ColoredString, Colorize};
use helix_gateway::ConnectionState;
use helix_security::{ApprovalDecision, ApprovalRequest, HistoryEntry, VerdictKind};
use serde::Serialize;

pub fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let output = serde_json::to_string_pretty(value)?;
    println!("{}", output);
    Ok(())
}

pub fn verdict_label(kind: VerdictKind) -> ColoredString {
    match kind {
        VerdictKind::Approved => "approved".green().bold(),
        VerdictKind::Denied => "denied".red().bold(),
        VerdictKind::RequiresApproval => "requires approval".yellow().bold(),
    }
}

pub fn decision_label(decision: ApprovalDecision) -> ColoredString {
    match decision {
        ApprovalDecision::Approved => "APPROVED".green().bold(),
        ApprovalDecision::Denied => "DENIED".red().bold(),
    }
}

pub fn scope_label(request: &ApprovalRequest) -> String {
    match (&request.scope.agent_id, &request.scope.node_id) {
        (Some(agent), Some(node)) => format!("agent {} on node {}", agent, node),
        (Some(agent), None) => format!("agent {}", agent),
        (None, Some(node)) => format!("node {}", node),
        (None, None) => "global".to_string(),
    }
}

pub fn print_pending(request: &ApprovalRequest) {
    let marker = if request.escalated {
        "ESCALATED".magenta().bold()
    } else {
        "PENDING".yellow().bold()
    };
    println!(
        "{} {} {} ({})",
        marker,
        request.id.dimmed(),
        request.command_line().bold(),
        scope_label(request)
    );
}

pub fn print_resolution(entry: &HistoryEntry) {
    println!(
        "{} {} {} by {}",
        decision_label(entry.decision),
        entry.id.dimmed(),
        entry.command,
        entry.resolver.cyan()
    );
}

pub fn state_label(state: ConnectionState) -> ColoredString {
    match state {
        ConnectionState::Connected => "connected".green(),
        ConnectionState::Disconnected => "disconnected".red(),
        ConnectionState::Backoff => "waiting to reconnect".yellow(),
        ConnectionState::Connecting => "connecting".normal(),
        ConnectionState::AwaitingChallenge => "awaiting challenge".normal(),
        ConnectionState::Handshaking => "handshaking".normal(),
        ConnectionState::Closing => "closing".normal(),
    }
}
