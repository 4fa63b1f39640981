use std::io::BufRead;
use std::sync::Arc;

use anyhow::{Context, Result};
use colored::Colorize;
use helix_gateway::{ConnectionState, GatewaySession};
use helix_security::{
    ApprovalCoordinator, ApprovalDecision, PolicyStore, RESOLVER_OPERATOR, ResolveOutcome,
};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::bridge::{ApprovalBridge, GatewayResolver};
use crate::cli::RunArgs;
use crate::config::AppConfig;
use crate::output::{print_pending, state_label};

/// A line typed by the operator while `run` is active.
#[derive(Debug, PartialEq, Eq)]
pub enum ConsoleCommand {
    List,
    Approve(String),
    Deny(String),
    Always(String),
    Status,
    Help,
    Empty,
    Unknown(String),
}

pub fn parse_console_line(line: &str) -> ConsoleCommand {
    let mut words = line.split_whitespace();
    let Some(verb) = words.next() else {
        return ConsoleCommand::Empty;
    };
    let id = words.next().map(str::to_string);

    match (verb.to_ascii_lowercase().as_str(), id) {
        ("list" | "ls", _) => ConsoleCommand::List,
        ("approve" | "a", Some(id)) => ConsoleCommand::Approve(id),
        ("deny" | "d", Some(id)) => ConsoleCommand::Deny(id),
        ("always" | "aa", Some(id)) => ConsoleCommand::Always(id),
        ("status", _) => ConsoleCommand::Status,
        ("help" | "?", _) => ConsoleCommand::Help,
        _ => ConsoleCommand::Unknown(line.trim().to_string()),
    }
}

pub async fn run(config: &AppConfig, args: RunArgs) -> Result<()> {
    let policy_path = config.policy_path()?;
    let store = PolicyStore::open(policy_path.clone()).with_context(|| {
        format!("Failed to load policy document: {}", policy_path.display())
    })?;
    for invalid in store.invalid_patterns() {
        warn!(
            location = %invalid.location,
            list = %invalid.list,
            pattern = %invalid.pattern,
            reason = %invalid.reason,
            "Policy pattern does not compile and will be skipped"
        );
    }

    let no_console = args.no_console;
    let mut session_config = config.session_config();
    if let Some(url) = args.url {
        session_config.url = url;
    }
    if let Some(token) = args.token {
        session_config.handshake.token = Some(token);
    }
    let url = session_config.url.clone();

    let session = Arc::new(GatewaySession::new(session_config));
    let coordinator = ApprovalCoordinator::new(Arc::new(store))
        .with_callback(Arc::new(GatewayResolver::new(session.clone())))
        .with_auto_resolve(config.policy.auto_resolve)
        .shared();

    let bridge = ApprovalBridge::new(session.clone(), coordinator.clone()).spawn();
    let reporter = spawn_status_reporter(session.status());
    session.start();
    info!(%url, policy = %policy_path.display(), "Approval bridge running");

    let console = async {
        if !no_console {
            operator_console(&coordinator, &session).await;
        }
        // Keep running after stdin closes.
        std::future::pending::<()>().await
    };

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for Ctrl-C")?;
        }
        _ = console => {}
    }

    info!("Shutting down approval bridge");
    session.stop().await;
    coordinator.shutdown();
    bridge.abort();
    reporter.abort();
    Ok(())
}

fn spawn_status_reporter(mut status: watch::Receiver<ConnectionState>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while status.changed().await.is_ok() {
            let state = *status.borrow_and_update();
            if matches!(
                state,
                ConnectionState::Connected | ConnectionState::Backoff | ConnectionState::Disconnected
            ) {
                println!("{} {}", "gateway:".dimmed(), state_label(state));
            }
        }
    })
}

/// Blocking stdin reads live on a plain thread so shutdown never waits on them.
fn spawn_stdin_reader() -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            if tx.send(line).is_err() {
                break;
            }
        }
    });
    rx
}

async fn operator_console(coordinator: &Arc<ApprovalCoordinator>, session: &GatewaySession) {
    let mut lines = spawn_stdin_reader();
    while let Some(line) = lines.recv().await {
        match parse_console_line(&line) {
            ConsoleCommand::Empty => {}
            ConsoleCommand::List => {
                let pending = coordinator.pending();
                if pending.is_empty() {
                    println!("No pending approvals.");
                }
                for request in &pending {
                    print_pending(request);
                }
            }
            ConsoleCommand::Approve(id) => {
                let outcome = coordinator
                    .resolve(&id, ApprovalDecision::Approved, RESOLVER_OPERATOR)
                    .await;
                report_outcome(&id, &outcome);
            }
            ConsoleCommand::Deny(id) => {
                let outcome = coordinator
                    .resolve(&id, ApprovalDecision::Denied, RESOLVER_OPERATOR)
                    .await;
                report_outcome(&id, &outcome);
            }
            ConsoleCommand::Always(id) => match coordinator.always_allow(&id, RESOLVER_OPERATOR).await {
                Ok(outcome) => report_outcome(&id, &outcome),
                Err(err) => println!("{} {}", "error:".red().bold(), err),
            },
            ConsoleCommand::Status => {
                let stats = session.sequence_stats();
                println!(
                    "gateway {} | pending calls {} | approvals pending {} | last seq {} | gaps {} ({} missed)",
                    state_label(session.state()),
                    session.pending_requests(),
                    coordinator.pending().len(),
                    stats
                        .last_seq
                        .map(|seq| seq.to_string())
                        .unwrap_or_else(|| "-".to_string()),
                    stats.gaps,
                    stats.missed
                );
            }
            ConsoleCommand::Help => print_help(),
            ConsoleCommand::Unknown(input) => {
                println!("Unknown command: {} (type 'help')", input);
            }
        }
    }
}

fn report_outcome(id: &str, outcome: &ResolveOutcome) {
    match outcome {
        // The coordinator callback already printed the resolution.
        ResolveOutcome::Resolved(_) => {}
        ResolveOutcome::AlreadyResolved(request) => {
            println!("{} is already {:?}", id, request.state);
        }
        ResolveOutcome::Unknown => println!("No approval with id {}", id),
    }
}

fn print_help() {
    println!("Commands:");
    println!("  list              show pending approvals");
    println!("  approve <id>      approve once");
    println!("  deny <id>         deny");
    println!("  always <id>       approve and allow '<program> *' from now on");
    println!("  status            connection and sequence counters");
}
