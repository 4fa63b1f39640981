use anyhow::{Context, Result};
use colored::Colorize;
use helix_security::{PolicyEngine, PolicyStore, Scope, Verdict};
use serde::Serialize;
use std::sync::Arc;

use crate::cli::{CheckArgs, OutputFormat};
use crate::config::AppConfig;
use crate::output::{print_json, verdict_label};

#[derive(Serialize)]
struct CheckReport<'a> {
    command: &'a str,
    scope: &'a Scope,
    verdict: &'a Verdict,
}

pub fn run(config: &AppConfig, args: CheckArgs, format: OutputFormat) -> Result<()> {
    let path = config.policy_path()?;
    let store = PolicyStore::open(path.clone())
        .with_context(|| format!("Failed to load policy document: {}", path.display()))?;
    let engine = PolicyEngine::new(Arc::new(store));

    let command = args.command.join(" ");
    let scope = Scope::new(args.agent, args.node);
    let verdict = engine.evaluate(&command, &scope);

    if format.is_json() {
        return print_json(&CheckReport {
            command: &command,
            scope: &scope,
            verdict: &verdict,
        });
    }

    println!("{} {}", verdict_label(verdict.kind), command.bold());
    match &verdict.rule {
        Some(rule) => println!(
            "  matched {} {} pattern {}",
            rule.location,
            rule.list,
            rule.pattern.cyan()
        ),
        None => println!("  {}", verdict.reason.dimmed()),
    }
    Ok(())
}
