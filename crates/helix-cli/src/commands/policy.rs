use anyhow::{Context, Result, bail};
use colored::Colorize;
use helix_security::{PolicyLocation, PolicyStore};
use serde_json::json;

use crate::cli::{OutputFormat, PolicyCommands};
use crate::config::AppConfig;
use crate::output::print_json;

pub fn run(config: &AppConfig, command: PolicyCommands, format: OutputFormat) -> Result<()> {
    let path = config.policy_path()?;
    let store = PolicyStore::open(path.clone())
        .with_context(|| format!("Failed to load policy document: {}", path.display()))?;

    match command {
        PolicyCommands::Show => print_json(&store.current_document()),
        PolicyCommands::Validate => validate(&store, format),
        PolicyCommands::Allow {
            pattern,
            agent,
            node,
        } => allow(&store, &pattern, location(agent, node), format),
    }
}

fn location(agent: Option<String>, node: Option<String>) -> PolicyLocation {
    match (agent, node) {
        (Some(agent), _) => PolicyLocation::Agent(agent),
        (None, Some(node)) => PolicyLocation::Node(node),
        (None, None) => PolicyLocation::Global,
    }
}

fn validate(store: &PolicyStore, format: OutputFormat) -> Result<()> {
    let invalid = store.invalid_patterns();

    if format.is_json() {
        print_json(&invalid)?;
    } else if invalid.is_empty() {
        println!("{}", "All patterns compile.".green());
    } else {
        for entry in &invalid {
            println!(
                "{} {} {} {}: {}",
                "INVALID".red().bold(),
                entry.location,
                entry.list,
                entry.pattern.bold(),
                entry.reason
            );
        }
    }

    if !invalid.is_empty() {
        bail!("{} invalid pattern(s)", invalid.len());
    }
    Ok(())
}

fn allow(
    store: &PolicyStore,
    pattern: &str,
    location: PolicyLocation,
    format: OutputFormat,
) -> Result<()> {
    let added = store
        .add_always_allow(&location, pattern)
        .with_context(|| format!("Failed to add '{}' to {} allow list", pattern, location))?;

    if format.is_json() {
        return print_json(&json!({
            "pattern": pattern.trim(),
            "location": location,
            "added": added,
        }));
    }

    if added {
        println!("Added {} to {} allow list", pattern.trim().cyan(), location);
    } else {
        println!(
            "{} is already in the {} allow list",
            pattern.trim().cyan(),
            location
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use helix_security::{ListKind, PolicyDocument};

    #[test]
    fn test_location_from_flags() {
        assert_eq!(location(None, None), PolicyLocation::Global);
        assert_eq!(
            location(Some("main".to_string()), None),
            PolicyLocation::Agent("main".to_string())
        );
        assert_eq!(
            location(None, Some("mac".to_string())),
            PolicyLocation::Node("mac".to_string())
        );
    }

    #[test]
    fn test_allow_is_idempotent_and_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("exec-approvals.json");
        let store = PolicyStore::open(path.clone()).unwrap();

        allow(&store, "git *", PolicyLocation::Global, OutputFormat::Text).unwrap();
        allow(&store, "GIT *", PolicyLocation::Global, OutputFormat::Text).unwrap();
        allow(
            &store,
            "ls",
            PolicyLocation::Agent("main".to_string()),
            OutputFormat::Json,
        )
        .unwrap();

        let reopened = PolicyStore::open(path).unwrap().current_document();
        assert_eq!(reopened.global_allow, vec!["git *"]);
        assert_eq!(reopened.per_agent["main"].allow, vec!["ls"]);
    }

    #[test]
    fn test_validate_reports_invalid_patterns() {
        let store = PolicyStore::new(PolicyDocument {
            global_allow: vec!["git *".to_string(), "  ".to_string()],
            ..PolicyDocument::default()
        });
        let invalid = store.invalid_patterns();
        assert_eq!(invalid.len(), 1);
        assert_eq!(invalid[0].list, ListKind::Allow);
        assert!(validate(&store, OutputFormat::Text).is_err());

        let clean = PolicyStore::new(PolicyDocument::default());
        assert!(validate(&clean, OutputFormat::Text).is_ok());
    }
}
