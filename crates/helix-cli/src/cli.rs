use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Output format for CLI commands
#[derive(ValueEnum, Clone, Copy, Debug, Default)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

impl OutputFormat {
    pub fn is_json(self) -> bool {
        matches!(self, OutputFormat::Json)
    }
}

#[derive(Parser)]
#[command(name = "helix-approvals")]
#[command(version, about = "Helix exec approvals - command policy and gateway approval bridge")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Config file (defaults to ~/.helix/approvals.toml)
    #[arg(long, global = true, env = "HELIX_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output format
    #[arg(long, global = true, default_value = "text")]
    pub format: OutputFormat,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Connect to the gateway and handle approval requests until Ctrl-C
    Run(RunArgs),

    /// Evaluate a command against the local policy
    Check(CheckArgs),

    /// Inspect or edit the policy document
    Policy {
        #[command(subcommand)]
        command: PolicyCommands,
    },
}

#[derive(Args)]
pub struct RunArgs {
    /// Gateway URL (overrides the config file)
    #[arg(long)]
    pub url: Option<String>,

    /// Gateway token (overrides config and HELIX_GATEWAY_TOKEN)
    #[arg(long)]
    pub token: Option<String>,

    /// Do not read operator decisions from stdin
    #[arg(long)]
    pub no_console: bool,
}

#[derive(Args)]
pub struct CheckArgs {
    /// Command line to evaluate
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    pub command: Vec<String>,

    /// Agent the command runs for
    #[arg(long)]
    pub agent: Option<String>,

    /// Node the command runs on
    #[arg(long)]
    pub node: Option<String>,
}

#[derive(Subcommand)]
pub enum PolicyCommands {
    /// Print the policy document
    Show,

    /// List patterns that fail to compile
    Validate,

    /// Add a pattern to an allow list
    Allow {
        /// Pattern to allow (e.g. "git *")
        pattern: String,

        /// Add to this agent's allow list instead of the global one
        #[arg(long, conflicts_with = "node")]
        agent: Option<String>,

        /// Add to this node's allow list instead of the global one
        #[arg(long)]
        node: Option<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_check_collects_trailing_words() {
        let cli = Cli::parse_from([
            "helix-approvals",
            "check",
            "--agent",
            "main",
            "git",
            "push",
            "--force",
        ]);
        let Commands::Check(args) = cli.command else {
            panic!("expected check");
        };
        assert_eq!(args.command, vec!["git", "push", "--force"]);
        assert_eq!(args.agent.as_deref(), Some("main"));
        assert_eq!(args.node, None);
    }

    #[test]
    fn test_policy_allow_scope_flags_conflict() {
        let result = Cli::try_parse_from([
            "helix-approvals",
            "policy",
            "allow",
            "ls",
            "--agent",
            "a",
            "--node",
            "n",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::parse_from(["helix-approvals", "policy", "show", "--format", "json", "-v"]);
        assert!(cli.verbose);
        assert!(cli.format.is_json());
        assert!(matches!(
            cli.command,
            Commands::Policy {
                command: PolicyCommands::Show
            }
        ));
    }
}
