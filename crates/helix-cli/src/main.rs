mod bridge;
mod cli;
mod commands;
mod config;
mod output;
mod paths;

use anyhow::Result;
use clap::Parser;
use cli::{Cli, Commands};
use config::AppConfig;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "info,helix_gateway=debug,helix_security=debug"
    } else {
        "info"
    };
    // Logs go to stderr so stdout stays clean for --format json.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into()),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_line_number(true)
        .init();

    let config = AppConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Run(args) => commands::run::run(&config, args).await,
        Commands::Check(args) => commands::check::run(&config, args, cli.format),
        Commands::Policy { command } => commands::policy::run(&config, command, cli.format),
    }
}
