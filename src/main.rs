//! charon - local credential broker
//!
//! CLI entry point that dispatches to subcommands.

use charon::cli::{Cli, Commands};
use charon::error::CharonResult;
use clap::Parser;
use console::style;
use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {}", style("Error:").red().bold(), e);
            if let Some(hint) = e.hint() {
                eprintln!("{} {}", style("Hint:").yellow(), hint);
            }
            ExitCode::FAILURE
        }
    }
}

async fn run() -> CharonResult<()> {
    let cli = Cli::parse();

    charon::logging::init();

    // Fix the environment before any command logic: later relative paths
    // (like the agent socket) must resolve identically in every process of
    // this workspace.
    charon::locate::setup_environment()?;

    match cli.command {
        Commands::Get => charon::cli::commands::get().await,
        Commands::SetupUri { uri } => charon::cli::commands::setup_uri(&uri),
        Commands::AgentLaunch => charon::cli::commands::agent_launch().await,
        Commands::AgentShutdown => charon::cli::commands::agent_shutdown().await,
        Commands::AgentPrune => charon::cli::commands::agent_prune().await,
        Commands::AgentRaw { method } => charon::cli::commands::agent_raw(&method).await,
        Commands::AgentLogs => charon::cli::commands::agent_logs(),
    }
}
