//! CLI argument definitions using clap derive

use clap::{Parser, Subcommand};

/// charon - local credential broker
///
/// Answers credential-helper requests for build tools: reads `{"uri": ...}`
/// on stdin and prints the HTTP headers a downloader should attach. A
/// per-workspace background agent caches responses across invocations.
#[derive(Parser, Debug)]
#[command(name = "charon")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Get credentials for the uri provided on stdin and print the response
    /// to stdout (credential-helper protocol)
    Get,

    /// Print setup instructions for a given uri
    SetupUri {
        /// URI to explain setup for
        uri: String,
    },

    /// Run as the caching agent (started automatically by `get`)
    AgentLaunch,

    /// Ask the workspace agent to shut down; succeeds if none is running
    AgentShutdown,

    /// Ask the workspace agent to drop expired cache entries
    AgentPrune,

    /// Forward stdin as the payload of a raw agent request
    AgentRaw {
        /// Method to invoke (retrieve, store, prune, shutdown)
        method: String,
    },

    /// Print the agent's log files (written when CHARON_LOGGING=debug)
    AgentLogs,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_get() {
        let cli = Cli::parse_from(["charon", "get"]);
        assert!(matches!(cli.command, Commands::Get));
    }

    #[test]
    fn cli_parses_agent_commands() {
        assert!(matches!(
            Cli::parse_from(["charon", "agent-launch"]).command,
            Commands::AgentLaunch
        ));
        assert!(matches!(
            Cli::parse_from(["charon", "agent-shutdown"]).command,
            Commands::AgentShutdown
        ));
        assert!(matches!(
            Cli::parse_from(["charon", "agent-prune"]).command,
            Commands::AgentPrune
        ));
        assert!(matches!(
            Cli::parse_from(["charon", "agent-logs"]).command,
            Commands::AgentLogs
        ));
    }

    #[test]
    fn cli_parses_agent_raw_method() {
        match Cli::parse_from(["charon", "agent-raw", "retrieve"]).command {
            Commands::AgentRaw { method } => assert_eq!(method, "retrieve"),
            _ => panic!("expected AgentRaw command"),
        }
    }

    #[test]
    fn cli_parses_setup_uri() {
        match Cli::parse_from(["charon", "setup-uri", "https://github.com/x"]).command {
            Commands::SetupUri { uri } => assert_eq!(uri, "https://github.com/x"),
            _ => panic!("expected SetupUri command"),
        }
    }

    #[test]
    fn cli_requires_a_command() {
        assert!(Cli::try_parse_from(["charon"]).is_err());
    }
}
