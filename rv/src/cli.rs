//! CLI argument parsing for rv

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "rv")]
#[command(author, version, about = "Inspect and manage persisted rendezvous points", long_about = None)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// List rendezvous points
    List,

    /// Show the waiters of one rendezvous point
    Show {
        /// Rendezvous point name
        #[arg(required = true)]
        name: String,
    },

    /// Abort a rendezvous point that will never reach quorum
    Forget {
        /// Rendezvous point name
        #[arg(required = true)]
        name: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_show() {
        let cli = Cli::try_parse_from(["rv", "--config", "rv.yml", "show", "deploy"]).unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("rv.yml")));
        assert!(matches!(cli.command, Command::Show { ref name } if name == "deploy"));
    }

    #[test]
    fn test_forget_requires_name() {
        assert!(Cli::try_parse_from(["rv", "forget"]).is_err());
    }

    #[test]
    fn test_verify_cli() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
