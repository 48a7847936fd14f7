//! rv - operator CLI over the persisted rendezvous table

use clap::Parser;
use colored::*;
use eyre::{Context, Result, eyre};
use tracing::{debug, info};

use rendezvous::cli::{Cli, Command};
use rendezvous::{BarrierRegistry, BarrierStatus, Config};

fn setup_logging(cli_log_level: Option<&str>, config_log_level: Option<&str>) -> Result<()> {
    // Priority: --log-level > config file > INFO
    let level = match cli_log_level.or(config_log_level).map(|s| s.to_uppercase()) {
        Some(s) => match s.as_str() {
            "TRACE" => tracing::Level::TRACE,
            "DEBUG" => tracing::Level::DEBUG,
            "INFO" => tracing::Level::INFO,
            "WARN" | "WARNING" => tracing::Level::WARN,
            "ERROR" => tracing::Level::ERROR,
            _ => {
                eprintln!("Warning: Unknown log-level '{}', defaulting to INFO", s);
                tracing::Level::INFO
            }
        },
        None => tracing::Level::INFO,
    };

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .try_init()
        .map_err(|e| eyre!("{}", e))?;

    debug!("Logging initialized (level: {:?})", level);
    Ok(())
}

fn print_summary(status: &BarrierStatus) {
    // Released slots still count toward quorum until pruned
    let progress = format!("{}/{}", status.held.len() + status.resolved.len(), status.quorum);
    let mut line = format!("{} {}, {} held", status.name.cyan(), progress.yellow(), status.held.len());
    if !status.resolved.is_empty() {
        line.push_str(&format!(", {} resolved", status.resolved.len().to_string().green()));
    }
    if status.detached > 0 {
        line.push_str(&format!(", {} detached", status.detached.to_string().dimmed()));
    }
    println!("{}", line);
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;
    setup_logging(cli.log_level.as_deref(), config.log_level.as_deref()).context("Failed to setup logging")?;

    info!(state_dir = %config.state_dir.display(), "rv starting");
    let registry = BarrierRegistry::open(&config.state_dir);

    match cli.command {
        Command::List => {
            println!("{}", format!("State file: {}", config.state_file().display()).dimmed());
            let statuses = registry.statuses();
            if statuses.is_empty() {
                println!("No rendezvous points");
            } else {
                for status in &statuses {
                    print_summary(status);
                }
            }
        }
        Command::Show { name } => {
            let status = registry
                .status(&name)
                .ok_or_else(|| eyre!("Rendezvous point not found: {}", name))?;
            print_summary(&status);
            println!("  Quorum: {}", status.quorum);
            for waiter_id in &status.held {
                println!("  {} {}", waiter_id, "held".yellow());
            }
            for waiter_id in &status.resolved {
                println!("  {} {}", waiter_id, "resolved".green());
            }
        }
        Command::Forget { name } => {
            if registry.forget(&name) {
                println!("{} Forgot rendezvous point: {}", "✓".green(), name.cyan());
            } else {
                return Err(eyre!("Rendezvous point not found: {}", name));
            }
        }
    }

    Ok(())
}
