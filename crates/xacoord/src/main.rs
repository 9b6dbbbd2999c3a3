//! xacoord - XA transaction coordinator tooling
//!
//! Operator commands over a coordinator's recovery log:
//! - Inspect registrations, pending and heuristic transactions
//! - Prune completion markers past the confirmation window

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic)]

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;

mod cli;
mod config;

#[derive(Parser)]
#[command(name = "xacoord")]
#[command(author, version, about = "xacoord - XA transaction coordinator tooling", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/xacoord/xacoord.toml", env = "XACOORD_CONFIG")]
    config: String,

    /// Recovery log directory (overrides the configuration file)
    #[arg(short, long, env = "XACOORD_LOG_DIR")]
    log_dir: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show registrations and unresolved transactions in the recovery log
    Inspect {
        /// Print JSON instead of text
        #[arg(long)]
        json: bool,

        /// Also print log metrics in Prometheus text format
        #[arg(long)]
        metrics: bool,
    },

    /// Drop completion markers older than the confirmation window
    Prune,

    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let command = match cli.command {
        Commands::Version => {
            println!("xacoord version {}", env!("CARGO_PKG_VERSION"));
            return Ok(());
        }
        command => command,
    };

    let config = config::load(&cli.config, cli.log_dir).await?;
    config::init_tracing(&config.logging)?;

    match command {
        Commands::Inspect { json, metrics } => {
            if metrics {
                xacoord_common::metrics::install_prometheus_recorder()
                    .map_err(|e| anyhow::anyhow!(e))?;
            }

            let inspection = cli::inspect(&config).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&inspection)?);
            } else {
                print!("{}", cli::render(&inspection));
            }

            if metrics {
                print!("{}", xacoord_common::metrics::export_prometheus());
            }
        }

        Commands::Prune => {
            info!("Pruning recovery log at {}", config.log.dir);
            println!("{}", cli::prune(&config).await?);
        }

        Commands::Version => {}
    }

    Ok(())
}
