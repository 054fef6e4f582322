//! Concord sync simulation
//!
//! Runs multi-peer sync scenarios over in-memory transports and reports
//! whether the replicas converged.

use std::time::Duration;

use clap::{Parser, Subcommand};
use concord_logging::{ConcordSubscriberBuilder, LogConfig};

use concord_simulation::scenarios;

#[derive(Parser)]
#[command(
    name = "concord-sim",
    about = "Multi-peer sync scenarios for Concord connectors",
    version
)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log as JSON lines instead of human-readable text
    #[arg(long, global = true)]
    json_logs: bool,

    /// Relay grace window in milliseconds
    #[arg(long, global = true, default_value = "500")]
    grace_ms: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// A master and a slave with divergent state
    Pair,

    /// A full mesh of masters
    Mesh {
        /// Number of peers (2 to 26)
        #[arg(short, long, default_value = "4")]
        peers: usize,
    },

    /// One peer on an older protocol version
    Skew,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "info" };
    let config = if cli.json_logs {
        LogConfig::default()
    } else {
        LogConfig::development()
    };
    let _log_guard = ConcordSubscriberBuilder::new()
        .with_config(config)
        .with_level(level)
        .try_init()?;

    let grace = Duration::from_millis(cli.grace_ms);
    let report = match cli.command {
        Commands::Pair => scenarios::run_pair(grace).await?,
        Commands::Mesh { peers } => scenarios::run_mesh(peers, grace).await?,
        Commands::Skew => scenarios::run_skew(grace).await?,
    };

    println!("{}", report);
    if !report.passed() {
        let failed: Vec<&str> = report.failures().map(|check| check.name.as_str()).collect();
        anyhow::bail!("scenario {} failed: {}", report.name, failed.join(", "));
    }
    Ok(())
}
