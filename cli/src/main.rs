//! chainpoll CLI: run reorg-safe log pollers and inspect their state.
//!
//! ```bash
//! chainpoll run    --config chainpoll.toml
//! chainpoll check  --config chainpoll.toml
//! chainpoll status --db chainpoll.db --chain 1
//! chainpoll info
//! ```

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

mod cmd_run;
mod cmd_status;
mod config;
mod logging;

use config::ServiceConfig;

#[derive(Parser)]
#[command(
    name = "chainpoll",
    about = "Reorg-safe multi-chain event log poller",
    long_about = "
ChainPoll follows the heads of one or more EVM chains, indexes the logs
matched by the configured filters, and keeps the index consistent across
chain reorganizations.

ENVIRONMENT VARIABLES:
  CHAINPOLL_CONFIG   Path to the service config file
  RUST_LOG           Log filter, overrides the [log] table
",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Index every configured chain until interrupted
    Run {
        /// Path to the TOML service config
        #[arg(short, long, env = "CHAINPOLL_CONFIG", default_value = "chainpoll.toml")]
        config: PathBuf,
    },

    /// Validate a config file without connecting to anything
    Check {
        #[arg(short, long, env = "CHAINPOLL_CONFIG", default_value = "chainpoll.toml")]
        config: PathBuf,
    },

    /// Print indexing progress stored in a SQLite database
    Status {
        /// Path to the SQLite database
        #[arg(long, default_value = "chainpoll.db")]
        db: String,
        /// Only show this chain id
        #[arg(long)]
        chain: Option<u64>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show build and default configuration info
    Info,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config } => {
            let config = ServiceConfig::load(&config)?;
            logging::init_tracing(&config.log);
            cmd_run::run(config).await
        }

        Commands::Check { config } => cmd_check(&config),

        Commands::Status { db, chain, json } => cmd_status::run(&db, chain, json).await,

        Commands::Info => {
            cmd_info();
            Ok(())
        }
    }
}

// ─── Command implementations ─────────────────────────────────────────────────

fn cmd_check(path: &std::path::Path) -> Result<()> {
    let config = ServiceConfig::load(path)?;
    println!("{}: OK", path.display());
    match &config.storage.path {
        Some(db) => println!("  Storage: SQLite ({db})"),
        None => println!("  Storage: in-memory"),
    }
    for chain in &config.chains {
        println!(
            "  Chain {:<8} {}  ({} filter(s), finality {:?})",
            chain.chain_id,
            chain.rpc_url,
            chain.filters.len(),
            chain.head_tracker.finality
        );
    }
    Ok(())
}

fn cmd_info() {
    let tracker = chainpoll_core::HeadTrackerConfig::default();
    let poller = chainpoll_core::PollerConfig::default();
    println!("ChainPoll v{}", env!("CARGO_PKG_VERSION"));
    println!("  Default finality: {:?}", tracker.finality);
    println!("  Default head history depth: {} blocks", tracker.history_depth);
    println!("  Default poll interval: {}ms", poller.poll_interval_ms);
    println!("  Default backfill batch size: {} blocks/call", poller.backfill_batch_size);
    println!("  Default max reorg depth: {} blocks", poller.max_reorg_depth);
    println!("  Storage backends: memory, SQLite");
    println!("  Chains: EVM JSON-RPC over HTTP (Ethereum, Arbitrum, Base, Polygon, Optimism, ...)");
}
