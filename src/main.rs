//! Command-line interface for tap-kafka
//!
//! # Usage Examples
//!
//! ```bash
//! # Discovery
//! tap-kafka --config config.json --discover
//!
//! # Sync, keeping state between runs in a file
//! tap-kafka --config config.json --catalog catalog.json \
//!   --state state.json --state-output state.json
//! ```
//!
//! Logs go to stderr; stdout carries only Singer messages.
//! Set `RUST_LOG` to control verbosity.

use std::path::PathBuf;

use clap::Parser;
use tap_kafka::{discover, load_config, sync, SyncArgs};
use tokio::sync::watch;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "tap-kafka")]
#[command(about = "Singer tap streaming messages from a Kafka topic")]
#[command(long_about = None)]
struct Cli {
    /// Tap config file (JSON)
    #[arg(long, short = 'c', env = "TAP_KAFKA_CONFIG")]
    config: PathBuf,

    /// Print the catalog of the configured topic and exit
    #[arg(long, short = 'd')]
    discover: bool,

    /// Catalog file with the stream selected for sync
    #[arg(long, visible_alias = "properties", short = 'p')]
    catalog: Option<PathBuf>,

    /// State file to resume from
    #[arg(long, short = 's')]
    state: Option<PathBuf>,

    /// File the latest state is written to after every checkpoint
    #[arg(long)]
    state_output: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = run().await {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
    Ok(())
}

async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli.config)?;

    if cli.discover {
        return discover::run(&config, std::io::stdout()).await;
    }

    let Some(catalog) = cli.catalog else {
        info!("No properties were selected");
        return Ok(());
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, finishing the current batch");
            let _ = shutdown_tx.send(true);
        }
    });

    let args = SyncArgs {
        catalog,
        state: cli.state,
        state_output: cli.state_output,
    };
    if let Some(summary) = sync::run(&config, args, shutdown_rx).await? {
        info!(
            "Stopped: {}. {} record(s) in {} batch(es)",
            summary.reason, summary.records_emitted, summary.batches
        );
    }
    Ok(())
}
