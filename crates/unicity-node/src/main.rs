//! Unicity Node - headers-only P2P node.
//!
//! This is the main entry point for the unicity-node binary.

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

mod chain;
mod config;
mod node;
mod sync;

use config::NodeConfig;
use node::Node;

/// Unicity headers-only P2P node.
#[derive(Parser, Debug, Default)]
#[command(name = "unicity-node")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "unicity-node.toml")]
    config: PathBuf,

    /// Data directory
    #[arg(short, long)]
    data_dir: Option<PathBuf>,

    /// Network to connect to (mainnet, testnet, regtest)
    #[arg(short, long, default_value = "mainnet")]
    network: String,

    /// P2P listen port (defaults to the network's port)
    #[arg(long)]
    port: Option<u16>,

    /// Do not accept inbound connections
    #[arg(long)]
    no_listen: bool,

    /// Connect to this peer (repeatable)
    #[arg(long)]
    connect: Vec<String>,

    /// Log level
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = NodeConfig::load(&args.config, &args)?;

    let log_level = match config.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    info!("Starting Unicity node v{}", env!("CARGO_PKG_VERSION"));
    info!("Network: {}", config.network);
    info!("Data directory: {:?}", config.data_dir);

    let node = Node::new(config).await?;
    info!("P2P port: {}", node.service().config().listen_port);

    let node_handle = node.clone();
    let shutdown_signal = async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Shutdown signal received");
        node_handle.shutdown();
    };

    tokio::select! {
        result = node.run() => {
            if let Err(e) = result {
                tracing::error!("Node error: {}", e);
            }
        }
        _ = shutdown_signal => {
            info!("Shutdown complete");
        }
    }

    info!("Unicity node stopped");
    Ok(())
}
