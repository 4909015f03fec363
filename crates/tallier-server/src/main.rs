mod bundle;
mod command;
mod graphite;
mod heartbeat;
mod listener;
mod master;
mod worker;

use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use tracing::{error, info};

use crate::master::Master;

#[derive(Parser, Debug)]
#[command(name = "tallier-server", about = "UDP stats aggregation daemon")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config/tallier.toml")]
    config: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub tallier: TallierSection,
    pub graphite: GraphiteSection,
    #[serde(default)]
    pub harold: Option<HaroldSection>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TallierSection {
    /// UDP port to receive stat datagrams on
    pub port: u16,
    /// Bind address; empty means all interfaces
    #[serde(default)]
    pub interface: String,
    /// Size of the datagram receiving pool
    pub num_workers: usize,
    /// Seconds between flushes to graphite
    #[serde(default = "default_flush_interval")]
    pub flush_interval: f64,
    /// Optional TCP port for the inspection command service
    #[serde(default)]
    pub command_port: Option<u16>,
    #[serde(default = "default_true")]
    pub enable_heartbeat: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GraphiteSection {
    /// host:port of the graphite line receiver
    pub graphite_addr: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HaroldSection {
    pub base_url: String,
    #[serde(default)]
    pub secret: String,
}

fn default_flush_interval() -> f64 {
    tallier_protocol::DEFAULT_FLUSH_INTERVAL
}
fn default_true() -> bool {
    true
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    // Load configuration
    let config_str = tokio::fs::read_to_string(&args.config).await.map_err(|e| {
        error!("Failed to read config file {:?}: {}", args.config, e);
        e
    })?;

    let config: Config = toml::from_str(&config_str).map_err(|e| {
        error!("Failed to parse config: {}", e);
        e
    })?;

    info!(
        port = config.tallier.port,
        workers = config.tallier.num_workers,
        graphite = %config.graphite.graphite_addr,
        "tallier starting"
    );

    let mut master = Master::new(config)?;
    master.run().await?;

    info!("done");
    Ok(())
}
