//! simwire - region server for a persistent virtual world
//!
//! Binds the viewer and peer sockets and drives the transport at a fixed
//! tick rate.

mod config;
mod region;
mod runtime;

use anyhow::Result;
use clap::Parser;
use config::{AppConfig, DEFAULT_CONFIG_PATH};
use std::{net::SocketAddr, path::PathBuf};
use tracing::info;

#[derive(Parser, Debug)]
#[command(author, version, about = "Region server for the simwire datagram protocol", long_about = None)]
struct Args {
    /// TOML config file (default: config/simwire.toml if present)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the viewer-facing bind address
    #[arg(long)]
    client_bind: Option<SocketAddr>,

    /// Override the peer-simulator bind address
    #[arg(long)]
    peer_bind: Option<SocketAddr>,

    /// Stop after this many ticks
    #[arg(long)]
    ticks: Option<u64>,

    /// Print the effective config as TOML and exit
    #[arg(long)]
    print_config: bool,

    /// Write the effective config to this path and exit
    #[arg(long)]
    write_config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // WARN by default; override with RUST_LOG
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => AppConfig::load_from_path(path)?,
        None => AppConfig::load_default(),
    };
    if let Some(addr) = args.client_bind {
        config.net.client_bind = addr;
    }
    if let Some(addr) = args.peer_bind {
        config.net.peer_bind = Some(addr);
    }

    if args.print_config {
        print!("{}", config.to_toml()?);
        return Ok(());
    }
    if let Some(path) = &args.write_config {
        config.save_to_path(path)?;
        info!("wrote config to {}", path.display());
        return Ok(());
    }

    info!(
        config = args
            .config
            .as_deref()
            .map_or(DEFAULT_CONFIG_PATH.into(), |p| p.display().to_string()),
        "starting simwire"
    );
    runtime::run(config, args.ticks).await
}
