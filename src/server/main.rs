//! Chat Roulette Server - Main Entry Point
//!
//! Signaling listener that pairs waiting clients and relays between them.

use anyhow::Result;
use clap::Parser;
use log::info;
use std::path::PathBuf;

use chat_roulette::{PartnerLeftPolicy, ServerConfig, SignalingServer};

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(name = "roulette-server")]
#[command(about = "Chat Roulette Server - anonymous two-party pairing")]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config/server.toml")]
    config: PathBuf,

    /// Override host to bind to
    #[arg(long)]
    host: Option<String>,

    /// Override signaling port
    #[arg(short, long)]
    port: Option<u16>,

    /// Put a connection back in the pool when its partner leaves
    #[arg(long)]
    requeue: bool,

    /// Log level (overrides the config file)
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config_found = args.config.exists();
    let mut config = if config_found {
        ServerConfig::from_file(&args.config)?
    } else {
        ServerConfig::default()
    };

    // Initialize logging
    let log_level = args.log_level.clone().unwrap_or_else(|| config.log_level.clone());
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&log_level))
        .init();

    if !config_found {
        info!("Config file {} not found, using defaults", args.config.display());
    }

    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if args.requeue {
        config.partner_left_policy = PartnerLeftPolicy::Requeue;
    }
    info!("Partner-left policy: {:?}", config.partner_left_policy);

    let server = SignalingServer::new(&config)?;
    let listener = SignalingServer::bind(&config).await?;

    server
        .serve_until(listener, async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    Ok(())
}
