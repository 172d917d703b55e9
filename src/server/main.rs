//! Call Relay - Main Entry Point
//!
//! TCP listener (optionally TLS) for call signaling.

use anyhow::{Context, Result};
use clap::Parser;
use log::info;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;

use duocall::net::RelayServer;
use duocall::{tls, ServerConfig};

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(name = "call-relay")]
#[command(about = "Signaling relay for one-to-one calls")]
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

    /// Log level (overrides the config file)
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = if args.config.exists() {
        let path = args.config.to_string_lossy();
        ServerConfig::from_file(&path).with_context(|| format!("loading {}", path))?
    } else {
        ServerConfig::default()
    };

    // Initialize logging
    let level = args.log_level.clone().unwrap_or_else(|| config.log_level.clone());
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&level)).init();

    if !args.config.exists() {
        info!("Config file not found, using defaults");
    }

    let host = args.host.unwrap_or_else(|| config.signaling_host.clone());
    let port = args.port.unwrap_or(config.signaling_port);

    let acceptor = match &config.tls {
        Some(files) => Some(tls::server_acceptor(files).context("configuring TLS")?),
        None => None,
    };

    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    let listener = TcpListener::bind(addr).await?;
    info!(
        "Call relay listening on {} ({})",
        addr,
        if acceptor.is_some() { "TLS" } else { "plain TCP" }
    );

    let server = Arc::new(RelayServer::new(config));
    server.serve(listener, acceptor).await?;
    Ok(())
}
