//! Standalone lobby server binary
//!
//! Run with:
//!   cargo run --bin lobby-server -- --port 8080
//!
//! With TLS:
//!   cargo run --bin lobby-server -- --port 8443 --cert cert.pem --key key.pem

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use pairup::config::Config;
use pairup::net::{create_tls_acceptor, LobbyServer};

/// Lobby server for pairup matchmaking and signaling
#[derive(Parser, Debug)]
#[command(name = "lobby-server")]
#[command(about = "Lobby server for pairup matchmaking and signaling")]
struct Args {
    /// Port to listen on (overrides the config file)
    #[arg(short, long)]
    port: Option<u16>,

    /// Host to bind to (overrides the config file)
    #[arg(long)]
    host: Option<String>,

    /// Path to TLS certificate file (PEM format)
    #[arg(long)]
    cert: Option<PathBuf>,

    /// Path to TLS private key file (PEM format)
    #[arg(long)]
    key: Option<PathBuf>,

    /// Configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Setup logging
    let level = if args.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_str().to_lowercase()));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")?;

    let mut config = Config::load(args.config.as_deref())?;
    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if args.cert.is_some() || args.key.is_some() {
        config.server.cert = args.cert;
        config.server.key = args.key;
    }

    if config.server.port == 0 {
        bail!("Port must not be 0");
    }

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;

    // Check TLS configuration
    let tls_acceptor = match (&config.server.cert, &config.server.key) {
        (Some(cert), Some(key)) => {
            info!("TLS enabled with cert: {:?}, key: {:?}", cert, key);
            Some(create_tls_acceptor(cert, key)?)
        }
        (Some(_), None) | (None, Some(_)) => {
            error!("Both --cert and --key must be provided for TLS");
            bail!("TLS configuration incomplete");
        }
        (None, None) => {
            warn!("TLS disabled - running in plain WebSocket mode");
            warn!("For production, use --cert and --key to enable TLS");
            None
        }
    };

    info!("Lobby server starting on {}", addr);

    let server = LobbyServer::new();

    tokio::select! {
        result = server.run(addr, tls_acceptor) => result?,
        _ = tokio::signal::ctrl_c() => {
            info!(
                "Shutting down ({} waiting, {} active rooms)",
                server.queue().waiting_count(),
                server.queue().active_rooms().len()
            );
        }
    }

    Ok(())
}
