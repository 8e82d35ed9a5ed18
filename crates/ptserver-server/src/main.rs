use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{error, info};

mod config;
mod context;
mod db;
mod flows;
mod handler;
mod model;
mod registry;

use config::ServerConfig;
use db::Db;
use registry::Registry;

#[derive(Parser)]
#[command(name = "ptserverd", about = "Paltalk-protocol chat server")]
struct Args {
    /// Path to configuration file (TOML)
    #[arg(short, long)]
    config: Option<String>,

    /// TCP port, overrides config
    #[arg(long)]
    port: Option<u16>,

    /// Bind address (IP), overrides config
    #[arg(long)]
    host: Option<String>,

    /// Path to the SQLite database file, overrides config
    #[arg(long)]
    db_path: Option<String>,

    /// Maximum concurrent connections, overrides config
    #[arg(long)]
    max_connections: Option<u32>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = if let Some(config_path) = &args.config {
        let content = fs::read_to_string(config_path)
            .with_context(|| format!("failed to read config file: {}", config_path))?;
        toml::from_str(&content)?
    } else {
        ServerConfig::default()
    };

    if let Some(port) = args.port {
        config.tcp_port = port;
    }
    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(db_path) = args.db_path {
        config.db_path = db_path;
    }
    if let Some(max_connections) = args.max_connections {
        config.max_connections = max_connections;
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.as_str().into()),
        )
        .init();

    info!(
        host = %config.host,
        tcp_port = config.tcp_port,
        db_path = %config.db_path,
        max_connections = config.max_connections,
        "ptserverd starting"
    );

    let db_path: Arc<std::path::Path> = Arc::from(PathBuf::from(&config.db_path).into_boxed_path());
    let db = Arc::new(Db::open(&db_path).with_context(|| format!("failed to open database at {}", config.db_path))?);
    let registry = Arc::new(Registry::new());
    let active_connections = Arc::new(AtomicU32::new(0));

    let tcp_listener = TcpListener::bind(format!("{}:{}", config.host, config.tcp_port))
        .await
        .with_context(|| format!("failed to bind TCP on {}:{}", config.host, config.tcp_port))?;

    info!("listening on {}:{}", config.host, config.tcp_port);

    loop {
        let (stream, peer_addr) = match tcp_listener.accept().await {
            Ok(result) => result,
            Err(e) => {
                error!("TCP accept error: {}", e);
                continue;
            }
        };

        if active_connections.load(Ordering::Relaxed) >= config.max_connections {
            warn_connection_rejected(peer_addr, config.max_connections);
            continue;
        }
        active_connections.fetch_add(1, Ordering::Relaxed);

        let db = db.clone();
        let db_path = db_path.clone();
        let registry = registry.clone();
        let active_connections = active_connections.clone();

        tokio::spawn(async move {
            handler::handle_connection(stream, peer_addr, db, db_path, registry, active_connections).await;
        });
    }
}

fn warn_connection_rejected(peer: std::net::SocketAddr, max: u32) {
    tracing::warn!(%peer, max_connections = max, "rejecting connection, server at capacity");
}
