//! Groundlink daemon
//!
//! Keeps a connection to a flight control server alive from the command
//! line: dials the configured target, runs the handshake, logs state
//! changes and notices, and shuts the session down cleanly on Ctrl+C.
//!
//! ## Usage
//!
//! ```bash
//! # Connect with defaults (ws://localhost:5000)
//! groundlink
//!
//! # Connect to a specific host
//! groundlink --host 10.0.0.7 --port 5000
//!
//! # Raw TCP instead of WebSocket
//! groundlink --protocol tcp
//!
//! # Launch a local server first and connect to it
//! groundlink --launch-local --local-binary /opt/flight-server/bin/serverd
//! ```

use anyhow::Context;
use clap::Parser;
use groundlink::channel::DEFAULT_REQUEST_TIMEOUT;
use groundlink::{
    config, DefaultTransportFactory, LogNotifier, Protocol, ServerChannel, ServerConnection,
    ServerSettings, WorldModel,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "groundlink")]
#[command(about = "Connection manager for a flight control server")]
struct Args {
    /// Path to config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Server host
    #[arg(long, env = "GROUNDLINK_HOST")]
    host: Option<String>,

    /// Server port
    #[arg(long, env = "GROUNDLINK_PORT")]
    port: Option<u16>,

    /// Transport protocol (ws or tcp)
    #[arg(long)]
    protocol: Option<Protocol>,

    /// Launch a local server before connecting
    #[arg(long)]
    launch_local: bool,

    /// Path to the local server binary
    #[arg(long)]
    local_binary: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("groundlink=info".parse()?))
        .init();

    let args = Args::parse();

    // Load config, writing the defaults on first run
    let config_path = args.config.unwrap_or_else(config::default_config_path);
    let mut settings = if config_path.exists() {
        ServerSettings::load(&config_path)
            .with_context(|| format!("Failed to load {}", config_path.display()))?
    } else {
        let defaults = ServerSettings::default();
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        defaults.save(&config_path)?;
        info!(path = %config_path.display(), "Created default config");
        defaults
    };

    // Apply CLI overrides
    if let Some(host) = args.host {
        settings.host = host;
    }
    if let Some(port) = args.port {
        settings.port = port;
    }
    if let Some(protocol) = args.protocol {
        settings.protocol = protocol;
    }
    if args.launch_local {
        settings.local.enabled = true;
    }
    if let Some(binary) = args.local_binary {
        settings.local.binary_path = Some(binary);
    }

    let model = Arc::new(WorldModel::new());
    let connection = ServerConnection::new(
        Arc::new(ServerChannel::new(DEFAULT_REQUEST_TIMEOUT)),
        Arc::clone(&model),
        Arc::new(LogNotifier),
        Arc::new(DefaultTransportFactory),
    );

    // Mirror state changes into the log
    let mut state = connection.state();
    tokio::spawn(async move {
        while state.changed().await.is_ok() {
            let current = *state.borrow_and_update();
            info!(state = %current, "Connection state changed");
        }
    });

    info!(
        host = %settings.host,
        port = settings.port,
        protocol = %settings.protocol,
        "Starting groundlink"
    );
    connection
        .open(&settings)
        .await
        .context("Failed to open the connection")?;

    info!("Press Ctrl+C to stop.");
    tokio::signal::ctrl_c().await.ok();
    info!("Shutting down...");
    connection.close().await;

    Ok(())
}
