//! # ferryd
//!
//! The backend daemon: binds the descriptor-handoff socket and the public
//! HTTP/WebSocket listener over one shared connection registry, then runs
//! until SIGINT. Startup misconfiguration aborts the process.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use ferry_server::config::ServerConfig;
use ferry_server::handoff::HandoffListener;
use ferry_server::registry::ConnectionRegistry;
use ferry_server::server::BackendServer;

/// Ferry backend daemon.
#[derive(Parser, Debug)]
#[command(name = "ferryd", about = "WebSocket backend for handed-off and direct connections")]
struct Cli {
    /// Host to bind the public listener.
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Port to bind (0 for auto-assign).
    #[arg(long, default_value = "8080")]
    port: u16,

    /// Path of the Unix socket receiving descriptor handoffs.
    #[arg(long, default_value = "/tmp/websocket.sock")]
    socket_path: PathBuf,

    /// Group granted write access to the handoff socket. Pass an empty
    /// string to keep the socket owner-only.
    #[arg(long, default_value = "nobody")]
    socket_group: String,

    /// Seconds between outbound hello frames per connection.
    #[arg(long, default_value = "5")]
    hello_interval_secs: u64,
}

impl Cli {
    fn into_config(self) -> ServerConfig {
        let socket_group = if self.socket_group.is_empty() {
            None
        } else {
            Some(self.socket_group)
        };
        ServerConfig {
            host: self.host,
            port: self.port,
            socket_path: self.socket_path,
            socket_group,
            hello_interval_secs: self.hello_interval_secs,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let metrics = ferry_server::metrics::install_recorder();
    let config = args.into_config();
    let registry = Arc::new(ConnectionRegistry::new());

    // Both bind steps are startup-fatal: an IPC endpoint we cannot bind or
    // restrict has no safe degraded mode.
    let handoff = HandoffListener::bind(&config).context("Failed to bind handoff socket")?;

    let server = BackendServer::new(config.clone(), registry.clone(), metrics);
    let shutdown = server.shutdown().clone();
    let handoff_handle = handoff.spawn(registry, config.hello_interval(), shutdown.token());

    let (addr, server_handle) = server.listen().await.context("Failed to bind server")?;
    tracing::info!(
        "ferry backend listening on http://{addr}, handoff socket at {}",
        config.socket_path.display()
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutting down...");
    shutdown
        .graceful_shutdown(vec![server_handle, handoff_handle], None)
        .await;
    tracing::info!("Shutdown complete");
    Ok(())
}
