//! mcpshimd - the mcpshim daemon.
//!
//! Loads (or initializes) the config, binds the unix socket, and serves
//! IPC requests until SIGTERM/SIGINT.

use anyhow::Context;
use clap::Parser;
use mcpshim_core::config::{self, Config};
use mcpshim_server::Server;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "mcpshimd", version, about = "Local daemon fronting MCP tool providers")]
struct Cli {
    /// Path to the mcpshim config
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the unix socket path
    #[arg(long)]
    socket: Option<PathBuf>,

    /// Debug logging
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    let config_path = cli.config.unwrap_or_else(config::default_config_path);
    let mut cfg = Config::load_or_init(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;
    if let Some(socket) = cli.socket {
        cfg.server.socket_path = socket;
    }

    let server = Arc::new(Server::new(config_path, cfg).await?);
    server.run().await?;
    Ok(())
}
