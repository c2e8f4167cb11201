//! Socket client: one request, one response, close.

use anyhow::{anyhow, Context, Result};
use mcpshim_core::config::{self, Config};
use mcpshim_core::protocol::{Request, Response};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::time::timeout;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(4);
const EXCHANGE_DEADLINE: Duration = Duration::from_secs(70);

/// Send one request to the daemon and read its response.
///
/// When connecting to the default socket fails, the configured socket path
/// (which may have been overridden in the config file) is tried as a
/// fallback.
pub async fn call(req: &Request, socket_path: &Path) -> Result<Response> {
    let stream = match connect(socket_path).await {
        Ok(stream) => stream,
        Err(err) => match fallback_socket_path(socket_path) {
            Some(fallback) if fallback != socket_path => connect(&fallback).await?,
            _ => return Err(err),
        },
    };

    timeout(EXCHANGE_DEADLINE, exchange(stream, req))
        .await
        .map_err(|_| anyhow!("timed out waiting for daemon response"))?
}

async fn connect(path: &Path) -> Result<UnixStream> {
    timeout(CONNECT_TIMEOUT, UnixStream::connect(path))
        .await
        .map_err(|_| anyhow!("timed out connecting to {}", path.display()))?
        .with_context(|| format!("failed to connect to daemon at {}", path.display()))
}

async fn exchange(stream: UnixStream, req: &Request) -> Result<Response> {
    let (read_half, mut write_half) = stream.into_split();

    let mut payload = serde_json::to_vec(req)?;
    payload.push(b'\n');
    write_half.write_all(&payload).await?;

    let mut line = String::new();
    let mut reader = BufReader::new(read_half);
    let n = reader.read_line(&mut line).await?;
    if n == 0 {
        return Err(anyhow!("daemon closed the connection without responding"));
    }
    Ok(serde_json::from_str(&line)?)
}

/// When the caller asked for the default socket, fall back to whatever the
/// config file names.
fn fallback_socket_path(requested: &Path) -> Option<PathBuf> {
    if requested != config::default_socket_path() {
        return None;
    }
    let cfg = Config::load(&config::default_config_path()).ok()?;
    Some(cfg.server.socket_path)
}
