//! Stdio transport: a local MCP server run as a subprocess.
//!
//! JSON-RPC messages are newline-delimited on the child's stdin/stdout.
//! Anything on stdout that does not parse as JSON-RPC (npx banners, log
//! noise) is skipped.

use crate::error::{McpError, McpResult};
use crate::protocol::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};
use crate::transport::Transport;
use async_trait::async_trait;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tracing::{debug, warn};

struct StdioSession {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

/// Subprocess transport.
pub struct StdioTransport {
    session: Mutex<Option<StdioSession>>,
}

impl StdioTransport {
    /// Spawn the configured command with its extra environment.
    ///
    /// `env` entries are `KEY=VALUE` strings; malformed entries are
    /// ignored.
    pub fn spawn(command: &[String], env: &[String]) -> McpResult<Self> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| McpError::protocol("empty command"))?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        for entry in env {
            if let Some((key, value)) = entry.split_once('=') {
                cmd.env(key, value);
            }
        }

        let mut child = cmd.spawn().map_err(|e| {
            McpError::connection_failed(format!("failed to spawn {program:?}: {e}"))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| McpError::connection_failed("child stdin unavailable"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| McpError::connection_failed("child stdout unavailable"))?;

        debug!(program = %program, "spawned stdio mcp server");
        Ok(Self {
            session: Mutex::new(Some(StdioSession {
                child,
                stdin,
                stdout: BufReader::new(stdout),
            })),
        })
    }

    async fn write_line(session: &mut StdioSession, payload: String) -> McpResult<()> {
        session.stdin.write_all(payload.as_bytes()).await?;
        session.stdin.write_all(b"\n").await?;
        session.stdin.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn request(&self, request: JsonRpcRequest) -> McpResult<JsonRpcResponse> {
        let mut guard = self.session.lock().await;
        let session = guard
            .as_mut()
            .ok_or_else(|| McpError::connection_failed("stdio transport is closed"))?;

        let id = request.id;
        let payload = serde_json::to_string(&request)?;
        debug!(id, method = %request.method, "sending stdio request");
        Self::write_line(session, payload).await?;

        // Read lines until the matching response shows up; skip blank
        // lines, startup banners, and unrelated messages.
        let mut line = String::new();
        loop {
            line.clear();
            let n = session.stdout.read_line(&mut line).await?;
            if n == 0 {
                return Err(McpError::connection_failed("stdio server closed its stdout"));
            }
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            match serde_json::from_str::<JsonRpcResponse>(trimmed) {
                Ok(response) if response.id == Some(id) => return Ok(response),
                Ok(_) => continue,
                Err(_) => {
                    debug!(line = trimmed, "skipping non-json stdio output");
                    continue;
                }
            }
        }
    }

    async fn notify(&self, notification: JsonRpcNotification) -> McpResult<()> {
        let mut guard = self.session.lock().await;
        let session = guard
            .as_mut()
            .ok_or_else(|| McpError::connection_failed("stdio transport is closed"))?;
        let payload = serde_json::to_string(&notification)?;
        Self::write_line(session, payload).await
    }

    async fn close(&self) -> McpResult<()> {
        if let Some(mut session) = self.session.lock().await.take() {
            if let Err(e) = session.child.start_kill() {
                warn!(error = %e, "failed to kill stdio server");
            }
            let _ = session.child.wait().await;
            debug!("closed stdio transport");
        }
        Ok(())
    }
}
