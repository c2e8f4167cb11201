//! MCP client sessions.
//!
//! Every operation runs against a fresh client: build a
//! transport-appropriate handle, initialize, run the operation, close on
//! every exit path. Nothing retains a live session between operations.

use crate::error::{McpError, McpResult};
use crate::http::{HttpConfig, HttpTransport};
use crate::protocol::{
    CallToolParams, InitializeParams, InitializeResult, JsonRpcNotification, JsonRpcRequest,
    JsonRpcResponse, ListToolsResult, McpTool, ToolCallResult,
};
use crate::sse::{SseConfig, SseTransport};
use crate::stdio::StdioTransport;
use crate::transport::{BearerSource, Transport};
use mcpshim_core::config::{ServerEntry, Transport as TransportKind};
use serde_json::{Map, Value};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// A single-session MCP client over one transport.
pub struct McpClient {
    transport: Arc<dyn Transport>,
    next_id: AtomicU64,
}

impl McpClient {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            next_id: AtomicU64::new(1),
        }
    }

    fn next_request_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    async fn request(&self, method: &str, params: Option<Value>) -> McpResult<Value> {
        let request = JsonRpcRequest::new(self.next_request_id(), method, params);
        let response: JsonRpcResponse = self.transport.request(request).await?;
        if let Some(error) = response.error {
            return Err(McpError::protocol(error.message));
        }
        response
            .result
            .ok_or_else(|| McpError::protocol(format!("missing {method} result")))
    }

    /// Run the initialize handshake and send the initialized notification.
    pub async fn initialize(&self) -> McpResult<InitializeResult> {
        let params = serde_json::to_value(InitializeParams::default())?;
        let result = self.request("initialize", Some(params)).await?;
        let parsed: InitializeResult = serde_json::from_value(result)
            .map_err(|e| McpError::protocol(format!("invalid initialize result: {e}")))?;

        debug!(
            protocol_version = %parsed.protocol_version,
            server = %parsed.server_info.name,
            "mcp session initialized"
        );

        self.transport
            .notify(JsonRpcNotification::new("notifications/initialized", None))
            .await?;
        Ok(parsed)
    }

    /// Fetch the server's tool list.
    pub async fn list_tools(&self) -> McpResult<Vec<McpTool>> {
        let result = self.request("tools/list", None).await?;
        let parsed: ListToolsResult = serde_json::from_value(result)
            .map_err(|e| McpError::protocol(format!("invalid tools/list result: {e}")))?;
        Ok(parsed.tools)
    }

    /// Invoke a tool.
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Map<String, Value>,
    ) -> McpResult<ToolCallResult> {
        let params = serde_json::to_value(CallToolParams {
            name: name.to_string(),
            arguments: Some(arguments),
        })?;
        let result = self.request("tools/call", Some(params)).await?;
        serde_json::from_value(result)
            .map_err(|e| McpError::protocol(format!("invalid tools/call result: {e}")))
    }

    /// Release the underlying transport.
    pub async fn close(&self) -> McpResult<()> {
        self.transport.close().await
    }
}

/// Build a transport-appropriate client for a server descriptor.
///
/// `auth` attaches a bearer-token source to HTTP transports; it is ignored
/// for stdio, which never authenticates.
pub fn new_client(
    entry: &ServerEntry,
    auth: Option<Arc<dyn BearerSource>>,
) -> McpResult<McpClient> {
    let transport: Arc<dyn Transport> = match entry.transport {
        TransportKind::Http => Arc::new(HttpTransport::new(
            HttpConfig::new(entry.url.clone(), entry.headers.clone()),
            auth,
        )?),
        TransportKind::Sse => Arc::new(SseTransport::new(
            SseConfig::new(entry.url.clone(), entry.headers.clone()),
            auth,
        )?),
        TransportKind::Stdio => {
            if entry.command.is_empty() {
                return Err(McpError::NoCommand(entry.name.clone()));
            }
            Arc::new(StdioTransport::spawn(&entry.command, &entry.env)?)
        }
    };
    Ok(McpClient::new(transport))
}

/// Run one operation through a fresh client: initialize first, close on
/// every exit path.
pub async fn run_operation<T, F, Fut>(
    entry: &ServerEntry,
    auth: Option<Arc<dyn BearerSource>>,
    op: &F,
) -> McpResult<T>
where
    F: Fn(Arc<McpClient>) -> Fut,
    Fut: Future<Output = McpResult<T>> + Send,
{
    let client = Arc::new(new_client(entry, auth)?);
    run_with_client(&client, op).await
}

/// Initialize, run the operation, and close, regardless of outcome.
pub async fn run_with_client<T, F, Fut>(client: &Arc<McpClient>, op: &F) -> McpResult<T>
where
    F: Fn(Arc<McpClient>) -> Fut,
    Fut: Future<Output = McpResult<T>> + Send,
{
    let result = async {
        client.initialize().await?;
        op(client.clone()).await
    }
    .await;
    let _ = client.close().await;
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn stdio_entry(command: Vec<String>) -> ServerEntry {
        ServerEntry {
            name: "local".to_string(),
            transport: TransportKind::Stdio,
            command,
            ..Default::default()
        }
    }

    #[test]
    fn factory_rejects_stdio_without_command() {
        let result = new_client(&stdio_entry(vec![]), None);
        assert!(matches!(result, Err(McpError::NoCommand(name)) if name == "local"));
    }

    #[test]
    fn factory_builds_http_client() {
        let entry = ServerEntry {
            name: "remote".to_string(),
            url: "https://example.test/mcp".to_string(),
            headers: BTreeMap::from([("X-Api-Key".to_string(), "k".to_string())]),
            ..Default::default()
        };
        assert!(new_client(&entry, None).is_ok());
    }

    #[test]
    fn factory_builds_sse_client() {
        let entry = ServerEntry {
            name: "remote".to_string(),
            url: "https://example.test/sse".to_string(),
            transport: TransportKind::Sse,
            ..Default::default()
        };
        assert!(new_client(&entry, None).is_ok());
    }

    #[test]
    fn request_ids_increment() {
        let entry = ServerEntry {
            name: "remote".to_string(),
            url: "https://example.test/mcp".to_string(),
            ..Default::default()
        };
        let client = new_client(&entry, None).unwrap();
        assert_eq!(client.next_request_id(), 1);
        assert_eq!(client.next_request_id(), 2);
    }
}
