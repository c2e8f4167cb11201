//! Streamable HTTP transport for remote MCP servers.
//!
//! Requests go out as HTTP POSTs; the server answers with either a plain
//! JSON body or an SSE-framed body carrying the JSON-RPC response. A
//! session id handed back in `Mcp-Session-Id` is echoed on subsequent
//! requests.

use crate::error::{McpError, McpResult};
use crate::protocol::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};
use crate::transport::{BearerSource, Transport};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

const SESSION_HEADER: &str = "Mcp-Session-Id";

/// Streamable HTTP transport configuration.
#[derive(Debug, Clone)]
pub struct HttpConfig {
    /// The server URL (e.g. `https://mcp.example.com/mcp`).
    pub url: String,
    /// Static request headers from the server descriptor.
    pub headers: BTreeMap<String, String>,
    /// Request timeout in seconds.
    pub timeout_secs: u64,
}

impl HttpConfig {
    pub fn new(url: impl Into<String>, headers: BTreeMap<String, String>) -> Self {
        Self {
            url: url.into(),
            headers,
            timeout_secs: 60,
        }
    }
}

/// Streamable HTTP transport.
pub struct HttpTransport {
    config: HttpConfig,
    client: Client,
    auth: Option<Arc<dyn BearerSource>>,
    session_id: RwLock<Option<String>>,
}

impl HttpTransport {
    /// Create a new transport. Pure apart from building the HTTP client.
    pub fn new(config: HttpConfig, auth: Option<Arc<dyn BearerSource>>) -> McpResult<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| McpError::connection_failed(format!("failed to build http client: {e}")))?;

        Ok(Self {
            config,
            client,
            auth,
            session_id: RwLock::new(None),
        })
    }

    /// Build a POST carrying the common headers, the static descriptor
    /// headers, the session id, and the bearer token when one is available.
    async fn build_request(&self, body: String) -> McpResult<reqwest::RequestBuilder> {
        let mut req = self
            .client
            .post(&self.config.url)
            .header("Content-Type", "application/json")
            .header("Accept", "application/json, text/event-stream")
            .body(body);

        for (key, value) in &self.config.headers {
            req = req.header(key, value);
        }
        if let Some(session_id) = self.session_id.read().await.as_deref() {
            req = req.header(SESSION_HEADER, session_id);
        }
        if let Some(auth) = &self.auth {
            if let Some(token) = auth.bearer().await? {
                req = req.header("Authorization", format!("Bearer {token}"));
            }
        }
        Ok(req)
    }

    async fn parse_response(&self, response: reqwest::Response) -> McpResult<JsonRpcResponse> {
        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            return Err(McpError::Unauthorized);
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(McpError::protocol(format!("server returned {status}: {text}")));
        }

        let content_type = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        if content_type.contains("text/event-stream") {
            parse_sse_body(response).await
        } else {
            let text = response
                .text()
                .await
                .map_err(|e| McpError::protocol(format!("failed to read response: {e}")))?;
            serde_json::from_str(&text)
                .map_err(|e| McpError::protocol(format!("invalid json response: {e}")))
        }
    }
}

/// Scan an SSE-framed body for the first JSON-RPC response event.
async fn parse_sse_body(response: reqwest::Response) -> McpResult<JsonRpcResponse> {
    use futures::StreamExt;

    let mut stream = response.bytes_stream();
    let mut buffer = String::new();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| McpError::protocol(format!("stream error: {e}")))?;
        buffer.push_str(&String::from_utf8_lossy(&chunk));

        for line in buffer.lines() {
            if let Some(data) = line.strip_prefix("data: ") {
                if let Ok(parsed) = serde_json::from_str::<JsonRpcResponse>(data) {
                    return Ok(parsed);
                }
            }
        }

        // Keep only the trailing incomplete line.
        if let Some(last_newline) = buffer.rfind('\n') {
            buffer = buffer[last_newline + 1..].to_string();
        }
    }

    Err(McpError::protocol("event stream ended without a response"))
}

#[async_trait]
impl Transport for HttpTransport {
    async fn request(&self, request: JsonRpcRequest) -> McpResult<JsonRpcResponse> {
        let body = serde_json::to_string(&request)?;
        debug!(id = request.id, method = %request.method, "sending http request");

        let response = self.build_request(body).await?.send().await.map_err(|e| {
            if e.is_timeout() {
                McpError::Timeout
            } else if e.is_connect() {
                McpError::connection_failed(e.to_string())
            } else {
                McpError::protocol(format!("request failed: {e}"))
            }
        })?;

        if let Some(session_id) = response.headers().get(SESSION_HEADER) {
            if let Ok(id) = session_id.to_str() {
                *self.session_id.write().await = Some(id.to_string());
            }
        }

        self.parse_response(response).await
    }

    async fn notify(&self, notification: JsonRpcNotification) -> McpResult<()> {
        let body = serde_json::to_string(&notification)?;
        debug!(method = %notification.method, "sending http notification");

        let response = self
            .build_request(body)
            .await?
            .send()
            .await
            .map_err(|e| McpError::protocol(format!("notification failed: {e}")))?;

        if response.status() == StatusCode::UNAUTHORIZED {
            return Err(McpError::Unauthorized);
        }
        if !response.status().is_success() {
            warn!(status = %response.status(), "notification returned non-success status");
        }
        Ok(())
    }

    async fn close(&self) -> McpResult<()> {
        *self.session_id.write().await = None;
        debug!("closed http transport");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(url: &str) -> HttpConfig {
        HttpConfig::new(url, BTreeMap::new())
    }

    #[test]
    fn transport_creation() {
        assert!(HttpTransport::new(config("https://example.test/mcp"), None).is_ok());
    }

    #[test]
    fn config_defaults_timeout() {
        let cfg = config("https://example.test/mcp");
        assert_eq!(cfg.timeout_secs, 60);
    }

    #[tokio::test]
    async fn request_connection_refused() {
        let mut cfg = config("http://127.0.0.1:1");
        cfg.timeout_secs = 1;
        let transport = HttpTransport::new(cfg, None).unwrap();
        let result = transport
            .request(JsonRpcRequest::new(1, "initialize", None))
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn session_id_starts_empty() {
        let transport = HttpTransport::new(config("https://example.test/mcp"), None).unwrap();
        assert!(transport.session_id.read().await.is_none());
    }

    #[tokio::test]
    async fn close_clears_session() {
        let transport = HttpTransport::new(config("https://example.test/mcp"), None).unwrap();
        *transport.session_id.write().await = Some("abc".to_string());
        transport.close().await.unwrap();
        assert!(transport.session_id.read().await.is_none());
    }
}
