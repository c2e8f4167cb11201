//! HTTP + SSE transport for remote MCP servers.
//!
//! The legacy SSE flavor: a long-lived GET stream delivers events from the
//! server, the first `endpoint` event names the URL requests are POSTed to,
//! and responses are matched back to requests by JSON-RPC id.

use crate::error::{McpError, McpResult};
use crate::protocol::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};
use crate::transport::{BearerSource, Transport};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{Client, StatusCode};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

const ENDPOINT_WAIT_SECS: u64 = 10;

/// SSE transport configuration.
#[derive(Debug, Clone)]
pub struct SseConfig {
    /// The SSE endpoint URL (e.g. `https://mcp.example.com/sse`).
    pub url: String,
    /// Static request headers from the server descriptor.
    pub headers: BTreeMap<String, String>,
    /// Per-request timeout in seconds (the event stream itself is unbounded).
    pub timeout_secs: u64,
}

impl SseConfig {
    pub fn new(url: impl Into<String>, headers: BTreeMap<String, String>) -> Self {
        Self {
            url: url.into(),
            headers,
            timeout_secs: 60,
        }
    }
}

type PendingMap = Arc<StdMutex<HashMap<u64, oneshot::Sender<JsonRpcResponse>>>>;

struct SseConnection {
    endpoint: String,
    pending: PendingMap,
    reader: JoinHandle<()>,
}

/// SSE transport.
pub struct SseTransport {
    config: SseConfig,
    /// Client for POSTs, bounded by the request timeout.
    client: Client,
    /// Client for the event stream; no overall timeout.
    stream_client: Client,
    auth: Option<Arc<dyn BearerSource>>,
    conn: Mutex<Option<SseConnection>>,
}

impl SseTransport {
    /// Create a new transport. The event stream is opened lazily on the
    /// first request.
    pub fn new(config: SseConfig, auth: Option<Arc<dyn BearerSource>>) -> McpResult<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| McpError::connection_failed(format!("failed to build http client: {e}")))?;
        let stream_client = Client::builder()
            .connect_timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| McpError::connection_failed(format!("failed to build sse client: {e}")))?;

        Ok(Self {
            config,
            client,
            stream_client,
            auth,
            conn: Mutex::new(None),
        })
    }

    async fn bearer_header(&self) -> McpResult<Option<String>> {
        match &self.auth {
            Some(auth) => Ok(auth.bearer().await?.map(|t| format!("Bearer {t}"))),
            None => Ok(None),
        }
    }

    /// Open the event stream and wait for the server's `endpoint` event.
    async fn connect(&self) -> McpResult<(String, PendingMap)> {
        let mut guard = self.conn.lock().await;
        if let Some(conn) = guard.as_ref() {
            if !conn.reader.is_finished() {
                return Ok((conn.endpoint.clone(), conn.pending.clone()));
            }
            warn!("sse stream ended, reconnecting");
            guard.take();
        }

        let mut req = self
            .stream_client
            .get(&self.config.url)
            .header("Accept", "text/event-stream");
        for (key, value) in &self.config.headers {
            req = req.header(key, value);
        }
        if let Some(auth) = self.bearer_header().await? {
            req = req.header("Authorization", auth);
        }

        let response = req.send().await.map_err(|e| {
            if e.is_connect() {
                McpError::connection_failed(e.to_string())
            } else {
                McpError::protocol(format!("sse connect failed: {e}"))
            }
        })?;

        if response.status() == StatusCode::UNAUTHORIZED {
            return Err(McpError::Unauthorized);
        }
        if !response.status().is_success() {
            return Err(McpError::protocol(format!(
                "sse connect returned {}",
                response.status()
            )));
        }

        let pending: PendingMap = Arc::new(StdMutex::new(HashMap::new()));
        let (endpoint_tx, endpoint_rx) = oneshot::channel::<String>();

        let base_url = self.config.url.clone();
        let reader_pending = pending.clone();
        let reader = tokio::spawn(async move {
            read_event_stream(response, base_url, endpoint_tx, reader_pending).await;
        });

        let endpoint = match tokio::time::timeout(
            std::time::Duration::from_secs(ENDPOINT_WAIT_SECS),
            endpoint_rx,
        )
        .await
        {
            Ok(Ok(endpoint)) => endpoint,
            Ok(Err(_)) => {
                reader.abort();
                return Err(McpError::protocol("sse stream closed before endpoint event"));
            }
            Err(_) => {
                reader.abort();
                return Err(McpError::protocol("timed out waiting for sse endpoint event"));
            }
        };

        debug!(endpoint = %endpoint, "sse session established");
        *guard = Some(SseConnection {
            endpoint: endpoint.clone(),
            pending: pending.clone(),
            reader,
        });
        Ok((endpoint, pending))
    }

    async fn post(&self, endpoint: &str, body: String) -> McpResult<reqwest::Response> {
        let mut req = self
            .client
            .post(endpoint)
            .header("Content-Type", "application/json")
            .body(body);
        for (key, value) in &self.config.headers {
            req = req.header(key, value);
        }
        if let Some(auth) = self.bearer_header().await? {
            req = req.header("Authorization", auth);
        }

        let response = req.send().await.map_err(|e| {
            if e.is_timeout() {
                McpError::Timeout
            } else if e.is_connect() {
                McpError::connection_failed(e.to_string())
            } else {
                McpError::protocol(format!("request failed: {e}"))
            }
        })?;

        if response.status() == StatusCode::UNAUTHORIZED {
            return Err(McpError::Unauthorized);
        }
        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(McpError::protocol(format!("server returned {status}: {text}")));
        }
        Ok(response)
    }
}

/// Parse the event stream, publishing the endpoint event once and routing
/// response events to their waiting requests.
async fn read_event_stream(
    response: reqwest::Response,
    base_url: String,
    endpoint_tx: oneshot::Sender<String>,
    pending: PendingMap,
) {
    let mut endpoint_tx = Some(endpoint_tx);
    let mut stream = response.bytes_stream();
    let mut buffer = String::new();
    let mut event_name = String::new();
    let mut data = String::new();

    while let Some(chunk) = stream.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => {
                warn!(error = %e, "sse stream error");
                break;
            }
        };
        buffer.push_str(&String::from_utf8_lossy(&chunk));

        while let Some(newline) = buffer.find('\n') {
            let line = buffer[..newline].trim_end_matches('\r').to_string();
            buffer.drain(..=newline);

            if line.is_empty() {
                dispatch_event(&event_name, &data, &base_url, &mut endpoint_tx, &pending);
                event_name.clear();
                data.clear();
            } else if let Some(name) = line.strip_prefix("event:") {
                event_name = name.trim().to_string();
            } else if let Some(payload) = line.strip_prefix("data:") {
                if !data.is_empty() {
                    data.push('\n');
                }
                data.push_str(payload.trim_start());
            }
        }
    }

    // Stream is gone; wake every waiter with a closed channel.
    pending.lock().unwrap_or_else(std::sync::PoisonError::into_inner).clear();
}

fn dispatch_event(
    event_name: &str,
    data: &str,
    base_url: &str,
    endpoint_tx: &mut Option<oneshot::Sender<String>>,
    pending: &PendingMap,
) {
    if data.is_empty() {
        return;
    }

    if event_name == "endpoint" {
        if let Some(tx) = endpoint_tx.take() {
            let endpoint = resolve_endpoint(base_url, data);
            let _ = tx.send(endpoint);
        }
        return;
    }

    match serde_json::from_str::<JsonRpcResponse>(data) {
        Ok(response) => {
            if let Some(id) = response.id {
                let sender = pending.lock().unwrap_or_else(std::sync::PoisonError::into_inner).remove(&id);
                if let Some(sender) = sender {
                    let _ = sender.send(response);
                } else {
                    debug!(id, "dropping unsolicited sse response");
                }
            }
        }
        Err(_) => debug!(event = %event_name, "ignoring non-response sse event"),
    }
}

/// Resolve a possibly relative endpoint against the stream URL.
fn resolve_endpoint(base_url: &str, endpoint: &str) -> String {
    match url::Url::parse(base_url).and_then(|base| base.join(endpoint)) {
        Ok(resolved) => resolved.to_string(),
        Err(_) => endpoint.to_string(),
    }
}

#[async_trait]
impl Transport for SseTransport {
    async fn request(&self, request: JsonRpcRequest) -> McpResult<JsonRpcResponse> {
        let (endpoint, pending) = self.connect().await?;

        let id = request.id;
        let (tx, rx) = oneshot::channel();
        pending.lock().unwrap_or_else(std::sync::PoisonError::into_inner).insert(id, tx);

        let body = serde_json::to_string(&request)?;
        debug!(id, method = %request.method, "sending sse request");

        let response = match self.post(&endpoint, body).await {
            Ok(response) => response,
            Err(err) => {
                pending.lock().unwrap_or_else(std::sync::PoisonError::into_inner).remove(&id);
                return Err(err);
            }
        };

        // Some servers answer inline instead of over the stream.
        let text = response.text().await.unwrap_or_default();
        if let Ok(inline) = serde_json::from_str::<JsonRpcResponse>(&text) {
            if inline.id == Some(id) {
                pending.lock().unwrap_or_else(std::sync::PoisonError::into_inner).remove(&id);
                return Ok(inline);
            }
        }

        rx.await
            .map_err(|_| McpError::connection_failed("sse stream closed while awaiting response"))
    }

    async fn notify(&self, notification: JsonRpcNotification) -> McpResult<()> {
        let (endpoint, _) = self.connect().await?;
        let body = serde_json::to_string(&notification)?;
        debug!(method = %notification.method, "sending sse notification");
        self.post(&endpoint, body).await?;
        Ok(())
    }

    async fn close(&self) -> McpResult<()> {
        if let Some(conn) = self.conn.lock().await.take() {
            conn.reader.abort();
            debug!("closed sse transport");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_creation() {
        let config = SseConfig::new("https://example.test/sse", BTreeMap::new());
        assert!(SseTransport::new(config, None).is_ok());
    }

    #[test]
    fn endpoint_resolution() {
        assert_eq!(
            resolve_endpoint("https://example.test/sse", "/messages?session=1"),
            "https://example.test/messages?session=1"
        );
        assert_eq!(
            resolve_endpoint("https://example.test/sse", "https://other.test/post"),
            "https://other.test/post"
        );
    }

    #[test]
    fn dispatch_routes_endpoint_event() {
        let pending: PendingMap = Arc::new(StdMutex::new(HashMap::new()));
        let (tx, mut rx) = oneshot::channel();
        let mut slot = Some(tx);
        dispatch_event(
            "endpoint",
            "/messages",
            "https://example.test/sse",
            &mut slot,
            &pending,
        );
        assert_eq!(rx.try_recv().unwrap(), "https://example.test/messages");
        assert!(slot.is_none());
    }

    #[test]
    fn dispatch_routes_response_by_id() {
        let pending: PendingMap = Arc::new(StdMutex::new(HashMap::new()));
        let (tx, mut rx) = oneshot::channel();
        pending.lock().unwrap().insert(7, tx);

        let mut slot = None;
        dispatch_event(
            "message",
            r#"{"jsonrpc":"2.0","id":7,"result":{}}"#,
            "https://example.test/sse",
            &mut slot,
            &pending,
        );
        let response = rx.try_recv().unwrap();
        assert_eq!(response.id, Some(7));
        assert!(pending.lock().unwrap().is_empty());
    }

    #[test]
    fn dispatch_ignores_unknown_ids() {
        let pending: PendingMap = Arc::new(StdMutex::new(HashMap::new()));
        let mut slot = None;
        dispatch_event(
            "message",
            r#"{"jsonrpc":"2.0","id":99,"result":{}}"#,
            "https://example.test/sse",
            &mut slot,
            &pending,
        );
        assert!(pending.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn request_connection_refused() {
        let mut config = SseConfig::new("http://127.0.0.1:1", BTreeMap::new());
        config.timeout_secs = 1;
        let transport = SseTransport::new(config, None).unwrap();
        let result = transport
            .request(JsonRpcRequest::new(1, "initialize", None))
            .await;
        assert!(result.is_err());
    }
}
