//! End-to-end session tests against an in-process fake MCP server.

use mcpshim_core::config::{Config, ServerEntry};
use mcpshim_mcp::token::{MemoryTokenStore, TokenStore, TokenStoreProvider};
use mcpshim_mcp::{McpError, Registry};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

struct MemoryTokens;

impl TokenStoreProvider for MemoryTokens {
    fn token_store(&self, _server: &str) -> Arc<dyn TokenStore> {
        Arc::new(MemoryTokenStore::default())
    }
}

/// Serve a minimal streamable-HTTP MCP endpoint. Each connection carries
/// one POST; the response depends on the JSON-RPC method.
async fn spawn_fake_mcp_server(always_unauthorized: bool) -> String {
    let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let Some(body) = read_http_request(&mut stream).await else {
                    return;
                };

                if always_unauthorized {
                    write_http(&mut stream, 401, "application/json", "").await;
                    return;
                }

                let message: Value = match serde_json::from_str(&body) {
                    Ok(message) => message,
                    Err(_) => {
                        write_http(&mut stream, 400, "text/plain", "bad json").await;
                        return;
                    }
                };

                let method = message["method"].as_str().unwrap_or_default().to_string();
                let id = message["id"].clone();

                if id.is_null() {
                    // Notification; acknowledge with no content.
                    write_http(&mut stream, 202, "application/json", "").await;
                    return;
                }

                let result = match method.as_str() {
                    "initialize" => json!({
                        "protocolVersion": "2025-03-26",
                        "capabilities": {"tools": {}},
                        "serverInfo": {"name": "fake-mcp", "version": "0.0.1"}
                    }),
                    "tools/list" => json!({
                        "tools": [
                            {
                                "name": "search",
                                "description": "Search pages",
                                "inputSchema": {
                                    "type": "object",
                                    "required": ["query"],
                                    "properties": {
                                        "query": {"type": "string", "description": "Search query"},
                                        "limit": {"type": "integer", "description": "Max results"}
                                    }
                                }
                            },
                            {"name": "about", "description": "About this server"}
                        ]
                    }),
                    "tools/call" => json!({
                        "content": [{"type": "text", "text": "ran"}],
                        "isError": false
                    }),
                    _ => json!({}),
                };

                let response = json!({"jsonrpc": "2.0", "id": id, "result": result});
                write_http(
                    &mut stream,
                    200,
                    "application/json",
                    &response.to_string(),
                )
                .await;
            });
        }
    });

    format!("http://{addr}/mcp")
}

async fn read_http_request(stream: &mut tokio::net::TcpStream) -> Option<String> {
    let mut raw = Vec::new();
    let mut buf = [0u8; 2048];
    loop {
        let n = stream.read(&mut buf).await.ok()?;
        if n == 0 {
            return None;
        }
        raw.extend_from_slice(&buf[..n]);
        if let Some(header_end) = find_header_end(&raw) {
            let headers = String::from_utf8_lossy(&raw[..header_end]).to_string();
            let content_length = headers
                .lines()
                .find_map(|line| {
                    let (name, value) = line.split_once(':')?;
                    name.eq_ignore_ascii_case("content-length")
                        .then(|| value.trim().parse::<usize>().ok())?
                })
                .unwrap_or(0);
            let body_start = header_end + 4;
            while raw.len() < body_start + content_length {
                let n = stream.read(&mut buf).await.ok()?;
                if n == 0 {
                    return None;
                }
                raw.extend_from_slice(&buf[..n]);
            }
            return Some(
                String::from_utf8_lossy(&raw[body_start..body_start + content_length]).to_string(),
            );
        }
    }
}

fn find_header_end(raw: &[u8]) -> Option<usize> {
    raw.windows(4).position(|window| window == b"\r\n\r\n")
}

async fn write_http(
    stream: &mut tokio::net::TcpStream,
    status: u16,
    content_type: &str,
    body: &str,
) {
    let status_text = match status {
        200 => "OK",
        202 => "Accepted",
        401 => "Unauthorized",
        _ => "Error",
    };
    let response = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        status_text,
        content_type,
        body.len(),
        body
    );
    let _ = stream.write_all(response.as_bytes()).await;
}

fn registry_for(url: String) -> Registry {
    let config = Arc::new(Config {
        servers: vec![ServerEntry {
            name: "fake".to_string(),
            alias: "fake".to_string(),
            url,
            ..Default::default()
        }],
        ..Default::default()
    });
    Registry::new(config, Arc::new(MemoryTokens))
}

#[tokio::test]
async fn list_tools_over_http() {
    let url = spawn_fake_mcp_server(false).await;
    let registry = registry_for(url);

    let tools = registry.list_tools(Some("fake")).await.unwrap();
    assert_eq!(tools.len(), 2);
    assert_eq!(tools[0].name, "about");
    assert_eq!(tools[1].name, "search");
    assert_eq!(tools[1].required, vec!["query"]);
    assert_eq!(tools[1].properties, vec!["limit", "query"]);
}

#[tokio::test]
async fn inspect_tool_over_http() {
    let url = spawn_fake_mcp_server(false).await;
    let registry = registry_for(url);

    let detail = registry.inspect_tool("fake", "search").await.unwrap();
    assert_eq!(detail.server, "fake");
    assert_eq!(detail.properties.len(), 2);
    assert_eq!(detail.properties[0].name, "limit");
    assert!(!detail.properties[0].required);
    assert_eq!(detail.properties[1].name, "query");
    assert!(detail.properties[1].required);

    let missing = registry.inspect_tool("fake", "nope").await.unwrap_err();
    assert!(missing.to_string().contains("not found on server"));
}

#[tokio::test]
async fn call_tool_over_http() {
    let url = spawn_fake_mcp_server(false).await;
    let registry = registry_for(url);

    let mut args = serde_json::Map::new();
    args.insert("query".to_string(), json!("roadmap"));
    let result = registry.call("fake", "search", Some(args)).await.unwrap();
    assert_eq!(result["content"][0]["text"], "ran");
}

#[tokio::test]
async fn refresh_populates_tool_cache() {
    let url = spawn_fake_mcp_server(false).await;
    let registry = registry_for(url);

    assert_eq!(registry.tool_count().await, 0);
    registry.refresh().await;
    assert_eq!(registry.tool_count().await, 2);
}

#[tokio::test]
async fn unauthorized_server_yields_advisory_error_when_non_interactive() {
    // A provider that 401s everything: the direct attempt trips the
    // sentinel, the oauth-wrapped attempt 401s again (no stored token),
    // and with interactive=false the engine must hand back the advisory
    // instead of opening a browser.
    let url = spawn_fake_mcp_server(true).await;
    let entry = ServerEntry {
        name: "locked".to_string(),
        alias: "locked".to_string(),
        url,
        ..Default::default()
    };

    let err = mcpshim_mcp::run_with_oauth_fallback(
        &entry,
        &MemoryTokens,
        false,
        |client: Arc<mcpshim_mcp::McpClient>| async move { client.list_tools().await },
    )
    .await
    .unwrap_err();

    assert!(matches!(err, McpError::AuthorizationRequired(ref name) if name == "locked"));
    assert!(err.to_string().contains("mcpshim tools --server locked"));
}

#[tokio::test]
async fn unauthorized_server_with_static_auth_header_skips_fallback() {
    let url = spawn_fake_mcp_server(true).await;
    let mut entry = ServerEntry {
        name: "locked".to_string(),
        alias: "locked".to_string(),
        url,
        ..Default::default()
    };
    entry
        .headers
        .insert("Authorization".to_string(), "Bearer stale".to_string());

    let err = mcpshim_mcp::run_with_oauth_fallback(
        &entry,
        &MemoryTokens,
        false,
        |client: Arc<mcpshim_mcp::McpClient>| async move { client.list_tools().await },
    )
    .await
    .unwrap_err();

    // The sentinel propagates untouched; no advisory, no oauth attempt.
    assert!(err.is_unauthorized());
}
