//! The registry: configuration snapshot, tool cache, and the high-level
//! operations the IPC router dispatches to.
//!
//! Lock discipline: take the read lock to snapshot the config, release it,
//! then do network I/O; the write lock is only held to install a freshly
//! built cache or a new config.

use crate::client::McpClient;
use crate::error::{McpError, McpResult};
use crate::oauth::{run_oauth_login, run_with_oauth_fallback};
use crate::schema::{parse_schema, parse_schema_detail};
use crate::token::TokenStoreProvider;
use chrono::{DateTime, Utc};
use mcpshim_core::config::{Config, ServerEntry, Transport};
use mcpshim_core::protocol::{ServerInfo, ToolDetail, ToolInfo};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

struct RegistryState {
    config: Arc<Config>,
    tool_cache: HashMap<String, Vec<ToolInfo>>,
    cache_stamp: Option<DateTime<Utc>>,
}

/// Owns the current configuration and the tool-name cache, and turns
/// list/inspect/call/login into MCP sessions.
pub struct Registry {
    state: RwLock<RegistryState>,
    tokens: Arc<dyn TokenStoreProvider>,
}

impl Registry {
    pub fn new(config: Arc<Config>, tokens: Arc<dyn TokenStoreProvider>) -> Self {
        Self {
            state: RwLock::new(RegistryState {
                config,
                tool_cache: HashMap::new(),
                cache_stamp: None,
            }),
            tokens,
        }
    }

    /// Install a new configuration and invalidate the tool cache.
    pub async fn update_config(&self, config: Arc<Config>) {
        let mut state = self.state.write().await;
        state.config = config;
        state.tool_cache = HashMap::new();
        state.cache_stamp = None;
    }

    async fn snapshot(&self) -> Arc<Config> {
        self.state.read().await.config.clone()
    }

    /// Materialize the configured servers.
    pub async fn servers(&self) -> Vec<ServerInfo> {
        let config = self.snapshot().await;
        config
            .servers
            .iter()
            .map(|entry| ServerInfo {
                name: entry.name.clone(),
                alias: entry.alias.clone(),
                url: entry.url.clone(),
                transport: entry.transport.to_string(),
                has_auth: entry.has_authorization_header(),
            })
            .collect()
    }

    /// Total tools across the last successfully installed cache.
    pub async fn tool_count(&self) -> usize {
        let state = self.state.read().await;
        state.tool_cache.values().map(Vec::len).sum()
    }

    /// When the cache was last rebuilt, if ever.
    pub async fn cache_stamp(&self) -> Option<DateTime<Utc>> {
        self.state.read().await.cache_stamp
    }

    /// List tools, live. With a server given, resolve it (by name or
    /// alias) and fetch; without, aggregate best-effort across all
    /// servers, sorted by (server, tool).
    pub async fn list_tools(&self, server: Option<&str>) -> McpResult<Vec<ToolInfo>> {
        let config = self.snapshot().await;

        if let Some(query) = server.filter(|q| !q.is_empty()) {
            let entry = find_server(&config, query)?;
            return fetch_tools_for_server(entry, self.tokens.as_ref(), true).await;
        }

        let mut all = Vec::new();
        for entry in &config.servers {
            match fetch_tools_for_server(entry, self.tokens.as_ref(), true).await {
                Ok(mut items) => all.append(&mut items),
                Err(err) => {
                    debug!(server = %entry.name, error = %err, "skipping server during listing");
                }
            }
        }
        all.sort_by(|a, b| (a.server.as_str(), a.name.as_str()).cmp(&(b.server.as_str(), b.name.as_str())));
        Ok(all)
    }

    /// Fetch one tool's expanded schema detail, live.
    pub async fn inspect_tool(&self, server: &str, tool: &str) -> McpResult<ToolDetail> {
        let config = self.snapshot().await;
        let entry = find_server(&config, server)?;
        let tools = fetch_tools_raw(entry, self.tokens.as_ref(), true).await?;

        for item in tools {
            if item.name == tool {
                let schema = item.input_schema.unwrap_or(Value::Null);
                let (required, _) = parse_schema(&schema);
                return Ok(ToolDetail {
                    server: entry.name.clone(),
                    name: item.name,
                    description: item.description.unwrap_or_default(),
                    properties: parse_schema_detail(&schema, &required),
                });
            }
        }
        Err(McpError::ToolNotFound {
            server: entry.name.clone(),
            tool: tool.to_string(),
        })
    }

    /// Invoke a tool through the OAuth fallback wrapper (interactive).
    pub async fn call(
        &self,
        server: &str,
        tool: &str,
        args: Option<Map<String, Value>>,
    ) -> McpResult<Value> {
        let config = self.snapshot().await;
        let entry = find_server(&config, server)?.clone();
        let args = args.unwrap_or_default();
        let tool = tool.to_string();

        let result = run_with_oauth_fallback(&entry, self.tokens.as_ref(), true, {
            let tool = tool.clone();
            let args = args.clone();
            move |client: Arc<McpClient>| {
                let tool = tool.clone();
                let args = args.clone();
                async move { client.call_tool(&tool, args).await }
            }
        })
        .await?;

        Ok(serde_json::to_value(result)?)
    }

    /// Run the explicit OAuth login flow for a server.
    pub async fn login(&self, server: &str, manual: bool) -> McpResult<()> {
        let config = self.snapshot().await;
        let entry = find_server(&config, server)?.clone();
        if entry.transport == Transport::Stdio {
            return Err(McpError::StdioLogin(entry.name));
        }
        run_oauth_login(&entry, self.tokens.as_ref(), manual).await
    }

    /// Rebuild the whole tool cache, best-effort and non-interactive. A
    /// failing server simply contributes nothing; mid-rebuild readers see
    /// the previous snapshot.
    pub async fn refresh(&self) {
        let config = self.snapshot().await;

        let mut cache = HashMap::new();
        for entry in &config.servers {
            match fetch_tools_for_server(entry, self.tokens.as_ref(), false).await {
                Ok(tools) => {
                    cache.insert(entry.name.clone(), tools);
                }
                Err(err) => {
                    warn!(server = %entry.name, error = %err, "refresh skipped server");
                }
            }
        }

        let mut state = self.state.write().await;
        state.tool_cache = cache;
        state.cache_stamp = Some(Utc::now());
    }
}

fn find_server<'a>(config: &'a Config, name_or_alias: &str) -> McpResult<&'a ServerEntry> {
    config
        .find_server(name_or_alias)
        .ok_or_else(|| McpError::UnknownServer(name_or_alias.to_string()))
}

async fn fetch_tools_for_server(
    entry: &ServerEntry,
    tokens: &dyn TokenStoreProvider,
    interactive: bool,
) -> McpResult<Vec<ToolInfo>> {
    let raw = fetch_tools_raw(entry, tokens, interactive).await?;
    Ok(raw
        .into_iter()
        .map(|tool| {
            let schema = tool.input_schema.unwrap_or(Value::Null);
            let (required, properties) = parse_schema(&schema);
            ToolInfo {
                server: entry.name.clone(),
                name: tool.name,
                description: tool.description.unwrap_or_default(),
                required,
                properties,
            }
        })
        .collect())
}

async fn fetch_tools_raw(
    entry: &ServerEntry,
    tokens: &dyn TokenStoreProvider,
    interactive: bool,
) -> McpResult<Vec<crate::protocol::McpTool>> {
    run_with_oauth_fallback(entry, tokens, interactive, |client: Arc<McpClient>| async move {
        client.list_tools().await
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::{MemoryTokenStore, TokenStore};

    struct MemoryTokens;

    impl TokenStoreProvider for MemoryTokens {
        fn token_store(&self, _server: &str) -> Arc<dyn TokenStore> {
            Arc::new(MemoryTokenStore::default())
        }
    }

    fn registry_with(servers: Vec<ServerEntry>) -> Registry {
        let config = Arc::new(Config {
            servers,
            ..Default::default()
        });
        Registry::new(config, Arc::new(MemoryTokens))
    }

    fn http_entry(name: &str, alias: &str) -> ServerEntry {
        ServerEntry {
            name: name.to_string(),
            alias: alias.to_string(),
            url: format!("https://{name}.example.test/mcp"),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn servers_reports_auth_presence() {
        let mut with_auth = http_entry("a", "a");
        with_auth
            .headers
            .insert("authorization".to_string(), "Bearer x".to_string());
        let registry = registry_with(vec![with_auth, http_entry("b", "bee")]);

        let servers = registry.servers().await;
        assert_eq!(servers.len(), 2);
        assert!(servers[0].has_auth);
        assert!(!servers[1].has_auth);
        assert_eq!(servers[1].alias, "bee");
        assert_eq!(servers[1].transport, "http");
    }

    #[tokio::test]
    async fn tool_count_starts_empty() {
        let registry = registry_with(vec![http_entry("a", "a")]);
        assert_eq!(registry.tool_count().await, 0);
        assert!(registry.cache_stamp().await.is_none());
    }

    #[tokio::test]
    async fn update_config_invalidates_cache() {
        let registry = registry_with(vec![]);
        {
            let mut state = registry.state.write().await;
            state.tool_cache.insert(
                "a".to_string(),
                vec![ToolInfo {
                    server: "a".to_string(),
                    name: "t".to_string(),
                    description: String::new(),
                    required: vec![],
                    properties: vec![],
                }],
            );
            state.cache_stamp = Some(Utc::now());
        }
        assert_eq!(registry.tool_count().await, 1);

        registry.update_config(Arc::new(Config::default())).await;
        assert_eq!(registry.tool_count().await, 0);
        assert!(registry.cache_stamp().await.is_none());
    }

    #[tokio::test]
    async fn list_tools_unknown_server() {
        let registry = registry_with(vec![http_entry("a", "a")]);
        let result = registry.list_tools(Some("missing")).await;
        assert!(matches!(result, Err(McpError::UnknownServer(q)) if q == "missing"));
    }

    #[tokio::test]
    async fn call_unknown_server() {
        let registry = registry_with(vec![]);
        let result = registry.call("ghost", "tool", None).await;
        assert!(matches!(result, Err(McpError::UnknownServer(_))));
    }

    #[tokio::test]
    async fn login_unknown_server() {
        let registry = registry_with(vec![]);
        let err = registry.login("nonexistent", false).await.unwrap_err();
        assert!(err.to_string().contains("unknown server"));
    }

    #[tokio::test]
    async fn login_rejects_stdio_servers() {
        let registry = registry_with(vec![ServerEntry {
            name: "local".to_string(),
            alias: "local".to_string(),
            transport: Transport::Stdio,
            command: vec!["mcp-local".to_string()],
            ..Default::default()
        }]);
        let err = registry.login("local", false).await.unwrap_err();
        assert!(err.to_string().contains("stdio"));
    }

    #[tokio::test]
    async fn refresh_with_unreachable_servers_installs_empty_cache() {
        let registry = registry_with(vec![ServerEntry {
            name: "down".to_string(),
            alias: "down".to_string(),
            url: "http://127.0.0.1:1/mcp".to_string(),
            ..Default::default()
        }]);
        registry.refresh().await;
        assert_eq!(registry.tool_count().await, 0);
        assert!(registry.cache_stamp().await.is_some());
    }
}
