//! Action dispatch for the IPC socket.
//!
//! Every action runs under its own deadline and is converted to a
//! single-line error envelope at this boundary; nothing below panics on
//! bad input.

use crate::server::{Inner, Server};
use chrono::Utc;
use mcpshim_core::config::{canonical_header_name, ServerEntry, Transport};
use mcpshim_core::protocol::{Action, HistoryItem, Request, Response, StatusInfo};
use mcpshim_mcp::Registry;
use mcpshim_store::{Store, StoreTokens};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, warn};

const LIST_DEADLINE: Duration = Duration::from_secs(20);
const CALL_DEADLINE: Duration = Duration::from_secs(60);
const LOGIN_DEADLINE: Duration = Duration::from_secs(6 * 60);

impl Server {
    /// Dispatch one request.
    pub async fn handle(&self, req: Request) -> Response {
        match req.action {
            Action::Status => self.handle_status().await,
            Action::Servers => Response {
                ok: true,
                servers: Some(self.registry().await.servers().await),
                ..Default::default()
            },
            Action::Tools => self.handle_tools(&req).await,
            Action::Inspect => self.handle_inspect(&req).await,
            Action::Call => self.handle_call(&req).await,
            Action::History => self.handle_history(&req).await,
            Action::AddServer => self.handle_add_server(&req).await,
            Action::RemoveServer => self.handle_remove_server(&req).await,
            Action::SetAuth => self.handle_set_auth(&req).await,
            Action::Reload => self.handle_reload().await,
            Action::Login => self.handle_login(&req).await,
            Action::Unknown => Response::error("unknown action"),
        }
    }

    async fn handle_status(&self) -> Response {
        let inner = self.inner.read().await;
        let status = StatusInfo {
            started_at: self.started_at,
            uptime_sec: (Utc::now() - self.started_at).num_seconds(),
            server_count: inner.config.servers.len(),
            tool_count: inner.registry.tool_count().await,
        };
        Response {
            ok: true,
            status: Some(status),
            ..Default::default()
        }
    }

    async fn handle_tools(&self, req: &Request) -> Response {
        let registry = self.registry().await;
        let server = (!req.server.is_empty()).then_some(req.server.as_str());
        match timeout(LIST_DEADLINE, registry.list_tools(server)).await {
            Ok(Ok(tools)) => Response {
                ok: true,
                tools: Some(tools),
                ..Default::default()
            },
            Ok(Err(err)) => Response::error(err),
            Err(_) => Response::error("request timed out"),
        }
    }

    async fn handle_inspect(&self, req: &Request) -> Response {
        if req.server.is_empty() || req.tool.is_empty() {
            return Response::error("server and tool are required");
        }
        let registry = self.registry().await;
        match timeout(LIST_DEADLINE, registry.inspect_tool(&req.server, &req.tool)).await {
            Ok(Ok(detail)) => Response {
                ok: true,
                tool_detail: Some(detail),
                ..Default::default()
            },
            Ok(Err(err)) => Response::error(err),
            Err(_) => Response::error("request timed out"),
        }
    }

    /// Run the call and record exactly one history row whatever happens.
    /// History write failures must not affect the call result.
    async fn handle_call(&self, req: &Request) -> Response {
        if req.server.is_empty() || req.tool.is_empty() {
            return Response::error("server and tool are required");
        }

        let registry = self.registry().await;
        let store = self.inner.read().await.store.clone();

        let at = Utc::now();
        let started = std::time::Instant::now();
        let outcome = match timeout(
            CALL_DEADLINE,
            registry.call(&req.server, &req.tool, req.args.clone()),
        )
        .await
        {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(err)) => Err(err.to_string()),
            Err(_) => Err("request timed out".to_string()),
        };

        let item = HistoryItem {
            at,
            server: req.server.clone(),
            tool: req.tool.clone(),
            args: req.args.clone(),
            success: outcome.is_ok(),
            error: outcome.as_ref().err().cloned().unwrap_or_default(),
            duration_ms: started.elapsed().as_millis() as i64,
        };
        if let Err(e) = store.insert_history(&item).await {
            warn!(error = %e, "failed to record call history");
        }

        match outcome {
            Ok(result) => Response {
                ok: true,
                result: Some(result),
                ..Default::default()
            },
            Err(message) => Response::error(message),
        }
    }

    async fn handle_history(&self, req: &Request) -> Response {
        let store = self.inner.read().await.store.clone();
        match store.list_history(&req.server, &req.tool, req.limit).await {
            Ok(history) => Response {
                ok: true,
                history: Some(history),
                ..Default::default()
            },
            Err(err) => Response::error(err),
        }
    }

    async fn handle_add_server(&self, req: &Request) -> Response {
        if req.name.is_empty() {
            return Response::error("name is required");
        }
        let transport = match Transport::normalize(&req.transport) {
            Ok(transport) => transport,
            Err(err) => return Response::error(err),
        };
        match transport {
            Transport::Stdio => {
                if req.command.is_empty() {
                    return Response::error("command is required for stdio transport");
                }
            }
            Transport::Http | Transport::Sse => {
                if req.url.is_empty() {
                    return Response::error("url is required for http/sse transport");
                }
            }
        }

        let entry = ServerEntry {
            name: req.name.clone(),
            alias: req.alias.clone(),
            url: req.url.clone(),
            transport,
            headers: req.headers.clone(),
            command: req.command.clone(),
            env: req.env.clone(),
        };

        let mut next = self.inner.read().await.config.as_ref().clone();
        next.upsert_server(entry);
        if let Err(err) = next.save(&self.config_path) {
            return Response::error(err);
        }

        self.install_config(next).await;
        self.kick_refresh().await;
        Response::text(format!("added server {}", req.name))
    }

    async fn handle_remove_server(&self, req: &Request) -> Response {
        if req.name.is_empty() {
            return Response::error("name is required");
        }

        let mut next = self.inner.read().await.config.as_ref().clone();
        if !next.remove_server(&req.name) {
            return Response::error("server not found");
        }
        if let Err(err) = next.save(&self.config_path) {
            return Response::error(err);
        }

        self.install_config(next).await;
        self.kick_refresh().await;
        Response::text(format!("removed server {}", req.name))
    }

    async fn handle_set_auth(&self, req: &Request) -> Response {
        if req.name.is_empty() {
            return Response::error("name is required");
        }

        let mut next = self.inner.read().await.config.as_ref().clone();
        let Some(entry) = next.servers.iter_mut().find(|s| s.name == req.name) else {
            return Response::error("server not found");
        };
        // Header names are stored in canonical form so a config cannot
        // accumulate both `authorization` and `Authorization` rows.
        for (key, value) in &req.headers {
            entry
                .headers
                .insert(canonical_header_name(key), value.clone());
        }

        if let Err(err) = next.save(&self.config_path) {
            return Response::error(err);
        }
        self.install_config(next).await;
        Response::text("updated authentication")
    }

    async fn handle_reload(&self) -> Response {
        let next = match mcpshim_core::config::Config::load(&self.config_path) {
            Ok(next) => next,
            Err(err) => return Response::error(err),
        };

        let current_db = self.inner.read().await.config.server.db_path.clone();
        if next.server.db_path != current_db {
            let store = match Store::open(&next.server.db_path).await {
                Ok(store) => Arc::new(store),
                Err(err) => return Response::error(err),
            };
            let config = Arc::new(next);
            let registry = Arc::new(Registry::new(
                config.clone(),
                Arc::new(StoreTokens(store.clone())),
            ));

            let old_store = {
                let mut inner = self.inner.write().await;
                let old = inner.store.clone();
                *inner = Inner {
                    config,
                    store,
                    registry,
                };
                old
            };
            // Close the displaced handle only after the new one is
            // installed.
            tokio::spawn(async move { old_store.close().await });
        } else {
            self.install_config(next).await;
        }

        self.kick_refresh().await;
        Response::text("reloaded config")
    }

    async fn handle_login(&self, req: &Request) -> Response {
        if req.server.is_empty() {
            return Response::error("server is required");
        }
        let registry = self.registry().await;
        match timeout(LOGIN_DEADLINE, registry.login(&req.server, false)).await {
            Ok(Ok(())) => Response::text(format!("oauth login completed for {}", req.server)),
            Ok(Err(err)) => Response::error(err),
            Err(_) => Response::error("request timed out"),
        }
    }

    /// Swap in a mutated config and invalidate the registry's view.
    async fn install_config(&self, next: mcpshim_core::config::Config) {
        let config = Arc::new(next);
        let mut inner = self.inner.write().await;
        inner.config = config.clone();
        inner.registry.update_config(config).await;
    }

    /// Fire a background cache rebuild; callers never wait on it.
    async fn kick_refresh(&self) {
        let registry = self.registry().await;
        tokio::spawn(async move {
            registry.refresh().await;
            debug!("post-mutation refresh complete");
        });
    }
}
