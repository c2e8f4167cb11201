//! Daemon supervisor: socket lifecycle, signals, and the refresh ticker.

use chrono::{DateTime, Utc};
use mcpshim_core::config::{Config, ConfigError};
use mcpshim_mcp::Registry;
use mcpshim_store::{Store, StoreError, StoreTokens};
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{watch, RwLock};
use tracing::{debug, info, warn};

use mcpshim_core::protocol::{Request, Response};

/// How often the background refresh rebuilds the tool cache.
const REFRESH_INTERVAL: std::time::Duration = std::time::Duration::from_secs(2 * 60);

/// Errors fatal to the daemon.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub(crate) struct Inner {
    pub(crate) config: Arc<Config>,
    pub(crate) store: Arc<Store>,
    pub(crate) registry: Arc<Registry>,
}

/// The daemon: owns the process-scoped store handle, the registry, and the
/// listening socket.
pub struct Server {
    pub(crate) config_path: PathBuf,
    pub(crate) started_at: DateTime<Utc>,
    pub(crate) inner: RwLock<Inner>,
}

impl Server {
    /// Open the store at the configured path and assemble the daemon.
    pub async fn new(config_path: PathBuf, config: Config) -> Result<Self, ServerError> {
        let store = Arc::new(Store::open(&config.server.db_path).await?);
        Ok(Self::with_store(config_path, config, store))
    }

    pub(crate) fn with_store(config_path: PathBuf, config: Config, store: Arc<Store>) -> Self {
        let config = Arc::new(config);
        let registry = Arc::new(Registry::new(
            config.clone(),
            Arc::new(StoreTokens(store.clone())),
        ));
        Self {
            config_path,
            started_at: Utc::now(),
            inner: RwLock::new(Inner {
                config,
                store,
                registry,
            }),
        }
    }

    pub(crate) async fn registry(&self) -> Arc<Registry> {
        self.inner.read().await.registry.clone()
    }

    /// Bind the socket and serve until SIGTERM or SIGINT.
    pub async fn run(self: Arc<Self>) -> Result<(), ServerError> {
        let socket_path = self.inner.read().await.config.server.socket_path.clone();

        if let Some(parent) = socket_path.parent() {
            if !parent.as_os_str().is_empty() {
                use std::os::unix::fs::DirBuilderExt;
                std::fs::DirBuilder::new()
                    .recursive(true)
                    .mode(0o755)
                    .create(parent)?;
            }
        }
        // A previous run may have left its socket behind.
        let _ = std::fs::remove_file(&socket_path);

        let listener = UnixListener::bind(&socket_path)?;
        std::fs::set_permissions(&socket_path, std::fs::Permissions::from_mode(0o600))?;
        info!(socket = %socket_path.display(), "mcpshimd listening");

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let ticker = tokio::spawn(refresh_loop(self.clone(), shutdown_rx));

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, _)) => {
                            let server = self.clone();
                            tokio::spawn(async move {
                                server.handle_conn(stream).await;
                            });
                        }
                        Err(e) => {
                            debug!(error = %e, "accept error");
                        }
                    }
                }
                _ = sigterm.recv() => {
                    info!("received SIGTERM, shutting down");
                    break;
                }
                _ = sigint.recv() => {
                    info!("received SIGINT, shutting down");
                    break;
                }
            }
        }

        let _ = shutdown_tx.send(true);
        let _ = ticker.await;
        self.inner.read().await.store.close().await;
        let _ = std::fs::remove_file(&socket_path);
        Ok(())
    }

    /// One request, one response, close.
    async fn handle_conn(&self, stream: UnixStream) {
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        let mut line = String::new();
        let response = match reader.read_line(&mut line).await {
            Ok(0) => return,
            Ok(_) => match serde_json::from_str::<Request>(&line) {
                Ok(request) => self.handle(request).await,
                Err(e) => Response::error(e),
            },
            Err(e) => Response::error(e),
        };

        match serde_json::to_vec(&response) {
            Ok(mut payload) => {
                payload.push(b'\n');
                if let Err(e) = write_half.write_all(&payload).await {
                    debug!(error = %e, "failed to write response");
                }
            }
            Err(e) => warn!(error = %e, "failed to encode response"),
        }
    }
}

/// Drive periodic cache refreshes. The first tick fires immediately so the
/// daemon comes up with a warm cache.
async fn refresh_loop(server: Arc<Server>, mut shutdown: watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(REFRESH_INTERVAL);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                let registry = server.registry().await;
                registry.refresh().await;
                let tool_count = registry.tool_count().await;
                debug!(tools = tool_count, "tool cache refreshed");
            }
            _ = shutdown.changed() => break,
        }
    }
}
