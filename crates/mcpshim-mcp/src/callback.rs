//! Loopback HTTP server for the OAuth authorization callback.
//!
//! Binds an ephemeral port on 127.0.0.1, serves `/oauth/callback` once,
//! and hands the redirect's query parameters to the waiting flow over a
//! single-slot channel.

use crate::error::{McpError, McpResult};
use std::collections::HashMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

const CALLBACK_PATH: &str = "/oauth/callback";
const SHUTDOWN_GRACE_SECS: u64 = 3;

const HTML_COMPLETE: &str = "<html><body><h1>Authorization complete</h1><p>You can close this window.</p><script>window.close();</script></body></html>";

/// One-shot OAuth callback server.
pub struct CallbackServer {
    redirect_uri: String,
    params_rx: Mutex<mpsc::Receiver<HashMap<String, String>>>,
    shutdown_tx: Mutex<Option<oneshot::Sender<()>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl CallbackServer {
    /// Bind 127.0.0.1 on an ephemeral port and start serving.
    pub async fn bind() -> McpResult<Self> {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.map_err(|e| {
            McpError::connection_failed(format!("failed to bind oauth callback server: {e}"))
        })?;
        let addr = listener.local_addr()?;
        let redirect_uri = format!("http://{addr}{CALLBACK_PATH}");
        debug!(%redirect_uri, "oauth callback server listening");

        let (params_tx, params_rx) = mpsc::channel(1);
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, _)) => {
                                if let Err(e) = handle_connection(stream, &params_tx).await {
                                    warn!(error = %e, "error handling oauth callback");
                                }
                            }
                            Err(e) => {
                                warn!(error = %e, "oauth callback accept error");
                                break;
                            }
                        }
                    }
                    _ = &mut shutdown_rx => {
                        debug!("oauth callback server shutting down");
                        break;
                    }
                }
            }
        });

        Ok(Self {
            redirect_uri,
            params_rx: Mutex::new(params_rx),
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            task: Mutex::new(Some(task)),
        })
    }

    /// The redirect URI registered with the authorization server.
    pub fn redirect_uri(&self) -> &str {
        &self.redirect_uri
    }

    /// Wait for the redirect's query parameters. The caller bounds this
    /// with its own timeout.
    pub async fn wait(&self) -> McpResult<HashMap<String, String>> {
        self.params_rx
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| McpError::OAuth("oauth callback server closed".to_string()))
    }

    /// Stop serving, allowing up to three seconds for the accept loop to
    /// drain before aborting it.
    pub async fn close(&self) {
        if let Some(tx) = self.shutdown_tx.lock().await.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.lock().await.take() {
            let grace = std::time::Duration::from_secs(SHUTDOWN_GRACE_SECS);
            let abort = task.abort_handle();
            if tokio::time::timeout(grace, task).await.is_err() {
                warn!("oauth callback server did not stop in time");
                abort.abort();
            }
        }
    }
}

impl Drop for CallbackServer {
    fn drop(&mut self) {
        // Backstop: the flow closes explicitly, but a dropped server must
        // not leave the accept loop running.
        if let Ok(mut guard) = self.task.try_lock() {
            if let Some(task) = guard.take() {
                task.abort();
            }
        }
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    params_tx: &mpsc::Sender<HashMap<String, String>>,
) -> McpResult<()> {
    let mut buffer = [0u8; 4096];
    let n = stream
        .read(&mut buffer)
        .await
        .map_err(|e| McpError::protocol(format!("failed to read callback request: {e}")))?;
    let request = String::from_utf8_lossy(&buffer[..n]);

    let first_line = request.lines().next().unwrap_or("");
    let mut parts = first_line.split_whitespace();
    let (_method, path) = match (parts.next(), parts.next()) {
        (Some(method), Some(path)) => (method, path),
        _ => {
            write_response(&mut stream, 400, "text/plain", "Bad Request").await;
            return Ok(());
        }
    };

    let parsed = match url::Url::parse(&format!("http://127.0.0.1{path}")) {
        Ok(parsed) => parsed,
        Err(_) => {
            write_response(&mut stream, 400, "text/plain", "Invalid URL").await;
            return Ok(());
        }
    };

    if parsed.path() != CALLBACK_PATH {
        write_response(&mut stream, 404, "text/plain", "Not Found").await;
        return Ok(());
    }

    let params: HashMap<String, String> = parsed
        .query_pairs()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    debug!(
        has_code = params.contains_key("code"),
        has_error = params.contains_key("error"),
        "received oauth callback"
    );

    // Single-slot: a second hit on the callback is dropped.
    let _ = params_tx.try_send(params);

    write_response(&mut stream, 200, "text/html; charset=utf-8", HTML_COMPLETE).await;
    Ok(())
}

async fn write_response(stream: &mut TcpStream, status: u16, content_type: &str, body: &str) {
    let status_text = match status {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        _ => "Unknown",
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

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn redirect_uri_points_at_loopback() {
        let server = CallbackServer::bind().await.unwrap();
        assert!(server.redirect_uri().starts_with("http://127.0.0.1:"));
        assert!(server.redirect_uri().ends_with("/oauth/callback"));
        server.close().await;
    }

    #[tokio::test]
    async fn callback_delivers_query_params() {
        let server = CallbackServer::bind().await.unwrap();
        let uri = format!("{}?code=xyz&state=abc", server.redirect_uri());

        let body = reqwest::get(&uri).await.unwrap().text().await.unwrap();
        assert!(body.contains("Authorization complete"));

        let params = server.wait().await.unwrap();
        assert_eq!(params.get("code").map(String::as_str), Some("xyz"));
        assert_eq!(params.get("state").map(String::as_str), Some("abc"));
        server.close().await;
    }

    #[tokio::test]
    async fn wrong_path_is_not_found() {
        let server = CallbackServer::bind().await.unwrap();
        let uri = server.redirect_uri().replace("/oauth/callback", "/nope");
        let status = reqwest::get(&uri).await.unwrap().status();
        assert_eq!(status.as_u16(), 404);
        server.close().await;
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let server = CallbackServer::bind().await.unwrap();
        server.close().await;
        server.close().await;
    }
}
