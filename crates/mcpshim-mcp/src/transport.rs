//! MCP transport abstraction.

use crate::error::McpResult;
use crate::protocol::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};
use async_trait::async_trait;

/// Transport trait for MCP communication.
///
/// Implementations must surface an HTTP 401 (or equivalent) as
/// [`crate::McpError::Unauthorized`] so the OAuth fallback can key on it.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a request and wait for the matching response.
    async fn request(&self, request: JsonRpcRequest) -> McpResult<JsonRpcResponse>;

    /// Send a notification (no response expected).
    async fn notify(&self, notification: JsonRpcNotification) -> McpResult<()>;

    /// Close the transport, releasing any held resources.
    async fn close(&self) -> McpResult<()>;
}

/// Supplies the bearer token attached to outgoing HTTP requests.
///
/// The OAuth engine implements this over the persisted token store;
/// `Ok(None)` sends the request bare so the server's 401 surfaces as the
/// unauthorized sentinel.
#[async_trait]
pub trait BearerSource: Send + Sync {
    async fn bearer(&self) -> McpResult<Option<String>>;
}
