//! MCP error types.

use thiserror::Error;

/// Result type for MCP operations.
pub type McpResult<T> = Result<T, McpError>;

/// Errors that can occur while talking to MCP servers.
#[derive(Debug, Error)]
pub enum McpError {
    /// No configured server matches the given name or alias.
    #[error("unknown server {0:?}")]
    UnknownServer(String),

    /// The server does not expose the requested tool.
    #[error("tool {tool:?} not found on server {server:?}")]
    ToolNotFound { server: String, tool: String },

    /// A stdio server was configured without a command.
    #[error("no command configured for server {0:?}")]
    NoCommand(String),

    /// OAuth login was requested for a stdio server.
    #[error("server {0:?} uses stdio transport and does not support oauth login")]
    StdioLogin(String),

    /// The server rejected the request as unauthorized. This is the
    /// sentinel the OAuth fallback keys on.
    #[error("server returned 401 unauthorized")]
    Unauthorized,

    /// Authorization is required but the caller cannot run the
    /// interactive flow.
    #[error("server {0:?} requires oauth authorization; run a direct command like `mcpshim tools --server {0}` to complete login")]
    AuthorizationRequired(String),

    /// The callback's state parameter did not match.
    #[error("oauth state mismatch")]
    StateMismatch,

    /// The authorization server reported an error.
    #[error("oauth authorization failed: {0}")]
    AuthorizationFailed(String),

    /// The callback carried no authorization code.
    #[error("oauth authorization did not return a code")]
    MissingCode,

    /// Any other OAuth-layer failure.
    #[error("oauth error: {0}")]
    OAuth(String),

    /// No token is stored for this server.
    #[error("no stored oauth token")]
    NoToken,

    /// The token store failed.
    #[error("token store error: {0}")]
    TokenStore(String),

    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("request timed out")]
    Timeout,

    #[error("tool execution failed: {0}")]
    Tool(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl McpError {
    /// Create a connection failed error.
    pub fn connection_failed(message: impl Into<String>) -> Self {
        Self::ConnectionFailed(message.into())
    }

    /// Create a protocol error.
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }

    /// True when this is the unauthorized sentinel.
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Self::Unauthorized)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unauthorized_is_the_sentinel() {
        assert!(McpError::Unauthorized.is_unauthorized());
        assert!(!McpError::Timeout.is_unauthorized());
        assert!(!McpError::OAuth("nope".to_string()).is_unauthorized());
    }

    #[test]
    fn error_messages() {
        assert_eq!(
            McpError::UnknownServer("x".to_string()).to_string(),
            "unknown server \"x\""
        );
        assert_eq!(
            McpError::ToolNotFound {
                server: "notion".to_string(),
                tool: "search".to_string()
            }
            .to_string(),
            "tool \"search\" not found on server \"notion\""
        );
        assert_eq!(
            McpError::StateMismatch.to_string(),
            "oauth state mismatch"
        );
        assert_eq!(
            McpError::MissingCode.to_string(),
            "oauth authorization did not return a code"
        );
        assert!(McpError::StdioLogin("local".to_string())
            .to_string()
            .contains("stdio"));
    }
}
