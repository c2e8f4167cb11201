//! MCP client core for mcpshim.
//!
//! Turns high-level operations (list, inspect, call, login) into
//! single-use MCP sessions across three transports, with an OAuth
//! fallback that detects unauthorized responses, runs an
//! authorization-code + PKCE flow, and transparently retries.
//!
//! # Architecture
//!
//! ```text
//! Registry ──► session runner ──► transport (http | sse | stdio)
//!    │               │
//!    ▼               ▼
//! tool cache    OAuth engine ──► token store (trait)
//!                    │
//!                    └► loopback callback server
//! ```
//!
//! Every operation builds, uses, and releases a fresh client; nothing
//! retains a live session between operations.

pub mod callback;
mod client;
mod error;
pub mod http;
pub mod oauth;
pub mod protocol;
pub mod registry;
pub mod schema;
pub mod sse;
pub mod stdio;
pub mod token;
mod transport;

pub use callback::CallbackServer;
pub use client::{new_client, run_operation, run_with_client, McpClient};
pub use error::{McpError, McpResult};
pub use oauth::{
    run_oauth_login, run_with_oauth_fallback, should_try_oauth_fallback, FALLBACK_REDIRECT_URI,
};
pub use registry::Registry;
pub use schema::{parse_schema, parse_schema_detail};
pub use token::{MemoryTokenStore, Token, TokenStore, TokenStoreProvider};
pub use transport::{BearerSource, Transport};
