//! The mcpshim daemon: a unix-socket IPC router in front of the MCP
//! registry, plus the supervisor that owns the listener, signal handling,
//! and the periodic tool-cache refresh.

mod router;
mod server;

pub use server::{Server, ServerError};
