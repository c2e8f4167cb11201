//! Core types shared by the mcpshim daemon and CLI.
//!
//! This crate holds the two things every other crate needs: the YAML
//! configuration model (server descriptors, defaults, atomic persistence)
//! and the JSON wire protocol spoken over the daemon's unix socket.

pub mod config;
pub mod protocol;

pub use config::{Config, ConfigError, DaemonConfig, ServerEntry, Transport};
pub use protocol::{
    Action, HistoryItem, PropertyDetail, Request, Response, ServerInfo, StatusInfo, ToolDetail,
    ToolInfo,
};
