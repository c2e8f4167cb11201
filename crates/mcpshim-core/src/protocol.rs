//! Wire protocol for the daemon's unix socket.
//!
//! One JSON request per connection, one JSON response back, newline
//! terminated on both sides. Responses always carry `ok`; failures carry a
//! single-line `error` and at most one payload field is ever populated.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Request action. Unknown strings decode to [`Action::Unknown`] so the
/// router can answer with a proper error envelope instead of a decode
/// failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Status,
    Servers,
    Tools,
    Inspect,
    Call,
    History,
    AddServer,
    RemoveServer,
    SetAuth,
    Reload,
    Login,
    #[serde(other)]
    Unknown,
}

/// A single request over the socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub action: Action,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub server: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub tool: String,

    #[serde(default, skip_serializing_if = "is_zero")]
    pub limit: i64,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub alias: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub url: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub transport: String,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Map<String, Value>>,
}

impl Request {
    pub fn new(action: Action) -> Self {
        Self {
            action,
            name: String::new(),
            server: String::new(),
            tool: String::new(),
            limit: 0,
            alias: String::new(),
            url: String::new(),
            transport: String::new(),
            headers: BTreeMap::new(),
            command: Vec::new(),
            env: Vec::new(),
            args: None,
        }
    }
}

fn is_zero(value: &i64) -> bool {
    *value == 0
}

/// A configured server as reported by the `servers` action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerInfo {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub alias: String,
    pub url: String,
    pub transport: String,
    pub has_auth: bool,
}

/// A tool summary derived from a `tools/list` response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolInfo {
    pub server: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub properties: Vec<String>,
}

/// Per-property schema detail for `inspect`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyDetail {
    pub name: String,
    #[serde(rename = "type", default, skip_serializing_if = "String::is_empty")]
    pub kind: String,
    #[serde(rename = "enum", default, skip_serializing_if = "Vec::is_empty")]
    pub choices: Vec<String>,
    #[serde(rename = "const", default, skip_serializing_if = "String::is_empty")]
    pub constant: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    pub required: bool,
}

/// Expanded tool description for `inspect`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolDetail {
    pub server: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub properties: Vec<PropertyDetail>,
}

/// Daemon status snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusInfo {
    pub started_at: DateTime<Utc>,
    pub uptime_sec: i64,
    pub server_count: usize,
    pub tool_count: usize,
}

/// One recorded tool invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryItem {
    pub at: DateTime<Utc>,
    pub server: String,
    pub tool: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Map<String, Value>>,
    pub success: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
    pub duration_ms: i64,
}

/// A single response over the socket.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Response {
    pub ok: bool,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<StatusInfo>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub servers: Option<Vec<ServerInfo>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<ToolInfo>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub history: Option<Vec<HistoryItem>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_detail: Option<ToolDetail>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

impl Response {
    /// A bare success envelope.
    pub fn ok() -> Self {
        Self {
            ok: true,
            ..Default::default()
        }
    }

    /// A success envelope with a human-readable message.
    pub fn text(message: impl Into<String>) -> Self {
        Self {
            ok: true,
            text: Some(message.into()),
            ..Default::default()
        }
    }

    /// A failure envelope. The message is flattened to a single line.
    pub fn error(message: impl std::fmt::Display) -> Self {
        Self {
            ok: false,
            error: message.to_string().replace('\n', " "),
            ..Default::default()
        }
    }
}
