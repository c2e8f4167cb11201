//! Configuration model for mcpshim.
//!
//! The daemon and CLI share one YAML config file describing the daemon's
//! socket/database paths and the set of MCP servers to front. Values are
//! expanded with `$VAR` / `${VAR}` environment references at load time, and
//! every save goes through a write-temp / re-validate / rename cycle so a
//! half-written file can never clobber a good one.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io::Write;
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors produced while loading, validating, or saving configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unsupported transport {0:?} (expected http, sse, or stdio)")]
    UnsupportedTransport(String),

    #[error("server name is required")]
    MissingName,

    #[error("server {0:?}: url is required")]
    MissingUrl(String),

    #[error("server {0:?}: command is required for stdio transport")]
    MissingCommand(String),

    #[error("duplicate server name {0:?}")]
    DuplicateName(String),

    #[error("duplicate alias {0:?}")]
    DuplicateAlias(String),

    #[error("resulting config is invalid: {0}")]
    InvalidResult(#[source] Box<ConfigError>),

    #[error("parse config: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// How the daemon reaches an MCP server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Transport {
    /// Streamable HTTP (the default).
    #[default]
    Http,
    /// HTTP + server-sent events.
    Sse,
    /// Local subprocess over stdio.
    Stdio,
}

impl Transport {
    /// Normalize a user-supplied transport string.
    ///
    /// Accepts the aliases `streamable-http` and the empty string for
    /// [`Transport::Http`]; case and surrounding whitespace are ignored.
    pub fn normalize(value: &str) -> Result<Self, ConfigError> {
        match value.trim().to_ascii_lowercase().as_str() {
            "" | "http" | "streamable-http" => Ok(Self::Http),
            "sse" => Ok(Self::Sse),
            "stdio" => Ok(Self::Stdio),
            _ => Err(ConfigError::UnsupportedTransport(value.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Sse => "sse",
            Self::Stdio => "stdio",
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<String> for Transport {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::normalize(&value)
    }
}

impl From<Transport> for String {
    fn from(value: Transport) -> Self {
        value.as_str().to_string()
    }
}

/// Daemon-level settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DaemonConfig {
    /// Unix socket the daemon listens on.
    #[serde(default)]
    pub socket_path: PathBuf,

    /// SQLite database holding call history and OAuth tokens.
    #[serde(default)]
    pub db_path: PathBuf,
}

/// One configured MCP server.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerEntry {
    /// Unique identifier.
    pub name: String,

    /// Unique short name; defaults to `name`.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub alias: String,

    /// Endpoint URL (http/sse transports).
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub url: String,

    #[serde(default)]
    pub transport: Transport,

    /// Static request headers; values undergo env expansion at load time.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,

    /// Command and arguments (stdio transport).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,

    /// Extra environment in `KEY=VALUE` form (stdio transport).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<String>,
}

impl ServerEntry {
    /// True when a static header with the canonical name `Authorization`
    /// is configured.
    pub fn has_authorization_header(&self) -> bool {
        self.headers
            .keys()
            .any(|key| key.eq_ignore_ascii_case("authorization"))
    }
}

/// The full configuration file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub server: DaemonConfig,

    #[serde(default)]
    pub servers: Vec<ServerEntry>,
}

impl Config {
    /// Load and validate a config file.
    ///
    /// Fills in default paths and aliases, expands environment references,
    /// and normalizes transports before validation.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let data = fs::read_to_string(path)?;
        let mut cfg: Config = serde_yaml::from_str(&data)?;
        cfg.finalize();
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load a config file, creating it with defaults when it is missing.
    pub fn load_or_init(path: &Path) -> Result<Self, ConfigError> {
        match Self::load(path) {
            Ok(cfg) => Ok(cfg),
            Err(ConfigError::Io(err)) if err.kind() == std::io::ErrorKind::NotFound => {
                let cfg = Config {
                    server: DaemonConfig {
                        socket_path: default_socket_path(),
                        db_path: default_db_path(),
                    },
                    servers: Vec::new(),
                };
                cfg.save(path)?;
                Ok(cfg)
            }
            Err(err) => Err(err),
        }
    }

    /// Persist the config atomically: validate, write `<path>.tmp`, fsync,
    /// re-load the temp file, then rename over the original. A failed
    /// validation of the temp file leaves the original untouched.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        self.validate()?;

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::DirBuilder::new()
                    .recursive(true)
                    .mode(0o700)
                    .create(parent)?;
            }
        }

        let data = serde_yaml::to_string(self)?;
        let tmp = tmp_path(path);
        {
            let mut file = fs::OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .mode(0o600)
                .open(&tmp)?;
            file.write_all(data.as_bytes())?;
            file.sync_all()?;
        }

        if let Err(err) = Self::load(&tmp) {
            let _ = fs::remove_file(&tmp);
            return Err(ConfigError::InvalidResult(Box::new(err)));
        }
        if let Err(err) = fs::rename(&tmp, path) {
            let _ = fs::remove_file(&tmp);
            return Err(err.into());
        }
        Ok(())
    }

    /// Resolve a server by name or alias.
    pub fn find_server(&self, name_or_alias: &str) -> Option<&ServerEntry> {
        self.servers
            .iter()
            .find(|s| s.name == name_or_alias || s.alias == name_or_alias)
    }

    /// Insert or replace a server entry, keyed by name. The entry's alias
    /// is defaulted to its name when empty.
    pub fn upsert_server(&mut self, mut entry: ServerEntry) {
        if entry.alias.is_empty() {
            entry.alias = entry.name.clone();
        }
        if let Some(existing) = self.servers.iter_mut().find(|s| s.name == entry.name) {
            *existing = entry;
        } else {
            self.servers.push(entry);
        }
    }

    /// Remove a server by name. Returns whether anything was removed.
    pub fn remove_server(&mut self, name: &str) -> bool {
        let before = self.servers.len();
        self.servers.retain(|s| s.name != name);
        self.servers.len() != before
    }

    /// Check structural invariants: unique names and aliases, a URL for
    /// every http/sse server, a command for every stdio server.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut names = std::collections::HashSet::new();
        let mut aliases = std::collections::HashSet::new();
        for entry in &self.servers {
            if entry.name.is_empty() {
                return Err(ConfigError::MissingName);
            }
            match entry.transport {
                Transport::Stdio => {
                    if entry.command.is_empty() {
                        return Err(ConfigError::MissingCommand(entry.name.clone()));
                    }
                }
                Transport::Http | Transport::Sse => {
                    if entry.url.is_empty() {
                        return Err(ConfigError::MissingUrl(entry.name.clone()));
                    }
                }
            }
            if !names.insert(entry.name.clone()) {
                return Err(ConfigError::DuplicateName(entry.name.clone()));
            }
            let alias = if entry.alias.is_empty() {
                entry.name.clone()
            } else {
                entry.alias.clone()
            };
            if !aliases.insert(alias.clone()) {
                return Err(ConfigError::DuplicateAlias(alias));
            }
        }
        Ok(())
    }

    fn finalize(&mut self) {
        if self.server.socket_path.as_os_str().is_empty() {
            self.server.socket_path = default_socket_path();
        }
        if self.server.db_path.as_os_str().is_empty() {
            self.server.db_path = default_db_path();
        }
        for entry in &mut self.servers {
            entry.url = expand_env(&entry.url);
            for value in entry.headers.values_mut() {
                *value = expand_env(value);
            }
            for item in &mut entry.command {
                *item = expand_env(item);
            }
            for item in &mut entry.env {
                *item = expand_env(item);
            }
            if entry.alias.is_empty() {
                entry.alias = entry.name.clone();
            }
        }
    }
}

/// Expand `$VAR` / `${VAR}` references; unset variables expand to the
/// empty string.
fn expand_env(value: &str) -> String {
    shellexpand::env_with_context_no_errors(value, |var| {
        Some(std::env::var(var).unwrap_or_default())
    })
    .into_owned()
}

/// Canonicalize an HTTP header name (`authorization` -> `Authorization`,
/// `x-api-key` -> `X-Api-Key`).
pub fn canonical_header_name(name: &str) -> String {
    name.split('-')
        .map(|segment| {
            let mut chars = segment.chars();
            match chars.next() {
                Some(first) => {
                    first.to_ascii_uppercase().to_string()
                        + &chars.as_str().to_ascii_lowercase()
                }
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join("-")
}

/// Default config file path: `$MCPSHIM_CONFIG`, or
/// `$XDG_CONFIG_HOME/mcpshim/config.yaml`.
pub fn default_config_path() -> PathBuf {
    if let Some(path) = non_empty_env("MCPSHIM_CONFIG") {
        return PathBuf::from(path);
    }
    xdg_config_home().join("mcpshim").join("config.yaml")
}

/// Default socket path: `$XDG_RUNTIME_DIR/mcpshim.sock`, falling back to
/// `/tmp/mcpshim-<uid>.sock`.
pub fn default_socket_path() -> PathBuf {
    if let Some(dir) = non_empty_env("XDG_RUNTIME_DIR") {
        return PathBuf::from(dir).join("mcpshim.sock");
    }
    PathBuf::from(format!("/tmp/mcpshim-{}.sock", uid()))
}

/// Default database path: `$XDG_DATA_HOME/mcpshim/mcpshim.db`, falling back
/// to `~/.local/share/mcpshim/mcpshim.db`.
pub fn default_db_path() -> PathBuf {
    if let Some(dir) = non_empty_env("XDG_DATA_HOME") {
        return PathBuf::from(dir).join("mcpshim").join("mcpshim.db");
    }
    home_dir()
        .join(".local")
        .join("share")
        .join("mcpshim")
        .join("mcpshim.db")
}

fn xdg_config_home() -> PathBuf {
    if let Some(dir) = non_empty_env("XDG_CONFIG_HOME") {
        return PathBuf::from(dir);
    }
    home_dir().join(".config")
}

fn home_dir() -> PathBuf {
    if let Some(home) = non_empty_env("HOME") {
        return PathBuf::from(home);
    }
    dirs::home_dir().unwrap_or_else(|| PathBuf::from(format!("/tmp/mcpshim-{}", uid())))
}

fn non_empty_env(name: &str) -> Option<String> {
    match std::env::var(name) {
        Ok(value) if !value.trim().is_empty() => Some(value.trim().to_string()),
        _ => None,
    }
}

fn uid() -> u32 {
    // SAFETY: getuid has no failure modes and touches no memory.
    unsafe { libc::getuid() }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(".tmp");
    PathBuf::from(os)
}
