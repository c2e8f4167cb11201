//! SQLite persistence for mcpshim.
//!
//! Two tables: append-only call history and one OAuth token row per
//! server. The store is process-scoped; `reload` swaps it wholesale when
//! the database path changes.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use mcpshim_core::protocol::HistoryItem;
use mcpshim_mcp::{McpError, McpResult, Token, TokenStore, TokenStoreProvider};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqliteRow};
use sqlx::Row;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// History listing bounds.
const HISTORY_DEFAULT_LIMIT: i64 = 50;
const HISTORY_MAX_LIMIT: i64 = 500;

/// Errors from the persistence layer.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("encode/decode error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Handle to the mcpshim database.
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (creating if needed) the database at `path` and ensure the
    /// schema exists. The parent directory is created with mode 0700.
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                use std::os::unix::fs::DirBuilderExt;
                std::fs::DirBuilder::new()
                    .recursive(true)
                    .mode(0o700)
                    .create(parent)?;
            }
        }

        let pool = SqlitePool::connect_with(
            SqliteConnectOptions::new()
                .filename(path)
                .create_if_missing(true),
        )
        .await?;

        let store = Self { pool };
        store.init_schema().await?;
        debug!(path = %path.display(), "opened sqlite store");
        Ok(store)
    }

    /// Open an in-memory database with the full schema. Used by tests.
    ///
    /// In-memory SQLite is per-connection, so the pool is pinned to a
    /// single connection that never retires.
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    /// Close the underlying pool. Safe to call while another handle is
    /// already installed.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn init_schema(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS call_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                at_utc TEXT NOT NULL,
                server TEXT NOT NULL,
                tool TEXT NOT NULL,
                args_json TEXT,
                success INTEGER NOT NULL,
                error TEXT,
                duration_ms INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_call_history_at ON call_history(at_utc, id)",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_call_history_server_at ON call_history(server, at_utc, id)",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_call_history_server_tool_at ON call_history(server, tool, at_utc, id)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS oauth_tokens (
                server TEXT PRIMARY KEY,
                token_json TEXT NOT NULL,
                updated_at_utc TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Append one history row.
    pub async fn insert_history(&self, item: &HistoryItem) -> Result<(), StoreError> {
        let args_json = match &item.args {
            Some(args) if !args.is_empty() => serde_json::to_string(args)?,
            _ => String::new(),
        };

        sqlx::query(
            r#"
            INSERT INTO call_history (at_utc, server, tool, args_json, success, error, duration_ms)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(item.at.to_rfc3339_opts(SecondsFormat::Nanos, true))
        .bind(&item.server)
        .bind(&item.tool)
        .bind(args_json)
        .bind(i64::from(item.success))
        .bind(&item.error)
        .bind(item.duration_ms)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// List history most-recent-first, optionally filtered by server and
    /// tool. The limit is clamped into `[1, 500]`; zero or negative means
    /// the default of 50.
    pub async fn list_history(
        &self,
        server: &str,
        tool: &str,
        limit: i64,
    ) -> Result<Vec<HistoryItem>, StoreError> {
        let limit = clamp_limit(limit);

        let mut query = String::from(
            "SELECT at_utc, server, tool, args_json, success, error, duration_ms FROM call_history",
        );
        let mut filters = Vec::new();
        if !server.is_empty() {
            filters.push("server = ?");
        }
        if !tool.is_empty() {
            filters.push("tool = ?");
        }
        if !filters.is_empty() {
            query.push_str(" WHERE ");
            query.push_str(&filters.join(" AND "));
        }
        query.push_str(" ORDER BY id DESC LIMIT ?");

        let mut q = sqlx::query(&query);
        if !server.is_empty() {
            q = q.bind(server);
        }
        if !tool.is_empty() {
            q = q.bind(tool);
        }
        q = q.bind(limit);

        let rows = q.fetch_all(&self.pool).await?;
        Ok(rows.iter().map(row_to_history).collect())
    }

    /// Fetch the token row for a server. An empty access token is treated
    /// as absent.
    pub async fn get_token(&self, server: &str) -> Result<Option<Token>, StoreError> {
        let row = sqlx::query("SELECT token_json FROM oauth_tokens WHERE server = ?")
            .bind(server)
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let token_json: String = row.get(0);
        let token: Token = serde_json::from_str(&token_json)?;
        if token.access_token.is_empty() {
            return Ok(None);
        }
        Ok(Some(token))
    }

    /// Upsert the token row for a server, stamping the update time.
    pub async fn save_token(&self, server: &str, token: &Token) -> Result<(), StoreError> {
        let token_json = serde_json::to_string(token)?;
        sqlx::query(
            r#"
            INSERT INTO oauth_tokens (server, token_json, updated_at_utc)
            VALUES (?, ?, ?)
            ON CONFLICT(server) DO UPDATE SET
                token_json = excluded.token_json,
                updated_at_utc = excluded.updated_at_utc
            "#,
        )
        .bind(server)
        .bind(token_json)
        .bind(Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true))
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn clamp_limit(limit: i64) -> i64 {
    if limit <= 0 {
        HISTORY_DEFAULT_LIMIT
    } else {
        limit.min(HISTORY_MAX_LIMIT)
    }
}

fn row_to_history(row: &SqliteRow) -> HistoryItem {
    let at_utc: String = row.get("at_utc");
    let at = DateTime::parse_from_rfc3339(&at_utc)
        .map(|at| at.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now());

    let args_json: String = row.get::<Option<String>, _>("args_json").unwrap_or_default();
    let args = if args_json.is_empty() {
        None
    } else {
        serde_json::from_str(&args_json).ok()
    };

    HistoryItem {
        at,
        server: row.get("server"),
        tool: row.get("tool"),
        args,
        success: row.get::<i64, _>("success") == 1,
        error: row.get::<Option<String>, _>("error").unwrap_or_default(),
        duration_ms: row.get("duration_ms"),
    }
}

/// Per-server token store over the shared database handle.
pub struct SqliteTokenStore {
    store: Arc<Store>,
    server: String,
}

#[async_trait]
impl TokenStore for SqliteTokenStore {
    async fn get(&self) -> McpResult<Token> {
        match self.store.get_token(&self.server).await {
            Ok(Some(token)) => Ok(token),
            Ok(None) => Err(McpError::NoToken),
            Err(err) => Err(McpError::TokenStore(err.to_string())),
        }
    }

    async fn save(&self, token: &Token) -> McpResult<()> {
        self.store
            .save_token(&self.server, token)
            .await
            .map_err(|err| McpError::TokenStore(err.to_string()))
    }
}

/// Token-store provider handed to the registry.
pub struct StoreTokens(pub Arc<Store>);

impl TokenStoreProvider for StoreTokens {
    fn token_store(&self, server: &str) -> Arc<dyn TokenStore> {
        Arc::new(SqliteTokenStore {
            store: self.0.clone(),
            server: server.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn history_item(server: &str, tool: &str, success: bool) -> HistoryItem {
        HistoryItem {
            at: Utc::now(),
            server: server.to_string(),
            tool: tool.to_string(),
            args: None,
            success,
            error: if success { String::new() } else { "boom".to_string() },
            duration_ms: 12,
        }
    }

    #[tokio::test]
    async fn history_round_trip() {
        let store = Store::open_in_memory().await.unwrap();

        let mut item = history_item("notion", "search", true);
        let mut args = serde_json::Map::new();
        args.insert("query".to_string(), json!("roadmap"));
        item.args = Some(args);
        store.insert_history(&item).await.unwrap();

        let listed = store.list_history("", "", 10).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].server, "notion");
        assert_eq!(listed[0].tool, "search");
        assert!(listed[0].success);
        assert_eq!(listed[0].args.as_ref().unwrap()["query"], "roadmap");
        assert_eq!(listed[0].duration_ms, 12);
    }

    #[tokio::test]
    async fn history_is_most_recent_first() {
        let store = Store::open_in_memory().await.unwrap();
        for i in 0..5 {
            store
                .insert_history(&history_item("s", &format!("tool{i}"), true))
                .await
                .unwrap();
        }
        let listed = store.list_history("", "", 10).await.unwrap();
        assert_eq!(listed[0].tool, "tool4");
        assert_eq!(listed[4].tool, "tool0");
    }

    #[tokio::test]
    async fn history_limit_is_clamped() {
        let store = Store::open_in_memory().await.unwrap();
        for i in 0..600 {
            store
                .insert_history(&history_item("s", &format!("tool{i}"), true))
                .await
                .unwrap();
        }

        let listed = store.list_history("", "", 700).await.unwrap();
        assert_eq!(listed.len(), 500);

        let defaulted = store.list_history("", "", 0).await.unwrap();
        assert_eq!(defaulted.len(), 50);

        let negative = store.list_history("", "", -3).await.unwrap();
        assert_eq!(negative.len(), 50);
    }

    #[tokio::test]
    async fn history_filters_by_server_and_tool() {
        let store = Store::open_in_memory().await.unwrap();
        store
            .insert_history(&history_item("a", "x", true))
            .await
            .unwrap();
        store
            .insert_history(&history_item("a", "y", false))
            .await
            .unwrap();
        store
            .insert_history(&history_item("b", "x", true))
            .await
            .unwrap();

        let by_server = store.list_history("a", "", 10).await.unwrap();
        assert_eq!(by_server.len(), 2);

        let by_both = store.list_history("a", "y", 10).await.unwrap();
        assert_eq!(by_both.len(), 1);
        assert!(!by_both[0].success);
        assert_eq!(by_both[0].error, "boom");
    }

    #[tokio::test]
    async fn token_upsert_and_fetch() {
        let store = Store::open_in_memory().await.unwrap();
        assert!(store.get_token("notion").await.unwrap().is_none());

        let token = Token {
            access_token: "first".to_string(),
            ..Default::default()
        };
        store.save_token("notion", &token).await.unwrap();
        assert_eq!(
            store.get_token("notion").await.unwrap().unwrap().access_token,
            "first"
        );

        let replacement = Token {
            access_token: "second".to_string(),
            refresh_token: Some("r".to_string()),
            ..Default::default()
        };
        store.save_token("notion", &replacement).await.unwrap();
        let fetched = store.get_token("notion").await.unwrap().unwrap();
        assert_eq!(fetched.access_token, "second");
        assert_eq!(fetched.refresh_token.as_deref(), Some("r"));

        // Still exactly one row.
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM oauth_tokens")
            .fetch_one(&store.pool)
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn empty_access_token_reads_as_absent() {
        let store = Store::open_in_memory().await.unwrap();
        store
            .save_token("notion", &Token::default())
            .await
            .unwrap();
        assert!(store.get_token("notion").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn token_store_trait_maps_missing_rows_to_sentinel() {
        let store = Arc::new(Store::open_in_memory().await.unwrap());
        let tokens = StoreTokens(store);
        let per_server = tokens.token_store("notion");

        assert!(matches!(per_server.get().await, Err(McpError::NoToken)));

        let token = Token {
            access_token: "abc".to_string(),
            ..Default::default()
        };
        per_server.save(&token).await.unwrap();
        assert_eq!(per_server.get().await.unwrap().access_token, "abc");
    }

    #[tokio::test]
    async fn open_creates_parent_directory() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("nested").join("mcpshim.db");
        let store = Store::open(&path).await.unwrap();
        store
            .insert_history(&history_item("a", "x", true))
            .await
            .unwrap();
        assert!(path.exists());
        store.close().await;
    }
}
