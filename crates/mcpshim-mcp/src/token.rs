//! OAuth token model and the persistence seam.
//!
//! The MCP crate never talks to SQLite directly; it sees tokens through
//! [`TokenStore`], one store per server, handed out by a
//! [`TokenStoreProvider`].

use crate::error::{McpError, McpResult};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Tokens considered expired this close to their deadline get refreshed
/// proactively.
const EXPIRY_SLACK_SECS: i64 = 60;

/// Provider-issued OAuth material for one server.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Token {
    pub access_token: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub token_type: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,

    /// Absolute expiry computed when the token was saved.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,

    /// Client id from dynamic registration, kept with the token so the
    /// refresh grant can identify itself across daemon restarts.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub client_id: String,
}

impl Token {
    /// True when the token has an expiry within the slack window.
    pub fn is_expired(&self) -> bool {
        match self.expires_at {
            Some(expires_at) => expires_at <= Utc::now() + Duration::seconds(EXPIRY_SLACK_SECS),
            None => false,
        }
    }
}

/// Token persistence for a single server.
#[async_trait]
pub trait TokenStore: Send + Sync {
    /// Fetch the stored token. [`McpError::NoToken`] when none exists or
    /// the stored access token is empty.
    async fn get(&self) -> McpResult<Token>;

    /// Upsert the token.
    async fn save(&self, token: &Token) -> McpResult<()>;
}

/// Hands out per-server token stores.
pub trait TokenStoreProvider: Send + Sync {
    fn token_store(&self, server: &str) -> Arc<dyn TokenStore>;
}

/// In-memory token store, for login flows without persistence and for
/// tests.
#[derive(Default)]
pub struct MemoryTokenStore {
    token: tokio::sync::RwLock<Option<Token>>,
}

#[async_trait]
impl TokenStore for MemoryTokenStore {
    async fn get(&self) -> McpResult<Token> {
        match self.token.read().await.clone() {
            Some(token) if !token.access_token.is_empty() => Ok(token),
            _ => Err(McpError::NoToken),
        }
    }

    async fn save(&self, token: &Token) -> McpResult<()> {
        *self.token.write().await = Some(token.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_without_expiry_never_expires() {
        let token = Token {
            access_token: "abc".to_string(),
            ..Default::default()
        };
        assert!(!token.is_expired());
    }

    #[test]
    fn token_expiring_soon_counts_as_expired() {
        let token = Token {
            access_token: "abc".to_string(),
            expires_at: Some(Utc::now() + Duration::seconds(30)),
            ..Default::default()
        };
        assert!(token.is_expired());
    }

    #[test]
    fn token_with_distant_expiry_is_valid() {
        let token = Token {
            access_token: "abc".to_string(),
            expires_at: Some(Utc::now() + Duration::seconds(3600)),
            ..Default::default()
        };
        assert!(!token.is_expired());
    }

    #[tokio::test]
    async fn memory_store_round_trip() {
        let store = MemoryTokenStore::default();
        assert!(matches!(store.get().await, Err(McpError::NoToken)));

        let token = Token {
            access_token: "abc".to_string(),
            ..Default::default()
        };
        store.save(&token).await.unwrap();
        assert_eq!(store.get().await.unwrap(), token);
    }

    #[tokio::test]
    async fn memory_store_treats_empty_access_token_as_absent() {
        let store = MemoryTokenStore::default();
        store.save(&Token::default()).await.unwrap();
        assert!(matches!(store.get().await, Err(McpError::NoToken)));
    }

    #[test]
    fn token_serialization_skips_empty_fields() {
        let token = Token {
            access_token: "abc".to_string(),
            ..Default::default()
        };
        let json = serde_json::to_string(&token).unwrap();
        assert!(!json.contains("refresh_token"));
        assert!(!json.contains("client_id"));
        assert!(!json.contains("expires_at"));
    }
}
