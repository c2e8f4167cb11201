//! OAuth 2.0 fallback engine for remote MCP servers.
//!
//! Implements authorization-code + PKCE against whatever authorization
//! server the provider advertises. The engine only engages after a direct
//! attempt fails with the unauthorized sentinel, and only for HTTP
//! transports with no static `Authorization` header configured.

use crate::callback::CallbackServer;
use crate::client::{run_operation, McpClient};
use crate::error::{McpError, McpResult};
use crate::token::{Token, TokenStore, TokenStoreProvider};
use crate::transport::BearerSource;
use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{Duration, Utc};
use rand::Rng;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

use mcpshim_core::config::{ServerEntry, Transport as TransportKind};

/// Placeholder redirect used when no callback server is running. Never
/// actually redirected to; it only satisfies client construction.
pub const FALLBACK_REDIRECT_URI: &str = "http://127.0.0.1:53685/oauth/callback";

/// Client name used for dynamic registration.
const REGISTRATION_CLIENT_NAME: &str = "mcpshim";

/// How long the interactive flow waits for the browser redirect.
const CALLBACK_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5 * 60);

/// The fallback engages iff the transport can carry a bearer header, no
/// static Authorization header is configured, and the failure is the
/// unauthorized sentinel.
pub fn should_try_oauth_fallback(entry: &ServerEntry, err: &McpError) -> bool {
    if entry.transport == TransportKind::Stdio {
        return false;
    }
    if entry.has_authorization_header() {
        return false;
    }
    err.is_unauthorized()
}

/// Run an operation with the OAuth fallback wrapped around it.
///
/// The operation may run up to three times: direct, through the
/// token-backed client, and once more after a completed authorization.
pub async fn run_with_oauth_fallback<T, F, Fut>(
    entry: &ServerEntry,
    tokens: &dyn TokenStoreProvider,
    interactive: bool,
    op: F,
) -> McpResult<T>
where
    F: Fn(Arc<McpClient>) -> Fut,
    Fut: Future<Output = McpResult<T>> + Send,
{
    let first_err = match run_operation(entry, None, &op).await {
        Ok(value) => return Ok(value),
        Err(err) if should_try_oauth_fallback(entry, &err) => err,
        Err(err) => return Err(err),
    };
    debug!(server = %entry.name, error = %first_err, "retrying through oauth-wrapped client");

    let callback = if interactive {
        Some(CallbackServer::bind().await?)
    } else {
        None
    };
    let result = oauth_attempt(entry, tokens, callback.as_ref(), &op).await;
    if let Some(cb) = &callback {
        cb.close().await;
    }
    result
}

async fn oauth_attempt<T, F, Fut>(
    entry: &ServerEntry,
    tokens: &dyn TokenStoreProvider,
    callback: Option<&CallbackServer>,
    op: &F,
) -> McpResult<T>
where
    F: Fn(Arc<McpClient>) -> Fut,
    Fut: Future<Output = McpResult<T>> + Send,
{
    let redirect_uri = callback
        .map(|cb| cb.redirect_uri().to_string())
        .unwrap_or_else(|| FALLBACK_REDIRECT_URI.to_string());
    let store = tokens.token_store(&entry.name);
    let bearer: Arc<dyn BearerSource> =
        Arc::new(OAuthBearer::new(entry.url.clone(), store.clone()));

    match run_operation(entry, Some(bearer.clone()), op).await {
        Ok(value) => return Ok(value),
        Err(err) if err.is_unauthorized() => {}
        Err(err) => return Err(err),
    }

    let Some(cb) = callback else {
        return Err(McpError::AuthorizationRequired(entry.name.clone()));
    };
    authorize(entry, store.as_ref(), &redirect_uri, Waiter::Automatic(cb)).await?;
    run_operation(entry, Some(bearer), op).await
}

/// Explicit login: run a bare session (initialize only) through the OAuth
/// client; if the sentinel fires, complete the authorization flow. Success
/// means a token is saved; no tool call is performed.
pub async fn run_oauth_login(
    entry: &ServerEntry,
    tokens: &dyn TokenStoreProvider,
    manual: bool,
) -> McpResult<()> {
    let callback = if manual {
        None
    } else {
        Some(CallbackServer::bind().await?)
    };
    let result = login_attempt(entry, tokens, callback.as_ref()).await;
    if let Some(cb) = &callback {
        cb.close().await;
    }
    result
}

async fn login_attempt(
    entry: &ServerEntry,
    tokens: &dyn TokenStoreProvider,
    callback: Option<&CallbackServer>,
) -> McpResult<()> {
    let redirect_uri = callback
        .map(|cb| cb.redirect_uri().to_string())
        .unwrap_or_else(|| FALLBACK_REDIRECT_URI.to_string());
    let store = tokens.token_store(&entry.name);
    let bearer: Arc<dyn BearerSource> =
        Arc::new(OAuthBearer::new(entry.url.clone(), store.clone()));

    let noop = |_client: Arc<McpClient>| async move { Ok::<(), McpError>(()) };
    match run_operation(entry, Some(bearer), &noop).await {
        Ok(()) => Ok(()),
        Err(err) if err.is_unauthorized() => {
            let waiter = match callback {
                Some(cb) => Waiter::Automatic(cb),
                None => Waiter::Manual,
            };
            authorize(entry, store.as_ref(), &redirect_uri, waiter).await
        }
        Err(err) => Err(err),
    }
}

#[derive(Clone, Copy)]
enum Waiter<'a> {
    Automatic(&'a CallbackServer),
    Manual,
}

/// Run the authorization dance: discover endpoints, ensure a client id,
/// send the user to the authorization URL, collect the redirect, exchange
/// the code, persist the token.
async fn authorize(
    entry: &ServerEntry,
    store: &dyn TokenStore,
    redirect_uri: &str,
    waiter: Waiter<'_>,
) -> McpResult<()> {
    let http = Client::new();
    let metadata = discover_metadata(&http, &entry.url).await?;

    let client_id = match store.get().await {
        Ok(token) if !token.client_id.is_empty() => token.client_id,
        _ => register_client(&http, &metadata, redirect_uri).await?,
    };

    let verifier = generate_code_verifier();
    let challenge = generate_code_challenge(&verifier);
    let state = generate_state();

    let auth_url = build_auth_url(
        &metadata.authorization_endpoint,
        &client_id,
        redirect_uri,
        None,
        &state,
        &challenge,
    );
    println!("oauth login required; authorize here: {auth_url}");
    if let Err(e) = open_browser(&auth_url) {
        println!("failed to open browser automatically: {e}");
    }

    let params = match waiter {
        Waiter::Automatic(cb) => {
            println!("waiting for oauth callback...");
            tokio::time::timeout(CALLBACK_TIMEOUT, cb.wait())
                .await
                .map_err(|_| McpError::OAuth("timed out waiting for oauth callback".to_string()))??
        }
        Waiter::Manual => {
            println!(
                "manual mode: complete login in any browser/device, then paste the final redirect URL (or code)."
            );
            read_manual_input(&state).await?
        }
    };

    // Automatic mode always round-trips state; manual input already
    // checked it when one was present.
    if matches!(waiter, Waiter::Automatic(_))
        && params.get("state").map(String::as_str) != Some(state.as_str())
    {
        return Err(McpError::StateMismatch);
    }

    if let Some(err) = params.get("error").filter(|e| !e.is_empty()) {
        return Err(McpError::AuthorizationFailed(err.clone()));
    }
    let code = params
        .get("code")
        .filter(|code| !code.is_empty())
        .ok_or(McpError::MissingCode)?;

    let mut token = exchange_code(
        &http,
        &metadata.token_endpoint,
        &client_id,
        code,
        redirect_uri,
        &verifier,
    )
    .await?;
    token.client_id = client_id;
    store.save(&token).await?;
    debug!(server = %entry.name, "oauth token saved");
    Ok(())
}

/// Read one line from stdin: a full redirect URL (query parameters are
/// extracted, state checked when present) or a bare authorization code.
async fn read_manual_input(expected_state: &str) -> McpResult<HashMap<String, String>> {
    print!("paste redirect URL or code: ");
    use std::io::Write;
    std::io::stdout().flush()?;

    let line = tokio::task::spawn_blocking(|| {
        let mut line = String::new();
        std::io::stdin().read_line(&mut line).map(|_| line)
    })
    .await
    .map_err(|e| McpError::OAuth(format!("stdin reader failed: {e}")))??;

    parse_manual_input(&line, expected_state)
}

fn parse_manual_input(line: &str, expected_state: &str) -> McpResult<HashMap<String, String>> {
    let line = line.trim();
    if line.is_empty() {
        return Err(McpError::OAuth("empty input".to_string()));
    }

    if line.contains("://") {
        let parsed = url::Url::parse(line)
            .map_err(|e| McpError::OAuth(format!("invalid redirect url: {e}")))?;
        let params: HashMap<String, String> = parsed
            .query_pairs()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        if let Some(state) = params.get("state").filter(|s| !s.is_empty()) {
            if state != expected_state {
                return Err(McpError::StateMismatch);
            }
        }
        return Ok(params);
    }

    Ok(HashMap::from([("code".to_string(), line.to_string())]))
}

/// Bearer source backed by the persisted token store. Expired tokens are
/// refreshed in place when a refresh token is available; any failure just
/// sends the request bare so the 401 surfaces as the sentinel.
pub struct OAuthBearer {
    server_url: String,
    store: Arc<dyn TokenStore>,
}

impl OAuthBearer {
    pub fn new(server_url: String, store: Arc<dyn TokenStore>) -> Self {
        Self { server_url, store }
    }
}

#[async_trait]
impl BearerSource for OAuthBearer {
    async fn bearer(&self) -> McpResult<Option<String>> {
        let token = match self.store.get().await {
            Ok(token) => token,
            Err(McpError::NoToken) => return Ok(None),
            Err(err) => return Err(err),
        };

        if !token.is_expired() {
            return Ok(Some(token.access_token));
        }

        let Some(refresh) = token.refresh_token.clone() else {
            return Ok(None);
        };
        let http = Client::new();
        let metadata = match discover_metadata(&http, &self.server_url).await {
            Ok(metadata) => metadata,
            Err(e) => {
                warn!(error = %e, "token refresh discovery failed");
                return Ok(None);
            }
        };
        match refresh_access_token(&http, &metadata.token_endpoint, &token, &refresh).await {
            Ok(refreshed) => {
                self.store.save(&refreshed).await?;
                Ok(Some(refreshed.access_token))
            }
            Err(e) => {
                warn!(error = %e, "token refresh failed");
                Ok(None)
            }
        }
    }
}

/// Authorization-server metadata (RFC 8414), with path-convention
/// fallbacks for servers that do not publish it.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthServerMetadata {
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    #[serde(default)]
    pub registration_endpoint: Option<String>,
}

async fn discover_metadata(http: &Client, server_url: &str) -> McpResult<AuthServerMetadata> {
    let origin = origin_of(server_url)?;
    let well_known = format!("{origin}/.well-known/oauth-authorization-server");

    match http.get(&well_known).send().await {
        Ok(resp) if resp.status().is_success() => match resp.json::<AuthServerMetadata>().await {
            Ok(metadata) => return Ok(metadata),
            Err(e) => debug!(error = %e, "invalid authorization server metadata"),
        },
        Ok(resp) => debug!(status = %resp.status(), "no authorization server metadata"),
        Err(e) => debug!(error = %e, "authorization server metadata discovery failed"),
    }

    Ok(AuthServerMetadata {
        authorization_endpoint: format!("{origin}/authorize"),
        token_endpoint: format!("{origin}/token"),
        registration_endpoint: Some(format!("{origin}/register")),
    })
}

fn origin_of(server_url: &str) -> McpResult<String> {
    let parsed = url::Url::parse(server_url)
        .map_err(|e| McpError::OAuth(format!("invalid server url {server_url:?}: {e}")))?;
    let origin = parsed.origin();
    if !matches!(origin, url::Origin::Tuple(..)) {
        return Err(McpError::OAuth(format!(
            "server url {server_url:?} has no usable origin"
        )));
    }
    Ok(origin.ascii_serialization())
}

#[derive(Serialize)]
struct RegistrationRequest<'a> {
    redirect_uris: [&'a str; 1],
    client_name: &'a str,
    grant_types: [&'a str; 2],
    response_types: [&'a str; 1],
    token_endpoint_auth_method: &'a str,
}

#[derive(Deserialize)]
struct RegistrationResponse {
    client_id: String,
}

/// Dynamic client registration (RFC 7591), public client.
async fn register_client(
    http: &Client,
    metadata: &AuthServerMetadata,
    redirect_uri: &str,
) -> McpResult<String> {
    let endpoint = metadata.registration_endpoint.as_deref().ok_or_else(|| {
        McpError::OAuth("authorization server does not support client registration".to_string())
    })?;

    let request = RegistrationRequest {
        redirect_uris: [redirect_uri],
        client_name: REGISTRATION_CLIENT_NAME,
        grant_types: ["authorization_code", "refresh_token"],
        response_types: ["code"],
        token_endpoint_auth_method: "none",
    };

    let response = http
        .post(endpoint)
        .json(&request)
        .send()
        .await
        .map_err(|e| McpError::OAuth(format!("client registration request failed: {e}")))?;

    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        return Err(McpError::OAuth(format!(
            "client registration failed: {status}: {body}"
        )));
    }

    let registered: RegistrationResponse = response
        .json()
        .await
        .map_err(|e| McpError::OAuth(format!("invalid registration response: {e}")))?;
    debug!(client_id = %registered.client_id, "registered oauth client");
    Ok(registered.client_id)
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    token_type: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    scope: Option<String>,
}

impl TokenResponse {
    fn into_token(self) -> Token {
        Token {
            access_token: self.access_token,
            token_type: self.token_type,
            refresh_token: self.refresh_token,
            expires_at: self.expires_in.map(|secs| Utc::now() + Duration::seconds(secs)),
            scope: self.scope,
            client_id: String::new(),
        }
    }
}

/// Exchange an authorization code for tokens (PKCE).
async fn exchange_code(
    http: &Client,
    token_endpoint: &str,
    client_id: &str,
    code: &str,
    redirect_uri: &str,
    code_verifier: &str,
) -> McpResult<Token> {
    let params = [
        ("grant_type", "authorization_code"),
        ("code", code),
        ("redirect_uri", redirect_uri),
        ("client_id", client_id),
        ("code_verifier", code_verifier),
    ];

    let response = http
        .post(token_endpoint)
        .form(&params)
        .send()
        .await
        .map_err(|e| McpError::OAuth(format!("token request failed: {e}")))?;

    if !response.status().is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(McpError::OAuth(format!("token exchange failed: {body}")));
    }

    let parsed: TokenResponse = response
        .json()
        .await
        .map_err(|e| McpError::OAuth(format!("invalid token response: {e}")))?;
    Ok(parsed.into_token())
}

/// Redeem a refresh token, preserving the old refresh token and client id
/// when the server omits them.
async fn refresh_access_token(
    http: &Client,
    token_endpoint: &str,
    old: &Token,
    refresh_token: &str,
) -> McpResult<Token> {
    let params = [
        ("grant_type", "refresh_token"),
        ("refresh_token", refresh_token),
        ("client_id", old.client_id.as_str()),
    ];

    let response = http
        .post(token_endpoint)
        .form(&params)
        .send()
        .await
        .map_err(|e| McpError::OAuth(format!("refresh request failed: {e}")))?;

    if !response.status().is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(McpError::OAuth(format!("token refresh failed: {body}")));
    }

    let parsed: TokenResponse = response
        .json()
        .await
        .map_err(|e| McpError::OAuth(format!("invalid refresh response: {e}")))?;
    let mut token = parsed.into_token();
    if token.refresh_token.is_none() {
        token.refresh_token = Some(refresh_token.to_string());
    }
    token.client_id = old.client_id.clone();
    Ok(token)
}

/// Generate a PKCE code verifier (32 random bytes, base64url).
pub fn generate_code_verifier() -> String {
    let mut rng = rand::thread_rng();
    let bytes: Vec<u8> = (0..32).map(|_| rng.gen()).collect();
    URL_SAFE_NO_PAD.encode(&bytes)
}

/// Derive the S256 code challenge from a verifier.
pub fn generate_code_challenge(verifier: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(hasher.finalize())
}

/// Generate the anti-CSRF state parameter (16 random bytes, base64url).
pub fn generate_state() -> String {
    let mut rng = rand::thread_rng();
    let bytes: Vec<u8> = (0..16).map(|_| rng.gen()).collect();
    URL_SAFE_NO_PAD.encode(&bytes)
}

/// Build the authorization URL.
pub fn build_auth_url(
    auth_endpoint: &str,
    client_id: &str,
    redirect_uri: &str,
    scope: Option<&str>,
    state: &str,
    code_challenge: &str,
) -> String {
    let mut url = format!(
        "{}?response_type=code&client_id={}&redirect_uri={}&state={}&code_challenge={}&code_challenge_method=S256",
        auth_endpoint,
        urlencoding::encode(client_id),
        urlencoding::encode(redirect_uri),
        urlencoding::encode(state),
        urlencoding::encode(code_challenge),
    );
    if let Some(scope) = scope {
        url.push_str(&format!("&scope={}", urlencoding::encode(scope)));
    }
    url
}

/// Open the system browser on the authorization URL.
fn open_browser(url: &str) -> std::io::Result<()> {
    use std::process::Command;

    #[cfg(target_os = "linux")]
    let mut cmd = Command::new("xdg-open");
    #[cfg(target_os = "macos")]
    let mut cmd = Command::new("open");
    #[cfg(target_os = "windows")]
    let mut cmd = {
        let mut cmd = Command::new("rundll32");
        cmd.arg("url.dll,FileProtocolHandler");
        cmd
    };
    #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
    {
        let _ = url;
        return Err(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "no browser opener for this platform",
        ));
    }

    #[cfg(any(target_os = "linux", target_os = "macos", target_os = "windows"))]
    {
        cmd.arg(url).spawn().map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn http_entry() -> ServerEntry {
        ServerEntry {
            name: "remote".to_string(),
            url: "https://mcp.example.test/mcp".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn code_verifier_shape() {
        let verifier = generate_code_verifier();
        // 32 bytes base64url = 43 characters.
        assert_eq!(verifier.len(), 43);
        assert_ne!(verifier, generate_code_verifier());
    }

    #[test]
    fn code_challenge_is_deterministic() {
        let verifier = "test_verifier_12345678901234567890";
        let challenge = generate_code_challenge(verifier);
        assert_eq!(challenge.len(), 43);
        assert_eq!(challenge, generate_code_challenge(verifier));
    }

    #[test]
    fn state_is_random() {
        assert_ne!(generate_state(), generate_state());
    }

    #[test]
    fn auth_url_contains_pkce_fields() {
        let url = build_auth_url(
            "https://auth.example.test/authorize",
            "client123",
            "http://127.0.0.1:9999/oauth/callback",
            None,
            "state123",
            "challenge123",
        );
        assert!(url.contains("response_type=code"));
        assert!(url.contains("client_id=client123"));
        assert!(url.contains("code_challenge=challenge123"));
        assert!(url.contains("code_challenge_method=S256"));
        assert!(!url.contains("scope="));
    }

    #[test]
    fn auth_url_encodes_scope() {
        let url = build_auth_url(
            "https://auth.example.test/authorize",
            "client 123",
            "http://127.0.0.1:9999/oauth/callback",
            Some("read write"),
            "s",
            "c",
        );
        assert!(url.contains("client_id=client%20123"));
        assert!(url.contains("scope=read%20write"));
    }

    #[test]
    fn fallback_predicate() {
        let entry = http_entry();
        assert!(should_try_oauth_fallback(&entry, &McpError::Unauthorized));
        assert!(!should_try_oauth_fallback(&entry, &McpError::Timeout));

        let mut with_auth = http_entry();
        with_auth
            .headers
            .insert("Authorization".to_string(), "Bearer x".to_string());
        assert!(!should_try_oauth_fallback(&with_auth, &McpError::Unauthorized));

        let mut lowercase_auth = http_entry();
        lowercase_auth
            .headers
            .insert("authorization".to_string(), "Bearer x".to_string());
        assert!(!should_try_oauth_fallback(
            &lowercase_auth,
            &McpError::Unauthorized
        ));

        let stdio = ServerEntry {
            name: "local".to_string(),
            transport: TransportKind::Stdio,
            command: vec!["mcp-local".to_string()],
            headers: BTreeMap::new(),
            ..Default::default()
        };
        assert!(!should_try_oauth_fallback(&stdio, &McpError::Unauthorized));
    }

    #[test]
    fn manual_input_bare_code() {
        let params = parse_manual_input("abc123\n", "state").unwrap();
        assert_eq!(params.get("code").map(String::as_str), Some("abc123"));
    }

    #[test]
    fn manual_input_url_with_matching_state() {
        let params = parse_manual_input(
            "http://127.0.0.1:9999/oauth/callback?code=xyz&state=expected",
            "expected",
        )
        .unwrap();
        assert_eq!(params.get("code").map(String::as_str), Some("xyz"));
    }

    #[test]
    fn manual_input_url_with_wrong_state() {
        let result = parse_manual_input(
            "http://127.0.0.1:9999/oauth/callback?code=xyz&state=other",
            "expected",
        );
        assert!(matches!(result, Err(McpError::StateMismatch)));
    }

    #[test]
    fn manual_input_url_without_state_is_accepted() {
        let params =
            parse_manual_input("http://127.0.0.1:9999/oauth/callback?code=xyz", "expected")
                .unwrap();
        assert_eq!(params.get("code").map(String::as_str), Some("xyz"));
    }

    #[test]
    fn manual_input_rejects_empty_lines() {
        assert!(parse_manual_input("   \n", "state").is_err());
    }

    #[test]
    fn origin_extraction() {
        assert_eq!(
            origin_of("https://mcp.example.test/mcp/v1?x=1").unwrap(),
            "https://mcp.example.test"
        );
        assert_eq!(
            origin_of("http://127.0.0.1:8080/sse").unwrap(),
            "http://127.0.0.1:8080"
        );
        assert!(origin_of("not a url").is_err());
    }

    #[test]
    fn token_response_computes_expiry() {
        let response = TokenResponse {
            access_token: "a".to_string(),
            token_type: "Bearer".to_string(),
            refresh_token: Some("r".to_string()),
            expires_in: Some(3600),
            scope: None,
        };
        let token = response.into_token();
        assert!(token.expires_at.is_some());
        assert!(!token.is_expired());
    }
}
