// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Loophole Contributors

// Loophole - Token Module
// Bearer tokens for the control-plane API, read from the login flow's token file

use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use loophole_common::AuthenticationError;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

/// Characters kept visible at each end of an obfuscated token
const VISIBLE_CHARS: usize = 4;

/// Tokens shorter than this are masked completely
const MIN_PARTIAL_LEN: usize = 12;

/// Obfuscate a token for logging (show the first and last 4 characters)
/// Example: "abc123def456ghi7" -> "abc1********ghi7"
pub fn obfuscate_token(token: &str) -> String {
    let count = token.chars().count();
    if count < MIN_PARTIAL_LEN {
        return "*".repeat(count);
    }

    let head: String = token.chars().take(VISIBLE_CHARS).collect();
    let tail: String = token.chars().skip(count - VISIBLE_CHARS).collect();
    format!("{}{}{}", head, "*".repeat(count - 2 * VISIBLE_CHARS), tail)
}

/// Source of bearer tokens for the registration API
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Current access token, without any network call
    async fn access_token(&self) -> Result<Zeroizing<String>, AuthenticationError>;

    /// Exchange the refresh token for a new access token
    async fn refresh(&self) -> Result<(), AuthenticationError>;
}

/// Token file contents as written by the login flow
#[derive(Clone, Serialize, Deserialize)]
pub struct TokenSet {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_in: Option<u64>,
}

impl Drop for TokenSet {
    fn drop(&mut self) {
        use zeroize::Zeroize;
        self.access_token.zeroize();
        if let Some(refresh) = self.refresh_token.as_mut() {
            refresh.zeroize();
        }
    }
}

/// Token provider backed by `~/.loophole/tokens.json`
pub struct FileTokenProvider {
    path: PathBuf,
    token_url: String,
    client_id: String,
    http: reqwest::Client,
}

impl FileTokenProvider {
    pub fn new(path: PathBuf, token_url: String, client_id: String) -> Self {
        Self {
            path,
            token_url,
            client_id,
            http: reqwest::Client::new(),
        }
    }

    fn read_tokens(&self) -> Result<TokenSet, AuthenticationError> {
        if !self.path.exists() {
            return Err(AuthenticationError::NotLoggedIn);
        }

        let unreadable = |reason: String| AuthenticationError::Unreadable {
            path: self.path.display().to_string(),
            reason,
        };

        let contents = Zeroizing::new(fs::read_to_string(&self.path).map_err(|e| unreadable(e.to_string()))?);
        serde_json::from_str(&contents).map_err(|e| unreadable(e.to_string()))
    }

    fn write_tokens(&self, tokens: &TokenSet) -> Result<(), AuthenticationError> {
        save_tokens(&self.path, tokens).map_err(|e| AuthenticationError::Unreadable {
            path: self.path.display().to_string(),
            reason: e.to_string(),
        })
    }
}

/// Write the token file with owner-only permissions
pub fn save_tokens(path: &Path, tokens: &TokenSet) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let contents = Zeroizing::new(serde_json::to_string_pretty(tokens)?);
    fs::write(path, contents.as_bytes())?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    }

    Ok(())
}

#[derive(Deserialize)]
struct RefreshResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    id_token: Option<String>,
    #[serde(default)]
    token_type: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
}

#[async_trait]
impl TokenProvider for FileTokenProvider {
    async fn access_token(&self) -> Result<Zeroizing<String>, AuthenticationError> {
        let tokens = self.read_tokens()?;
        if tokens.access_token.is_empty() {
            return Err(AuthenticationError::NotLoggedIn);
        }
        debug!("Using access token {}", obfuscate_token(&tokens.access_token));
        Ok(Zeroizing::new(tokens.access_token.clone()))
    }

    async fn refresh(&self) -> Result<(), AuthenticationError> {
        let mut tokens = self.read_tokens()?;
        let refresh_token = match tokens.refresh_token.as_deref() {
            Some(token) if !token.is_empty() => Zeroizing::new(token.to_string()),
            _ => return Err(AuthenticationError::Reauthenticate),
        };

        info!("Refreshing access token");
        let response = self
            .http
            .post(&self.token_url)
            .form(&[
                ("grant_type", "refresh_token"),
                ("client_id", self.client_id.as_str()),
                ("refresh_token", refresh_token.as_str()),
            ])
            .send()
            .await
            .map_err(|e| AuthenticationError::RefreshRejected(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            warn!("Token refresh failed with status {}", status);
            let body = match response.text().await {
                Ok(body) => body,
                Err(e) => {
                    warn!("Failed to read token refresh error body: {}", e);
                    format!("unreadable body ({})", e)
                }
            };
            return Err(AuthenticationError::RefreshRejected(format!(
                "status {}: {}",
                status.as_u16(),
                body
            )));
        }

        let refreshed: RefreshResponse = response
            .json()
            .await
            .map_err(|e| AuthenticationError::RefreshRejected(e.to_string()))?;

        tokens.access_token = refreshed.access_token;
        if let Some(refresh) = refreshed.refresh_token {
            tokens.refresh_token = Some(refresh);
        }
        if refreshed.id_token.is_some() {
            tokens.id_token = refreshed.id_token;
        }
        if refreshed.token_type.is_some() {
            tokens.token_type = refreshed.token_type;
        }
        tokens.expires_in = refreshed.expires_in;

        self.write_tokens(&tokens)?;
        info!("Access token refreshed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::net::SocketAddr;

    use axum::routing::post;
    use axum::{Form, Json, Router};
    use tempfile::TempDir;

    async fn spawn_app(router: Router) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        addr
    }

    fn write_token_file(dir: &TempDir, access: &str, refresh: Option<&str>) -> PathBuf {
        let path = dir.path().join("tokens.json");
        let tokens = TokenSet {
            access_token: access.to_string(),
            refresh_token: refresh.map(str::to_string),
            id_token: None,
            token_type: Some("Bearer".to_string()),
            expires_in: Some(86400),
        };
        save_tokens(&path, &tokens).unwrap();
        path
    }

    #[test]
    fn test_obfuscate_token() {
        let token = "abc123de-f456-7890-1234-567890abcdef";
        let obfuscated = obfuscate_token(token);
        assert_eq!(obfuscated, "abc1****************************cdef");
        assert_eq!(obfuscated.len(), token.len());

        assert_eq!(obfuscate_token("abc123def456"), "abc1****f456");

        // Too short to reveal anything
        assert_eq!(obfuscate_token("abc123def45"), "***********");
        assert_eq!(obfuscate_token("1234"), "****");
        assert_eq!(obfuscate_token(""), "");
    }

    #[tokio::test]
    async fn test_missing_file_is_not_logged_in() {
        let dir = TempDir::new().unwrap();
        let provider = FileTokenProvider::new(
            dir.path().join("tokens.json"),
            "http://127.0.0.1:1/oauth/token".to_string(),
            "client".to_string(),
        );
        assert_eq!(
            provider.access_token().await.unwrap_err(),
            AuthenticationError::NotLoggedIn
        );
    }

    #[tokio::test]
    async fn test_corrupt_file_is_unreadable() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tokens.json");
        fs::write(&path, "not json").unwrap();
        let provider = FileTokenProvider::new(path, "http://127.0.0.1:1".into(), "c".into());
        assert!(matches!(
            provider.access_token().await,
            Err(AuthenticationError::Unreadable { .. })
        ));
    }

    #[tokio::test]
    async fn test_reads_access_token() {
        let dir = TempDir::new().unwrap();
        let path = write_token_file(&dir, "access-1", Some("refresh-1"));
        let provider = FileTokenProvider::new(path, "http://127.0.0.1:1".into(), "c".into());
        assert_eq!(provider.access_token().await.unwrap().as_str(), "access-1");
    }

    #[tokio::test]
    async fn test_refresh_persists_new_token() {
        let app = Router::new().route(
            "/oauth/token",
            post(|Form(form): Form<HashMap<String, String>>| async move {
                assert_eq!(form.get("grant_type").map(String::as_str), Some("refresh_token"));
                assert_eq!(form.get("client_id").map(String::as_str), Some("client-x"));
                assert_eq!(form.get("refresh_token").map(String::as_str), Some("refresh-1"));
                Json(serde_json::json!({
                    "access_token": "access-2",
                    "token_type": "Bearer",
                    "expires_in": 3600
                }))
            }),
        );
        let addr = spawn_app(app).await;

        let dir = TempDir::new().unwrap();
        let path = write_token_file(&dir, "access-1", Some("refresh-1"));
        let provider = FileTokenProvider::new(
            path.clone(),
            format!("http://{}/oauth/token", addr),
            "client-x".into(),
        );

        provider.refresh().await.unwrap();
        assert_eq!(provider.access_token().await.unwrap().as_str(), "access-2");

        // Refresh token kept when the response omits one
        let stored: TokenSet = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(stored.refresh_token.as_deref(), Some("refresh-1"));
        assert_eq!(stored.expires_in, Some(3600));
    }

    #[tokio::test]
    async fn test_refresh_without_refresh_token_needs_reauthentication() {
        let dir = TempDir::new().unwrap();
        let path = write_token_file(&dir, "access-1", None);
        let provider = FileTokenProvider::new(path, "http://127.0.0.1:1".into(), "c".into());
        assert_eq!(
            provider.refresh().await.unwrap_err(),
            AuthenticationError::Reauthenticate
        );
    }

    #[tokio::test]
    async fn test_refresh_rejected() {
        let app = Router::new().route(
            "/oauth/token",
            post(|| async { (axum::http::StatusCode::FORBIDDEN, "invalid_grant") }),
        );
        let addr = spawn_app(app).await;

        let dir = TempDir::new().unwrap();
        let path = write_token_file(&dir, "access-1", Some("refresh-1"));
        let provider =
            FileTokenProvider::new(path, format!("http://{}/oauth/token", addr), "c".into());

        match provider.refresh().await {
            Err(AuthenticationError::RefreshRejected(reason)) => {
                assert!(reason.contains("403"));
                assert!(reason.contains("invalid_grant"));
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_refresh_rejected_with_broken_body() {
        let app = Router::new().route(
            "/oauth/token",
            post(|| async {
                let chunks = futures_util::stream::iter(vec![
                    Ok(axum::body::Bytes::from_static(b"invalid_")),
                    Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "cut off")),
                ]);
                (
                    axum::http::StatusCode::FORBIDDEN,
                    axum::body::Body::from_stream(chunks),
                )
            }),
        );
        let addr = spawn_app(app).await;

        let dir = TempDir::new().unwrap();
        let path = write_token_file(&dir, "access-1", Some("refresh-1"));
        let provider =
            FileTokenProvider::new(path, format!("http://{}/oauth/token", addr), "c".into());

        match provider.refresh().await {
            Err(AuthenticationError::RefreshRejected(reason)) => {
                assert!(reason.contains("403"));
                assert!(reason.contains("unreadable body"), "{}", reason);
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }
}
