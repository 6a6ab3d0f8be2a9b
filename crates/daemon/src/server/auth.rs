// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Loophole Contributors

// Loophole - Basic Auth Module
// HTTP basic authentication in front of a local server

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use base64::Engine;
use loophole_common::BasicAuthCredentials;
use sha2::{Digest, Sha256};
use tracing::{trace, warn};
use zeroize::Zeroizing;

/// Basic auth middleware state
///
/// Only digests of the expected credentials are kept.
#[derive(Clone)]
pub struct BasicAuthState {
    realm: String,
    username_digest: [u8; 32],
    password_digest: [u8; 32],
}

impl BasicAuthState {
    /// `realm` is the site's public hostname
    pub fn new(credentials: &BasicAuthCredentials, realm: &str) -> Self {
        Self {
            realm: realm.to_string(),
            username_digest: digest(credentials.username.as_bytes()),
            password_digest: digest(credentials.password.as_bytes()),
        }
    }

    fn accepts(&self, username: &str, password: &str) -> bool {
        let user_ok = constant_time_eq(&digest(username.as_bytes()), &self.username_digest);
        let pass_ok = constant_time_eq(&digest(password.as_bytes()), &self.password_digest);
        user_ok & pass_ok
    }

    fn challenge(&self) -> Response {
        let mut response = (StatusCode::UNAUTHORIZED, "Unauthorized\n").into_response();
        let value = format!("Basic realm=\"{}\"", self.realm.replace('"', ""));
        if let Ok(value) = HeaderValue::from_str(&value) {
            response.headers_mut().insert(header::WWW_AUTHENTICATE, value);
        }
        response
    }
}

fn digest(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

fn constant_time_eq(a: &[u8; 32], b: &[u8; 32]) -> bool {
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Decode `Authorization: Basic <base64(user:pass)>`
fn parse_basic(value: &str) -> Option<(String, Zeroizing<String>)> {
    let (scheme, encoded) = value.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }

    let decoded = Zeroizing::new(
        base64::engine::general_purpose::STANDARD
            .decode(encoded.trim())
            .ok()?,
    );
    let decoded = std::str::from_utf8(&decoded).ok()?;
    let (username, password) = decoded.split_once(':')?;
    Some((username.to_string(), Zeroizing::new(password.to_string())))
}

/// Basic auth middleware for Axum
///
/// Returns 401 with a `WWW-Authenticate` challenge if credentials are missing
/// or wrong.
pub async fn basic_auth_middleware(
    State(state): State<Arc<BasicAuthState>>,
    request: Request,
    next: Next,
) -> Response {
    let provided = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(parse_basic);

    match provided {
        Some((username, password)) if state.accepts(&username, &password) => {
            trace!("Basic auth accepted");
            next.run(request).await
        }
        Some((username, _)) => {
            warn!("Basic auth failed for user '{}'", username);
            state.challenge()
        }
        None => state.challenge(),
    }
}
