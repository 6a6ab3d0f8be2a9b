// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Loophole Contributors

// Loophole - Site Registrar
// Reserves a public site ID for an SSH public key through the control-plane API

use std::sync::Arc;

use async_trait::async_trait;
use loophole_common::error::HOSTNAME_RULES;
use loophole_common::{AuthenticationError, Endpoint, RegistrationError, TunnelError};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::token::TokenProvider;

/// Obtains the site ID a tunnel will be published under
#[async_trait]
pub trait SiteRegistrar: Send + Sync {
    /// Register `public_key` (`"<type> <base64>"`), optionally asking for a specific site ID.
    /// The returned ID may differ from the requested one.
    async fn register(
        &self,
        public_key: &str,
        requested_site_id: Option<&str>,
    ) -> Result<String, TunnelError>;
}

#[derive(Serialize)]
struct RegisterSiteRequest<'a> {
    key: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<&'a str>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegisterSiteResponse {
    site_id: String,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct ApiErrorBody {
    #[serde(default)]
    #[allow(dead_code)]
    status_code: Option<u16>,
    #[serde(default)]
    message: String,
    #[serde(default)]
    error: String,
}

/// Registrar talking to `POST {api}/api/register-site`
pub struct ApiRegistrar {
    api: Endpoint,
    tokens: Arc<dyn TokenProvider>,
    http: reqwest::Client,
}

impl ApiRegistrar {
    pub fn new(api: Endpoint, tokens: Arc<dyn TokenProvider>) -> Self {
        Self {
            api,
            tokens,
            http: reqwest::Client::new(),
        }
    }

    fn register_url(&self) -> String {
        format!("{}/api/register-site", self.api.uri().trim_end_matches('/'))
    }
}

/// Map a non-success status and its body to a registration error
fn classify_failure(status: StatusCode, body: &str) -> RegistrationError {
    let parsed: Option<ApiErrorBody> = serde_json::from_str(body).ok();
    let (message, error) = match parsed {
        Some(parsed) => (parsed.message, parsed.error),
        None => (body.trim().to_string(), String::new()),
    };

    match status.as_u16() {
        400 => RegistrationError::InvalidHostname {
            message,
            details: HOSTNAME_RULES.to_string(),
        },
        403 => RegistrationError::Forbidden { message },
        409 => RegistrationError::Conflict { message },
        422 => RegistrationError::Validation {
            message,
            details: HOSTNAME_RULES.to_string(),
        },
        other => RegistrationError::Unexpected {
            status: other,
            message,
            details: error,
        },
    }
}

#[async_trait]
impl SiteRegistrar for ApiRegistrar {
    async fn register(
        &self,
        public_key: &str,
        requested_site_id: Option<&str>,
    ) -> Result<String, TunnelError> {
        let request = RegisterSiteRequest {
            key: public_key,
            id: requested_site_id.filter(|id| !id.is_empty()),
        };
        let mut refreshed = false;

        loop {
            let token = self.tokens.access_token().await?;

            debug!("Registering site at {}", self.register_url());
            let response = self
                .http
                .post(self.register_url())
                .bearer_auth(token.as_str())
                .json(&request)
                .send()
                .await
                .map_err(|e| RegistrationError::Transport(e.to_string()))?;

            let status = response.status();
            match status {
                StatusCode::OK | StatusCode::CREATED => {
                    let body: RegisterSiteResponse = response
                        .json()
                        .await
                        .map_err(|e| RegistrationError::Transport(e.to_string()))?;
                    if body.site_id.is_empty() {
                        return Err(RegistrationError::Unexpected {
                            status: status.as_u16(),
                            message: "API returned an empty site ID".to_string(),
                            details: String::new(),
                        }
                        .into());
                    }
                    info!("Site registered as {}", body.site_id);
                    return Ok(body.site_id);
                }
                StatusCode::UNAUTHORIZED if !refreshed => {
                    warn!("Access token rejected, refreshing and retrying once");
                    refreshed = true;
                    self.tokens.refresh().await?;
                }
                StatusCode::UNAUTHORIZED => {
                    return Err(AuthenticationError::Reauthenticate.into());
                }
                _ => {
                    let body = response.text().await.map_err(|e| {
                        warn!("Failed to read registration error body: {}", e);
                        RegistrationError::Transport(format!(
                            "status {} with an unreadable body: {}",
                            status.as_u16(),
                            e
                        ))
                    })?;
                    let err = classify_failure(status, &body);
                    warn!("Site registration failed: {}", err);
                    return Err(err.into());
                }
            }
        }
    }
}
