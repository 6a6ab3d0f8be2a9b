// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Loophole Contributors

// Loophole - Tunnel Engine
// Site registration, local TLS servers, the SSH gateway, relaying and the daemon

pub mod acme;
pub mod daemon;
pub mod keys;
pub mod registrar;
pub mod registry;
pub mod relay;
pub mod server;
pub mod ssh;
pub mod tls;
pub mod token;
pub mod tunnel;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use loophole_common::{ClientConfig, TunnelEvent};
use tokio::sync::broadcast;

pub use daemon::{shutdown_signal, Daemon};
pub use registry::TunnelRegistry;
pub use tunnel::{EngineSettings, TunnelEngine, TunnelHandle, TunnelRequest};

/// Capacity of the tunnel event channel
pub const EVENT_CHANNEL_CAPACITY: usize = 100;

/// Wire the production collaborators (token file, control-plane API, SSH
/// gateway) into an engine
pub async fn build_engine(
    config: &ClientConfig,
    events: broadcast::Sender<TunnelEvent>,
) -> Result<TunnelEngine> {
    let identity_path = config.identity_path();
    let identity = keys::GatewayIdentity::load_or_generate(&identity_path)
        .await
        .with_context(|| format!("Failed to load SSH identity {}", identity_path.display()))?;

    let tokens = Arc::new(token::FileTokenProvider::new(
        config.token_path(),
        config.oauth_token_url.clone(),
        config.oauth_client_id.clone(),
    ));
    let registrar = Arc::new(registrar::ApiRegistrar::new(
        config.api_endpoint.clone(),
        tokens,
    ));
    let connector = Arc::new(ssh::SshConnector::new(
        identity,
        ssh::SshSettings::new(
            config.gateway_endpoint.clone(),
            config.connect_attempts,
            Duration::from_secs(config.connect_retry_delay_secs),
        ),
    ));

    Ok(TunnelEngine::new(
        registrar,
        connector,
        EngineSettings::from_config(config),
        events,
    ))
}
