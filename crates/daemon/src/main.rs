// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Loophole Contributors

// Loophole - Daemon
// Hosts several tunnels behind the loopback control protocol

use anyhow::{Context, Result};
use loophole_common::{ClientConfig, TunnelEvent};
use loophole_daemon::{build_engine, shutdown_signal, Daemon, EVENT_CHANNEL_CAPACITY};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "loopholed=debug,loophole_daemon=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Loophole daemon starting...");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = ClientConfig::load().context("Failed to load configuration")?;
    config.validate()?;
    info!("Gateway: {}", config.gateway_endpoint);
    info!("API: {}", config.api_endpoint);

    let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
    let engine = build_engine(&config, events.clone()).await?;

    // Subscribe to tunnel events for logging
    let mut event_rx = events.subscribe();
    tokio::spawn(async move {
        loop {
            match event_rx.recv().await {
                Ok(event) => log_event(&event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!("Event log skipped {} events", skipped)
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let listener = Daemon::bind(config.daemon_port).await?;
    let daemon = Daemon::new(engine);

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        signal_token.cancel();
    });

    info!("Daemon started successfully");
    daemon.serve(listener, shutdown).await?;

    info!("Daemon shut down");
    Ok(())
}

fn log_event(event: &TunnelEvent) {
    match event {
        TunnelEvent::Accepting { id, urls, .. } => info!("Tunnel {} accepting on {}", id, urls.join(", ")),
        TunnelEvent::RelayFailed { id, error, .. } => warn!("Tunnel {}: {}", id, error),
        TunnelEvent::Failed { id, error, .. } => error!("Tunnel {} failed: {}", id, error),
        other => info!("Tunnel event: {:?}", other),
    }
}

