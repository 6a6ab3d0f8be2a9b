// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Loophole Contributors

// Loophole - Tunnel Controller
// Drives one tunnel from registration to a running accept loop, and keeps it
// running across dropped gateway listeners until it is cancelled

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use loophole_common::{
    public_urls, site_fqdn, BasicAuthCredentials, ClientConfig, LocalTarget, RelayError,
    TunnelError, TunnelEvent, TunnelState, Utc, Uuid,
};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::registrar::SiteRegistrar;
use crate::relay::relay;
use crate::server::{LocalServer, LocalServerFactory, ServerOptions};
use crate::ssh::{BoxedStream, GatewayConnector, RemoteListener};
use crate::tls::TlsSettings;

const PREWARM_TIMEOUT: Duration = Duration::from_secs(30);

/// Engine-wide settings
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub server: ServerOptions,
    /// Request the public URL once the tunnel is up so certificate issuance starts early
    pub prewarm_certificates: bool,
}

impl EngineSettings {
    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            server: ServerOptions {
                domain: config.domain.clone(),
                tls: TlsSettings {
                    mode: config.certificate_mode,
                    cache_dir: config.cert_cache_path(),
                    acme_directory_url: config.acme_directory_url.clone(),
                    acme_contact: config.acme_contact.clone(),
                    disable_old_ciphers: config.disable_old_ciphers,
                },
                disable_proxy_error_page: config.disable_proxy_error_page,
                disable_directory_listing: config.disable_directory_listing,
            },
            prewarm_certificates: config.prewarm_certificates,
        }
    }
}

/// What to expose, and under which site
#[derive(Debug, Clone)]
pub struct TunnelRequest {
    pub tunnel_id: Uuid,
    pub target: LocalTarget,
    /// `None` lets the control plane assign one
    pub site_id: Option<String>,
    pub basic_auth: Option<BasicAuthCredentials>,
}

impl TunnelRequest {
    pub fn new(target: LocalTarget) -> Self {
        Self {
            tunnel_id: Uuid::new_v4(),
            target,
            site_id: None,
            basic_auth: None,
        }
    }

    pub fn with_site_id(mut self, site_id: Option<String>) -> Self {
        self.site_id = site_id.filter(|s| !s.is_empty());
        self
    }

    pub fn with_basic_auth(mut self, basic_auth: Option<BasicAuthCredentials>) -> Self {
        self.basic_auth = basic_auth;
        self
    }
}

/// A started tunnel
pub struct TunnelHandle {
    tunnel_id: Uuid,
    site_id: String,
    urls: Vec<String>,
    cancel: CancellationToken,
    state: watch::Receiver<TunnelState>,
    task: Option<JoinHandle<Result<(), TunnelError>>>,
}

impl TunnelHandle {
    pub fn tunnel_id(&self) -> Uuid {
        self.tunnel_id
    }

    pub fn site_id(&self) -> &str {
        &self.site_id
    }

    /// Publicly reachable URLs, `https` first
    pub fn urls(&self) -> &[String] {
        &self.urls
    }

    pub fn state(&self) -> TunnelState {
        self.state.borrow().clone()
    }

    pub fn state_receiver(&self) -> watch::Receiver<TunnelState> {
        self.state.clone()
    }

    /// Token that stops the tunnel when cancelled
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Ask the tunnel to stop. Stopping a stopped tunnel does nothing.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Wait for the accept loop to finish
    pub async fn wait(mut self) -> Result<(), TunnelError> {
        match self.task.take() {
            Some(task) => match task.await {
                Ok(result) => result,
                Err(e) => Err(TunnelError::Aborted(e.to_string())),
            },
            None => Ok(()),
        }
    }
}

/// Starts tunnels
#[derive(Clone)]
pub struct TunnelEngine {
    registrar: Arc<dyn SiteRegistrar>,
    connector: Arc<dyn GatewayConnector>,
    servers: Arc<LocalServerFactory>,
    settings: Arc<EngineSettings>,
    events: broadcast::Sender<TunnelEvent>,
}

impl TunnelEngine {
    pub fn new(
        registrar: Arc<dyn SiteRegistrar>,
        connector: Arc<dyn GatewayConnector>,
        settings: EngineSettings,
        events: broadcast::Sender<TunnelEvent>,
    ) -> Self {
        Self {
            registrar,
            connector,
            servers: Arc::new(LocalServerFactory::new(settings.server.clone())),
            settings: Arc::new(settings),
            events,
        }
    }

    /// Subscribe to events of all tunnels
    pub fn subscribe(&self) -> broadcast::Receiver<TunnelEvent> {
        self.events.subscribe()
    }

    pub fn domain(&self) -> &str {
        &self.settings.server.domain
    }

    /// Register, start the local server and open the remote listener.
    ///
    /// Returns once the tunnel is accepting connections. Errors before that
    /// point leave nothing running.
    pub async fn start(&self, request: TunnelRequest) -> Result<TunnelHandle, TunnelError> {
        let id = request.tunnel_id;
        let (state_tx, state_rx) = watch::channel(TunnelState::Idle);

        match self.start_inner(request, &state_tx, state_rx).await {
            Ok(handle) => Ok(handle),
            Err(e) => {
                error!("Tunnel {} failed to start: {}", id, e);
                state_tx.send_replace(TunnelState::Failed(e.to_string()));
                emit(
                    &self.events,
                    TunnelEvent::Failed {
                        id,
                        error: e.to_string(),
                        timestamp: Utc::now(),
                    },
                );
                Err(e)
            }
        }
    }

    async fn start_inner(
        &self,
        request: TunnelRequest,
        state_tx: &watch::Sender<TunnelState>,
        state_rx: watch::Receiver<TunnelState>,
    ) -> Result<TunnelHandle, TunnelError> {
        let id = request.tunnel_id;
        request.target.validate().map_err(TunnelError::InvalidSpec)?;

        // Registering
        state_tx.send_replace(TunnelState::Registering);
        emit(&self.events, TunnelEvent::Registering { id, timestamp: Utc::now() });
        let site_id = self
            .registrar
            .register(&self.connector.public_key(), request.site_id.as_deref())
            .await?;
        info!("Tunnel {} registered as site {}", id, site_id);
        emit(
            &self.events,
            TunnelEvent::Registered {
                id,
                site_id: site_id.clone(),
                timestamp: Utc::now(),
            },
        );

        // ServerStarting
        state_tx.send_replace(TunnelState::ServerStarting);
        let server = self
            .servers
            .build(&request.target, &site_id, request.basic_auth.as_ref())
            .await?;
        emit(
            &self.events,
            TunnelEvent::ServerStarted {
                id,
                port: server.port(),
                timestamp: Utc::now(),
            },
        );

        let fqdn = site_fqdn(&site_id, self.domain());
        if self.settings.prewarm_certificates {
            tokio::spawn(prewarm(format!("https://{}", fqdn), state_rx.clone()));
        }

        // Connecting
        state_tx.send_replace(TunnelState::Connecting);
        let events = self.events.clone();
        let on_attempt = move |attempt: u32| {
            emit(&events, TunnelEvent::Connecting { id, attempt, timestamp: Utc::now() });
        };
        let listener = match self.connector.open(&site_id, &on_attempt).await {
            Ok(listener) => listener,
            Err(e) => {
                server.shutdown().await;
                return Err(e.into());
            }
        };

        // Accepting
        let urls = public_urls(&site_id, self.domain(), request.target.kind());
        state_tx.send_replace(TunnelState::Accepting);
        emit(
            &self.events,
            TunnelEvent::Accepting {
                id,
                urls: urls.clone(),
                timestamp: Utc::now(),
            },
        );
        info!("Tunnel {} for {} is up: {}", id, request.target, urls.join(", "));

        let cancel = CancellationToken::new();
        let accept_loop = AcceptLoop {
            id,
            site_id: site_id.clone(),
            urls: urls.clone(),
            relay_target: server.local_addr(),
            server,
            listener,
            connector: self.connector.clone(),
            events: self.events.clone(),
            state: state_tx.clone(),
            cancel: cancel.clone(),
        };
        let task = tokio::spawn(accept_loop.run());

        Ok(TunnelHandle {
            tunnel_id: id,
            site_id,
            urls,
            cancel,
            state: state_rx,
            task: Some(task),
        })
    }
}

fn emit(events: &broadcast::Sender<TunnelEvent>, event: TunnelEvent) {
    if let Err(e) = events.send(event) {
        debug!("No subscriber for tunnel event: {}", e);
    }
}

/// One HTTPS request to the public URL so the certificate gets issued before
/// the first real visitor arrives. Failure is only logged.
async fn prewarm(url: String, mut state: watch::Receiver<TunnelState>) {
    let reached = state
        .wait_for(|s| s.is_running() || s.is_terminal())
        .await
        .map(|s| s.is_running())
        .unwrap_or(false);
    if !reached {
        return;
    }

    let client = match reqwest::Client::builder().timeout(PREWARM_TIMEOUT).build() {
        Ok(client) => client,
        Err(e) => {
            debug!("Pre-warm client unavailable: {}", e);
            return;
        }
    };
    match client.get(&url).send().await {
        Ok(response) => debug!("Pre-warm request to {} answered {}", url, response.status()),
        Err(e) => debug!("Pre-warm request to {} failed: {}", url, e),
    }
}

/// The running part of a tunnel. Owns the local server and the one remote
/// listener; a dropped listener is replaced in place.
struct AcceptLoop {
    id: Uuid,
    site_id: String,
    urls: Vec<String>,
    relay_target: SocketAddr,
    server: LocalServer,
    listener: Box<dyn RemoteListener>,
    connector: Arc<dyn GatewayConnector>,
    events: broadcast::Sender<TunnelEvent>,
    state: watch::Sender<TunnelState>,
    cancel: CancellationToken,
}

impl AcceptLoop {
    async fn run(mut self) -> Result<(), TunnelError> {
        loop {
            let accepted = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };

            match accepted {
                Ok(Some(connection)) => self.spawn_relay(connection),
                Ok(None) => {
                    // EOF after a stop request is the listener going away on purpose
                    if self.cancel.is_cancelled() {
                        break;
                    }
                    if let Err(e) = self.reconnect().await {
                        return self.fail(e).await;
                    }
                    if self.cancel.is_cancelled() {
                        break;
                    }
                }
                Err(e) => warn!("Tunnel {}: accept failed: {}", self.id, e),
            }
        }

        self.listener.close().await;
        self.server.shutdown().await;
        self.state.send_replace(TunnelState::Stopped);
        emit(&self.events, TunnelEvent::Stopped { id: self.id, timestamp: Utc::now() });
        info!("Tunnel {} ({}) stopped", self.id, self.site_id);
        Ok(())
    }

    fn spawn_relay(&self, connection: BoxedStream) {
        let id = self.id;
        let target = self.relay_target;
        let events = self.events.clone();
        tokio::spawn(async move {
            match relay(connection, target).await {
                Ok(_) => {}
                Err(e @ RelayError::Dial { .. }) => {
                    warn!("Tunnel {}: {}", id, e);
                    emit(
                        &events,
                        TunnelEvent::RelayFailed {
                            id,
                            error: e.to_string(),
                            timestamp: Utc::now(),
                        },
                    );
                }
                Err(e) => debug!("Tunnel {}: {}", id, e),
            }
        });
    }

    /// Close the stale listener, then open a fresh one.
    /// A stop request while reconnecting leaves no listener open.
    async fn reconnect(&mut self) -> Result<(), TunnelError> {
        warn!("Tunnel {}: gateway dropped the remote listener, reconnecting", self.id);
        self.state.send_replace(TunnelState::Reconnecting);
        emit(&self.events, TunnelEvent::Reconnecting { id: self.id, timestamp: Utc::now() });

        self.listener.close().await;

        let id = self.id;
        let events = self.events.clone();
        let on_attempt = move |attempt: u32| {
            emit(&events, TunnelEvent::Connecting { id, attempt, timestamp: Utc::now() });
        };
        let reopened = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            result = self.connector.open(&self.site_id, &on_attempt) => Some(result),
        };

        match reopened {
            None => Ok(()),
            Some(Ok(listener)) => {
                self.listener = listener;
                self.state.send_replace(TunnelState::Accepting);
                emit(
                    &self.events,
                    TunnelEvent::Accepting {
                        id: self.id,
                        urls: self.urls.clone(),
                        timestamp: Utc::now(),
                    },
                );
                info!("Tunnel {}: remote listener restored", self.id);
                Ok(())
            }
            Some(Err(e)) => Err(e.into()),
        }
    }

    async fn fail(self, error: TunnelError) -> Result<(), TunnelError> {
        error!("Tunnel {} ({}) failed: {}", self.id, self.site_id, error);
        self.server.shutdown().await;
        self.state.send_replace(TunnelState::Failed(error.to_string()));
        emit(
            &self.events,
            TunnelEvent::Failed {
                id: self.id,
                error: error.to_string(),
                timestamp: Utc::now(),
            },
        );
        Err(error)
    }
}
