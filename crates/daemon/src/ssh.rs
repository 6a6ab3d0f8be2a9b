// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Loophole Contributors

// Loophole - SSH Gateway Module
// Dials the gateway with the site ID as username and opens the reverse listener

use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use loophole_common::{ConnectionError, Endpoint};
use russh::client::{self, AuthResult, Config, Handle, Msg};
use russh::keys::{HashAlg, PrivateKeyWithHashAlg};
use russh::Channel;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::keys::{GatewayIdentity, IdentitySource};

/// Address the gateway binds for us; public routing happens on its side
const REMOTE_BIND_HOST: &str = "127.0.0.1";
const REMOTE_BIND_PORT: u32 = 80;

/// Any bidirectional byte stream
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

pub type BoxedStream = Box<dyn AsyncStream>;

/// The reverse listener living on the gateway
#[async_trait]
pub trait RemoteListener: Send {
    /// Next inbound connection. `Ok(None)` means the gateway dropped the
    /// forwarding (EOF), not that the tunnel should stop.
    async fn accept(&mut self) -> io::Result<Option<BoxedStream>>;

    /// Tear down the listener and its SSH session
    async fn close(&mut self);
}

/// Opens remote listeners on the gateway
#[async_trait]
pub trait GatewayConnector: Send + Sync {
    /// Public key as registered with the control plane
    fn public_key(&self) -> String;

    /// Connect (with bounded retry) as `site_id` and open the remote listener.
    /// `on_attempt` is told the number of each connection attempt.
    async fn open(
        &self,
        site_id: &str,
        on_attempt: &(dyn Fn(u32) + Send + Sync),
    ) -> Result<Box<dyn RemoteListener>, ConnectionError>;
}

#[derive(Debug, Clone)]
pub struct SshSettings {
    pub endpoint: Endpoint,
    pub connect_attempts: u32,
    pub retry_delay: Duration,
    pub connect_timeout: Duration,
}

impl SshSettings {
    pub fn new(endpoint: Endpoint, connect_attempts: u32, retry_delay: Duration) -> Self {
        Self {
            endpoint,
            connect_attempts: connect_attempts.max(1),
            retry_delay,
            connect_timeout: Duration::from_secs(15),
        }
    }
}

/// Client handler collecting `forwarded-tcpip` channels
struct GatewayHandler {
    forwarded_tx: mpsc::UnboundedSender<Channel<Msg>>,
}

impl client::Handler for GatewayHandler {
    type Error = russh::Error;

    // The gateway identity is not pinned
    async fn check_server_key(
        &mut self,
        _server_public_key: &russh::keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }

    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<Msg>,
        connected_address: &str,
        connected_port: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut client::Session,
    ) -> Result<(), Self::Error> {
        debug!(
            "Forwarded connection {}:{} -> {}:{}",
            originator_address, originator_port, connected_address, connected_port
        );
        if self.forwarded_tx.send(channel).is_err() {
            debug!("Remote listener closed, dropping forwarded channel");
        }
        Ok(())
    }
}

/// Outcome of one connection attempt that did not succeed
enum AttemptError {
    Retry(String),
    Fatal(ConnectionError),
}

/// SSH implementation of [`GatewayConnector`]
pub struct SshConnector {
    identity: GatewayIdentity,
    settings: SshSettings,
    config: Arc<Config>,
}

impl SshConnector {
    pub fn new(identity: GatewayIdentity, settings: SshSettings) -> Self {
        let mut cfg = Config::default();
        // disable nagle for lower latency
        cfg.nodelay = true;
        // keepalives so a dead gateway is noticed and the listener hits EOF
        cfg.keepalive_interval = Some(Duration::from_secs(30));
        cfg.keepalive_max = 3;

        Self {
            identity,
            settings,
            config: Arc::new(cfg),
        }
    }

    async fn connect_once(&self, site_id: &str) -> Result<SshRemoteListener, AttemptError> {
        let addr = self.settings.endpoint.host_port();
        let (forwarded_tx, forwarded_rx) = mpsc::unbounded_channel();
        let handler = GatewayHandler { forwarded_tx };

        let mut handle = match tokio::time::timeout(
            self.settings.connect_timeout,
            client::connect(self.config.clone(), addr.as_str(), handler),
        )
        .await
        {
            Ok(Ok(handle)) => handle,
            Ok(Err(e)) => return Err(AttemptError::Retry(format!("Failed to connect to {}: {}", addr, e))),
            Err(_) => {
                return Err(AttemptError::Retry(format!(
                    "Connection to {} timed out after {:?}",
                    addr, self.settings.connect_timeout
                )))
            }
        };

        let hash_alg = handle
            .best_supported_rsa_hash()
            .await
            .map_err(|e| AttemptError::Retry(e.to_string()))?
            .flatten();
        let auth = match self.identity.source() {
            IdentitySource::File(key) => handle
                .authenticate_publickey(site_id, PrivateKeyWithHashAlg::new(key.clone(), hash_alg))
                .await
                .map_err(|e| AttemptError::Retry(format!("Authentication failed: {}", e)))?,
            IdentitySource::Agent(socket) => {
                authenticate_with_agent(&mut handle, site_id, &self.identity, socket, hash_alg).await?
            }
        };
        match auth {
            AuthResult::Success => {}
            AuthResult::Failure { .. } => {
                return Err(AttemptError::Fatal(ConnectionError::AuthenticationRejected(
                    site_id.to_string(),
                )))
            }
        }
        debug!("Authenticated to gateway as {}", site_id);

        handle
            .tcpip_forward(REMOTE_BIND_HOST, REMOTE_BIND_PORT)
            .await
            .map_err(|e| AttemptError::Retry(ConnectionError::ListenFailed(e.to_string()).to_string()))?;

        Ok(SshRemoteListener {
            handle,
            forwarded_rx,
            closed: false,
        })
    }
}

#[cfg(unix)]
async fn authenticate_with_agent(
    handle: &mut Handle<GatewayHandler>,
    site_id: &str,
    identity: &GatewayIdentity,
    socket: &std::path::Path,
    hash_alg: Option<HashAlg>,
) -> Result<AuthResult, AttemptError> {
    let mut agent = russh::keys::agent::client::AgentClient::connect_uds(socket)
        .await
        .map_err(|e| AttemptError::Retry(format!("SSH agent unavailable: {}", e)))?;
    handle
        .authenticate_publickey_with(site_id, identity.public().clone(), hash_alg, &mut agent)
        .await
        .map_err(|e| AttemptError::Retry(format!("Agent authentication failed: {}", e)))
}

#[cfg(not(unix))]
async fn authenticate_with_agent(
    _handle: &mut Handle<GatewayHandler>,
    _site_id: &str,
    _identity: &GatewayIdentity,
    socket: &std::path::Path,
    _hash_alg: Option<HashAlg>,
) -> Result<AuthResult, AttemptError> {
    Err(AttemptError::Fatal(ConnectionError::Identity {
        path: socket.display().to_string(),
        reason: "SSH agent sockets are only supported on unix".into(),
    }))
}

#[async_trait]
impl GatewayConnector for SshConnector {
    fn public_key(&self) -> String {
        self.identity.public_key().to_string()
    }

    async fn open(
        &self,
        site_id: &str,
        on_attempt: &(dyn Fn(u32) + Send + Sync),
    ) -> Result<Box<dyn RemoteListener>, ConnectionError> {
        let attempts = self.settings.connect_attempts;
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            on_attempt(attempt);
            info!(
                "Connecting to gateway {} as {} (attempt {}/{})",
                self.settings.endpoint, site_id, attempt, attempts
            );

            match self.connect_once(site_id).await {
                Ok(listener) => {
                    info!("Remote listener open for {}", site_id);
                    return Ok(Box::new(listener));
                }
                Err(AttemptError::Fatal(e)) => return Err(e),
                Err(AttemptError::Retry(reason)) => {
                    warn!("Gateway attempt {}/{} failed: {}", attempt, attempts, reason);
                    last_error = reason;
                }
            }

            if attempt < attempts {
                tokio::time::sleep(self.settings.retry_delay).await;
            }
        }

        Err(ConnectionError::RetriesExhausted {
            endpoint: self.settings.endpoint.uri(),
            attempts,
            last_error,
        })
    }
}

/// Remote listener backed by one SSH session
pub struct SshRemoteListener {
    handle: Handle<GatewayHandler>,
    forwarded_rx: mpsc::UnboundedReceiver<Channel<Msg>>,
    closed: bool,
}

#[async_trait]
impl RemoteListener for SshRemoteListener {
    async fn accept(&mut self) -> io::Result<Option<BoxedStream>> {
        // The sender lives in the session's handler; it is dropped with the session
        match self.forwarded_rx.recv().await {
            Some(channel) => Ok(Some(Box::new(channel.into_stream()))),
            None => Ok(None),
        }
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.forwarded_rx.close();

        if let Err(e) = self
            .handle
            .cancel_tcpip_forward(REMOTE_BIND_HOST, REMOTE_BIND_PORT)
            .await
        {
            debug!("Failed to cancel remote forwarding: {}", e);
        }
        if let Err(e) = self
            .handle
            .disconnect(russh::Disconnect::ByApplication, "", "en")
            .await
        {
            debug!("Failed to disconnect gracefully: {}", e);
        }
    }
}
