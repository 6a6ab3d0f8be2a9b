// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Loophole Contributors

// Loophole - Daemon Control Listener
// Loopback line protocol for starting, listing and stopping tunnels

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::StreamExt;
use loophole_common::network::loopback;
use loophole_common::protocol::{format_ps, TUNNEL_STARTED, TUNNEL_STOPPED, UNKNOWN_MESSAGE};
use loophole_common::{
    DaemonCommand, LocalHttpEndpointSpecs, LocalTarget, ProtocolError, TunnelError, Uuid,
};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{FramedRead, LinesCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::registry::TunnelRegistry;
use crate::tunnel::{TunnelEngine, TunnelRequest};

/// Longest command line accepted
const MAX_LINE_LENGTH: usize = 1024;

/// How long shutdown waits for tunnels to wind down
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// How long a control client may take to send its command line
pub const CONTROL_READ_TIMEOUT: Duration = Duration::from_secs(10);

/// The daemon: one engine, many tunnels
#[derive(Clone)]
pub struct Daemon {
    engine: TunnelEngine,
    registry: TunnelRegistry,
    read_timeout: Duration,
}

impl Daemon {
    pub fn new(engine: TunnelEngine) -> Self {
        Self {
            engine,
            registry: TunnelRegistry::new(),
            read_timeout: CONTROL_READ_TIMEOUT,
        }
    }

    pub fn with_read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = read_timeout;
        self
    }

    pub fn registry(&self) -> &TunnelRegistry {
        &self.registry
    }

    /// Bind the control port on loopback
    pub async fn bind(port: u16) -> Result<TcpListener> {
        let addr = SocketAddr::new(loopback(), port);
        TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind daemon control port {}", addr))
    }

    /// Accept control connections until `shutdown` is cancelled.
    /// Each connection is handled in its own task.
    pub async fn serve(&self, listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
        info!("Daemon listening on {}", listener.local_addr()?);

        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => {
                    debug!("Control connection from {}", peer);
                    let daemon = self.clone();
                    tokio::spawn(async move {
                        daemon.handle_connection(stream).await;
                    });
                }
                Err(e) => error!("Failed to accept control connection: {}", e),
            }
        }

        self.shutdown().await;
        Ok(())
    }

    async fn handle_connection(&self, stream: TcpStream) {
        let (read, mut write) = stream.into_split();
        let mut lines = FramedRead::new(read, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));

        let next = match tokio::time::timeout(self.read_timeout, lines.next()).await {
            Ok(next) => next,
            Err(_) => {
                debug!("Control client sent nothing within {:?}, closing", self.read_timeout);
                let _ = write.shutdown().await;
                return;
            }
        };

        let response = match next {
            Some(Ok(line)) => self.handle_line(&line).await,
            Some(Err(e)) => {
                warn!("Unreadable control message: {}", e);
                format!("{}\n", e)
            }
            None => return,
        };

        if let Err(e) = write.write_all(response.as_bytes()).await {
            debug!("Failed to answer control connection: {}", e);
        }
        let _ = write.shutdown().await;
    }

    /// Execute one request line and produce the response text
    pub async fn handle_line(&self, line: &str) -> String {
        let command = match DaemonCommand::parse(line) {
            Ok(command) => command,
            Err(ProtocolError::Unknown(_)) | Err(ProtocolError::Empty) => {
                debug!("Unknown control message: {:?}", line);
                return UNKNOWN_MESSAGE.to_string();
            }
            Err(e) => return format!("{}\n", e),
        };

        match command {
            DaemonCommand::Http {
                port,
                local_host,
                site_id,
            } => match self.start_http(port, local_host, site_id).await {
                Ok(_) => TUNNEL_STARTED.to_string(),
                Err(e) => format!("{}\n", e),
            },
            DaemonCommand::Ps => {
                let tunnels = self.registry.list().await;
                format_ps(tunnels.iter().map(|(id, site)| (id, site.as_str())))
            }
            DaemonCommand::Stop { tunnel_id } => {
                if self.registry.stop(&tunnel_id).await {
                    TUNNEL_STOPPED.to_string()
                } else {
                    format!("No running tunnel with ID {}\n", tunnel_id)
                }
            }
        }
    }

    /// Start an HTTP tunnel and keep it in the registry until it ends
    async fn start_http(
        &self,
        port: u16,
        local_host: String,
        site_id: Option<String>,
    ) -> Result<Uuid, TunnelError> {
        // Checked before anything goes over the network
        if let Some(site) = &site_id {
            self.registry.reserve(site).await?;
        }

        let target = LocalTarget::Http(LocalHttpEndpointSpecs {
            host: local_host,
            port,
            use_tls: false,
            path: String::new(),
        });
        let request = TunnelRequest::new(target).with_site_id(site_id.clone());

        let handle = match self.engine.start(request).await {
            Ok(handle) => handle,
            Err(e) => {
                if let Some(site) = &site_id {
                    self.registry.release(site).await;
                }
                return Err(e);
            }
        };

        let tunnel_id = handle.tunnel_id();
        if let Err(e) = self
            .registry
            .insert(
                tunnel_id,
                handle.site_id(),
                site_id.as_deref(),
                handle.cancellation(),
            )
            .await
        {
            handle.stop();
            let _ = handle.wait().await;
            return Err(e);
        }

        let registry = self.registry.clone();
        tokio::spawn(async move {
            match handle.wait().await {
                Ok(()) => info!("Tunnel {} finished", tunnel_id),
                Err(e) => warn!("Tunnel {} ended with error: {}", tunnel_id, e),
            }
            registry.remove(&tunnel_id).await;
        });

        Ok(tunnel_id)
    }

    /// Stop every tunnel and wait briefly for them to wind down
    pub async fn shutdown(&self) {
        self.registry.stop_all().await;

        let deadline = tokio::time::Instant::now() + SHUTDOWN_TIMEOUT;
        while !self.registry.is_empty().await {
            if tokio::time::Instant::now() >= deadline {
                warn!("Some tunnels did not stop within {:?}", SHUTDOWN_TIMEOUT);
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        info!("All tunnels stopped");
    }
}

/// Resolve on Ctrl+C or SIGTERM
pub async fn shutdown_signal() {
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("Received Ctrl+C, shutting down"),
                    _ = sigterm.recv() => info!("Received SIGTERM, shutting down"),
                }
                return;
            }
            Err(e) => warn!("Failed to install SIGTERM handler: {}", e),
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl+C: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Received Ctrl+C, shutting down");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::tests::options;
    use crate::tunnel::tests::{FakeGateway, FakeRegistrar};
    use crate::tunnel::EngineSettings;
    use loophole_common::protocol::{NO_RUNNING_TUNNELS, PS_HEADER};
    use loophole_common::DaemonClient;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;
    use tokio::sync::broadcast;

    fn daemon(registrar: Arc<FakeRegistrar>, gateway: Arc<FakeGateway>) -> Daemon {
        let (events, _) = broadcast::channel(64);
        let settings = EngineSettings {
            server: options(),
            prewarm_certificates: false,
        };
        Daemon::new(TunnelEngine::new(registrar, gateway, settings, events))
    }

    async fn wait_empty(daemon: &Daemon) {
        for _ in 0..200 {
            if daemon.registry().is_empty().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("registry did not drain");
    }

    #[tokio::test]
    async fn test_ps_lists_running_tunnels() {
        let daemon = daemon(FakeRegistrar::new("auto01"), FakeGateway::new(10));

        assert_eq!(daemon.handle_line("PS").await, NO_RUNNING_TUNNELS);
        assert_eq!(daemon.handle_line("HTTP,3000,127.0.0.1,alpha\n").await, TUNNEL_STARTED);
        assert_eq!(daemon.handle_line("HTTP,3001,,beta\n").await, TUNNEL_STARTED);

        let response = daemon.handle_line("PS\n").await;
        assert!(response.starts_with(PS_HEADER));
        let mut rows: Vec<(String, String)> = response[PS_HEADER.len()..]
            .lines()
            .map(|line| {
                let (id, site) = line.split_once('\t').unwrap();
                (id.to_string(), site.to_string())
            })
            .collect();
        rows.sort_by(|a, b| a.1.cmp(&b.1));
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].1, "alpha");
        assert_eq!(rows[1].1, "beta");

        let mut listed = daemon.registry().list().await;
        listed.sort_by(|a, b| a.1.cmp(&b.1));
        assert_eq!(rows[0].0, listed[0].0.to_string());
        assert_eq!(rows[1].0, listed[1].0.to_string());

        daemon.shutdown().await;
        assert!(daemon.registry().is_empty().await);
    }

    #[tokio::test]
    async fn test_duplicate_site_rejected_without_network() {
        let registrar = FakeRegistrar::new("auto01");
        let gateway = FakeGateway::new(10);
        let daemon = daemon(registrar.clone(), gateway.clone());

        assert_eq!(daemon.handle_line("HTTP,3000,127.0.0.1,alpha").await, TUNNEL_STARTED);
        assert_eq!(registrar.calls.load(Ordering::SeqCst), 1);

        let response = daemon.handle_line("HTTP,4000,127.0.0.1,alpha").await;
        assert_eq!(response, format!("{}\n", TunnelError::SiteInUse("alpha".into())));
        assert_eq!(registrar.calls.load(Ordering::SeqCst), 1);
        assert_eq!(gateway.opens.load(Ordering::SeqCst), 1);

        daemon.shutdown().await;
    }

    #[tokio::test]
    async fn test_stop_command() {
        let daemon = daemon(FakeRegistrar::new("auto01"), FakeGateway::new(10));
        assert_eq!(daemon.handle_line("HTTP,3000,,").await, TUNNEL_STARTED);

        let (tunnel_id, site_id) = daemon.registry().list().await.remove(0);
        assert_eq!(site_id, "auto01");

        let response = daemon.handle_line(&format!("STOP,{}", tunnel_id)).await;
        assert_eq!(response, TUNNEL_STOPPED);
        wait_empty(&daemon).await;
        assert_eq!(daemon.handle_line("PS").await, NO_RUNNING_TUNNELS);

        let response = daemon.handle_line(&format!("STOP,{}", tunnel_id)).await;
        assert!(response.starts_with("No running tunnel"));
    }

    #[tokio::test]
    async fn test_failed_start_releases_site() {
        let registrar = FakeRegistrar::new("auto01");
        let daemon = daemon(registrar.clone(), FakeGateway::new(0));

        let response = daemon.handle_line("HTTP,3000,127.0.0.1,alpha").await;
        assert!(response.starts_with("Could not connect to the gateway"));
        assert!(response.ends_with('\n'));
        assert_eq!(daemon.handle_line("PS").await, NO_RUNNING_TUNNELS);

        // Not blocked by a leftover reservation
        let response = daemon.handle_line("HTTP,3000,127.0.0.1,alpha").await;
        assert!(response.starts_with("Could not connect to the gateway"));
        assert_eq!(registrar.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_protocol_errors() {
        let daemon = daemon(FakeRegistrar::new("auto01"), FakeGateway::new(10));

        assert_eq!(daemon.handle_line("FOO,1,2").await, "Unknown message");
        assert_eq!(daemon.handle_line("").await, "Unknown message");

        let response = daemon.handle_line("HTTP,abc,127.0.0.1,alpha").await;
        assert!(response.starts_with("Malformed HTTP message"));
        let response = daemon.handle_line("HTTP,0,127.0.0.1,alpha").await;
        assert!(response.starts_with("Malformed HTTP message"));
    }

    #[tokio::test]
    async fn test_over_tcp() {
        let daemon = daemon(FakeRegistrar::new("auto01"), FakeGateway::new(10));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();

        let server = {
            let daemon = daemon.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { daemon.serve(listener, shutdown).await })
        };

        let client = DaemonClient::with_addr(addr);
        let response = client.send(&DaemonCommand::Ps).await.unwrap();
        assert_eq!(response, NO_RUNNING_TUNNELS);

        let response = client
            .send(&DaemonCommand::Http {
                port: 3000,
                local_host: "127.0.0.1".into(),
                site_id: Some("gamma1".into()),
            })
            .await
            .unwrap();
        assert_eq!(response, TUNNEL_STARTED);

        // The tunnel outlives the control connection
        let response = client.send(&DaemonCommand::Ps).await.unwrap();
        assert!(response.contains("\tgamma1\n"));

        // Raw unknown line, answered without newline
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(b"HELLO\n").await.unwrap();
        let mut answer = String::new();
        tokio::io::AsyncReadExt::read_to_string(&mut stream, &mut answer)
            .await
            .unwrap();
        assert_eq!(answer, "Unknown message");

        shutdown.cancel();
        server.await.unwrap().unwrap();
        assert!(daemon.registry().is_empty().await);
    }

    #[tokio::test]
    async fn test_idle_control_client_is_dropped() {
        let daemon = daemon(FakeRegistrar::new("auto01"), FakeGateway::new(10))
            .with_read_timeout(Duration::from_millis(50));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();

        let server = {
            let daemon = daemon.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { daemon.serve(listener, shutdown).await })
        };

        // Connect and never send a line
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let mut answer = String::new();
        tokio::time::timeout(
            Duration::from_secs(5),
            tokio::io::AsyncReadExt::read_to_string(&mut stream, &mut answer),
        )
        .await
        .expect("daemon kept the idle connection open")
        .unwrap();
        assert!(answer.is_empty());

        // Other clients are still served
        let response = DaemonClient::with_addr(addr).send(&DaemonCommand::Ps).await.unwrap();
        assert_eq!(response, NO_RUNNING_TUNNELS);

        shutdown.cancel();
        server.await.unwrap().unwrap();
    }
}
