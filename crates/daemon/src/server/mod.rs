// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Loophole Contributors

// Loophole - Local Server Factory
// Builds the loopback TLS server the relay dials for every inbound connection

pub mod auth;
pub mod files;
pub mod proxy;
pub mod webdav;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{middleware, Router};
use axum_server::tls_rustls::RustlsConfig;
use axum_server::Handle;
use loophole_common::network::loopback;
use loophole_common::{site_fqdn, BasicAuthCredentials, LocalTarget, ServerError};
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info};

use crate::tls::{create_tls_config, TlsSettings};
use auth::{basic_auth_middleware, BasicAuthState};

/// Grace period for in-flight requests on shutdown
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Options shared by every local server of an engine
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Public parent domain, sites live at `{site_id}.{domain}`
    pub domain: String,
    pub tls: TlsSettings,
    pub disable_proxy_error_page: bool,
    pub disable_directory_listing: bool,
}

pub struct LocalServerFactory {
    options: ServerOptions,
}

impl LocalServerFactory {
    pub fn new(options: ServerOptions) -> Self {
        Self { options }
    }

    /// Assemble the router for `target`, with basic auth and request tracing
    pub fn router(
        &self,
        target: &LocalTarget,
        site_id: &str,
        basic_auth: Option<&BasicAuthCredentials>,
    ) -> Result<Router, ServerError> {
        let site_host = site_fqdn(site_id, &self.options.domain);

        let mut router = match target {
            LocalTarget::Http(http) => {
                proxy::router(http, &site_host, !self.options.disable_proxy_error_page)?
            }
            LocalTarget::Directory(dir) => {
                files::router(&dir.path, self.options.disable_directory_listing)
            }
            LocalTarget::WebDav(dir) => webdav::router(&dir.path),
        };

        if let Some(credentials) = basic_auth {
            debug!("Basic auth enabled for {} (user '{}')", site_host, credentials.username);
            let state = Arc::new(BasicAuthState::new(credentials, &site_host));
            router = router.layer(middleware::from_fn_with_state(state, basic_auth_middleware));
        }

        Ok(router.layer(TraceLayer::new_for_http()))
    }

    /// Build the server for `target` and start it on an OS-assigned loopback port
    pub async fn build(
        &self,
        target: &LocalTarget,
        site_id: &str,
        basic_auth: Option<&BasicAuthCredentials>,
    ) -> Result<LocalServer, ServerError> {
        target.validate().map_err(ServerError::InvalidTarget)?;

        let router = self.router(target, site_id, basic_auth)?;
        let site_host = site_fqdn(site_id, &self.options.domain);
        let tls_config = create_tls_config(&site_host, &self.options.tls)?;

        // axum_server takes a std listener
        let listener = std::net::TcpListener::bind(SocketAddr::new(loopback(), 0))
            .map_err(|e| ServerError::Bind(e.to_string()))?;
        listener
            .set_nonblocking(true)
            .map_err(|e| ServerError::Bind(e.to_string()))?;
        let addr = listener
            .local_addr()
            .map_err(|e| ServerError::Bind(e.to_string()))?;

        let handle = Handle::new();
        let server = axum_server::from_tcp_rustls(listener, RustlsConfig::from_config(tls_config))
            .handle(handle.clone());

        let task = tokio::spawn(async move {
            if let Err(e) = server.serve(router.into_make_service()).await {
                error!("Local server on {} failed: {}", addr, e);
            }
        });

        info!("Local {:?} server for {} listening on {}", target.kind(), site_host, addr);
        Ok(LocalServer {
            addr,
            handle,
            task: Some(task),
        })
    }
}

/// A running local TLS server
pub struct LocalServer {
    addr: SocketAddr,
    handle: Handle,
    task: Option<JoinHandle<()>>,
}

impl LocalServer {
    /// Address the relay dials
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Stop accepting, let in-flight requests finish within the grace period
    pub async fn shutdown(mut self) {
        self.handle.graceful_shutdown(Some(SHUTDOWN_GRACE));
        if let Some(task) = self.task.take() {
            if tokio::time::timeout(SHUTDOWN_GRACE + Duration::from_secs(1), task)
                .await
                .is_err()
            {
                debug!("Local server on {} did not stop in time", self.addr);
            }
        }
        debug!("Local server on {} stopped", self.addr);
    }
}

impl Drop for LocalServer {
    fn drop(&mut self) {
        if self.task.is_some() {
            self.handle.shutdown();
        }
    }
}
