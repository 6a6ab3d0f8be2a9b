// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Loophole Contributors

// Loophole - Common Library
// Shared types, errors, configuration and the daemon protocol

pub mod config;
pub mod daemon_client;
pub mod error;
pub mod network;
pub mod protocol;
pub mod types;
pub mod urls;

pub use config::{loophole_home, CertificateMode, ClientConfig};
pub use daemon_client::DaemonClient;
pub use error::{
    AuthenticationError, ConnectionError, Error, ProtocolError, RegistrationError, RelayError,
    ServerError, TunnelError,
};
pub use network::{format_host_port, DEFAULT_LOCAL_HOST};
pub use protocol::DaemonCommand;
pub use types::{
    BasicAuthCredentials, Endpoint, LocalDirectorySpecs, LocalHttpEndpointSpecs, LocalTarget,
    ServerKind, TunnelEvent, TunnelState,
};
pub use urls::{public_urls, site_fqdn};

// Re-export commonly used external types
pub use chrono::{DateTime, Utc};
pub use uuid::Uuid;
