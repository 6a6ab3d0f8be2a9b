// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Loophole Contributors

// Common types for Loophole

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::{Host, Url};
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::error::Error;
use crate::network::format_host_port;

/// A `protocol://host:port/path` tuple
///
/// Serialized as its URI string so it can live in the config file as
/// `api_endpoint = "https://api.loophole.cloud:443"`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Endpoint {
    pub protocol: String,
    pub host: String,
    pub port: u16,
    pub path: String,
}

impl Endpoint {
    pub fn new(protocol: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            protocol: protocol.into(),
            host: host.into(),
            port,
            path: String::new(),
        }
    }

    /// Parse `protocol://[user@]host[:port][/path][?query]`
    ///
    /// The port may be left out for schemes with a well-known one
    /// (`http`, `https`). User info, query and fragment are not kept.
    pub fn parse(uri: &str) -> Result<Self, Error> {
        let invalid = |reason: &str| Error::Config(format!("Endpoint '{}' {}", uri, reason));

        let url = Url::parse(uri).map_err(|e| invalid(&format!("is not a valid URI: {}", e)))?;

        let host = match url.host() {
            Some(Host::Ipv6(addr)) => addr.to_string(),
            Some(host) => host.to_string(),
            None => return Err(invalid("is missing a host")),
        };
        if host.is_empty() {
            return Err(invalid("is missing a host"));
        }

        let port = url
            .port_or_known_default()
            .ok_or_else(|| invalid("is missing a port"))?;

        let path = match url.path() {
            "/" => String::new(),
            path => path.to_string(),
        };

        Ok(Self {
            protocol: url.scheme().to_string(),
            host,
            port,
            path,
        })
    }

    /// Full URI form, e.g. `https://api.loophole.cloud:443/v1`
    pub fn uri(&self) -> String {
        format!(
            "{}://{}{}",
            self.protocol,
            format_host_port(&self.host, self.port),
            self.path
        )
    }

    /// Bare `host:port` form suitable for dialing
    pub fn host_port(&self) -> String {
        format_host_port(&self.host, self.port)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.uri())
    }
}

impl TryFrom<String> for Endpoint {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Endpoint::parse(&value)
    }
}

impl From<Endpoint> for String {
    fn from(endpoint: Endpoint) -> Self {
        endpoint.uri()
    }
}

/// HTTP basic auth credentials guarding a local server
#[derive(Clone)]
pub struct BasicAuthCredentials {
    pub username: String,
    pub password: Zeroizing<String>,
}

impl BasicAuthCredentials {
    /// Returns credentials only when both parts are present and non-empty
    pub fn from_parts(username: Option<String>, password: Option<String>) -> Option<Self> {
        match (username, password) {
            (Some(username), Some(password)) if !username.is_empty() && !password.is_empty() => {
                Some(Self {
                    username,
                    password: Zeroizing::new(password),
                })
            }
            _ => None,
        }
    }
}

impl fmt::Debug for BasicAuthCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BasicAuthCredentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// A local HTTP service to expose
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalHttpEndpointSpecs {
    pub host: String,
    pub port: u16,
    /// The local service itself speaks HTTPS
    pub use_tls: bool,
    /// Backend path every request path is appended to, empty for `/`
    pub path: String,
}

/// A local directory to expose
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalDirectorySpecs {
    pub path: PathBuf,
}

/// Which local server gets built for a tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerKind {
    Proxy,
    StaticFiles,
    WebDav,
}

/// What a tunnel exposes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalTarget {
    Http(LocalHttpEndpointSpecs),
    Directory(LocalDirectorySpecs),
    WebDav(LocalDirectorySpecs),
}

impl LocalTarget {
    pub fn kind(&self) -> ServerKind {
        match self {
            LocalTarget::Http(_) => ServerKind::Proxy,
            LocalTarget::Directory(_) => ServerKind::StaticFiles,
            LocalTarget::WebDav(_) => ServerKind::WebDav,
        }
    }

    /// Check the fields each kind requires
    pub fn validate(&self) -> Result<(), String> {
        match self {
            LocalTarget::Http(http) => {
                if http.host.trim().is_empty() {
                    return Err("Local host cannot be empty".to_string());
                }
                if http.port == 0 {
                    return Err("Local port cannot be 0".to_string());
                }
            }
            LocalTarget::Directory(dir) | LocalTarget::WebDav(dir) => {
                if dir.path.as_os_str().is_empty() {
                    return Err("Directory path cannot be empty".to_string());
                }
                if !dir.path.is_dir() {
                    return Err(format!("'{}' is not a directory", dir.path.display()));
                }
            }
        }
        Ok(())
    }
}

impl fmt::Display for LocalTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LocalTarget::Http(http) => {
                let scheme = if http.use_tls { "https" } else { "http" };
                write!(
                    f,
                    "{}://{}{}",
                    scheme,
                    format_host_port(&http.host, http.port),
                    http.path
                )
            }
            LocalTarget::Directory(dir) => write!(f, "{}", dir.path.display()),
            LocalTarget::WebDav(dir) => write!(f, "{} (WebDAV)", dir.path.display()),
        }
    }
}

/// Lifecycle of a single tunnel
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TunnelState {
    Idle,
    Registering,
    ServerStarting,
    Connecting,
    Accepting,
    Reconnecting, // gateway dropped the forwarding channel
    Stopped,
    Failed(String),
}

impl TunnelState {
    /// Check if the tunnel has finished for good
    pub fn is_terminal(&self) -> bool {
        matches!(self, TunnelState::Stopped | TunnelState::Failed(_))
    }

    /// Check if the tunnel is serving or about to serve again
    pub fn is_running(&self) -> bool {
        matches!(self, TunnelState::Accepting | TunnelState::Reconnecting)
    }
}

/// Events emitted by the tunnel engine
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TunnelEvent {
    Registering { id: Uuid, timestamp: DateTime<Utc> },

    Registered {
        id: Uuid,
        site_id: String,
        timestamp: DateTime<Utc>,
    },

    /// Local TLS server listening
    ServerStarted {
        id: Uuid,
        port: u16,
        timestamp: DateTime<Utc>,
    },

    Connecting {
        id: Uuid,
        attempt: u32,
        timestamp: DateTime<Utc>,
    },

    Accepting {
        id: Uuid,
        urls: Vec<String>,
        timestamp: DateTime<Utc>,
    },

    Reconnecting { id: Uuid, timestamp: DateTime<Utc> },

    /// One inbound connection could not reach the local server
    RelayFailed {
        id: Uuid,
        error: String,
        timestamp: DateTime<Utc>,
    },

    Stopped { id: Uuid, timestamp: DateTime<Utc> },

    Failed {
        id: Uuid,
        error: String,
        timestamp: DateTime<Utc>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_parse_and_format() {
        let endpoint = Endpoint::parse("https://api.loophole.cloud:443").unwrap();
        assert_eq!(endpoint.protocol, "https");
        assert_eq!(endpoint.host, "api.loophole.cloud");
        assert_eq!(endpoint.port, 443);
        assert_eq!(endpoint.path, "");
        assert_eq!(endpoint.uri(), "https://api.loophole.cloud:443");
        assert_eq!(endpoint.host_port(), "api.loophole.cloud:443");

        let with_path = Endpoint::parse("http://127.0.0.1:4000/v1").unwrap();
        assert_eq!(with_path.path, "/v1");
        assert_eq!(with_path.to_string(), "http://127.0.0.1:4000/v1");

        let ipv6 = Endpoint::parse("ssh://[::1]:8022").unwrap();
        assert_eq!(ipv6.host, "::1");
        assert_eq!(ipv6.host_port(), "[::1]:8022");
    }

    #[test]
    fn test_endpoint_parse_defaults_and_extras() {
        let api = Endpoint::parse("https://api.loophole.cloud").unwrap();
        assert_eq!(api.port, 443);
        assert_eq!(api.uri(), "https://api.loophole.cloud:443");

        let plain = Endpoint::parse("http://localhost/").unwrap();
        assert_eq!(plain.port, 80);
        assert_eq!(plain.path, "");

        let with_user = Endpoint::parse("ssh://user@gw.example:22").unwrap();
        assert_eq!(with_user.host, "gw.example");
        assert_eq!(with_user.port, 22);
        assert_eq!(with_user.host_port(), "gw.example:22");

        let with_query = Endpoint::parse("https://api.example:443?x=1").unwrap();
        assert_eq!(with_query.host, "api.example");
        assert_eq!(with_query.port, 443);
        assert_eq!(with_query.path, "");

        let upper = Endpoint::parse("HTTPS://API.Example.COM:8443/v1").unwrap();
        assert_eq!(upper.protocol, "https");
        assert_eq!(upper.host, "api.example.com");
        assert_eq!(upper.path, "/v1");
    }

    #[test]
    fn test_endpoint_parse_rejects_incomplete() {
        assert!(Endpoint::parse("gateway.loophole.host:8022").is_err());
        assert!(Endpoint::parse("/just/a/path").is_err());
        assert!(Endpoint::parse("ssh://gateway.loophole.host").is_err());
        assert!(Endpoint::parse("ssh://gateway.loophole.host:http").is_err());
        assert!(Endpoint::parse("ssh://:8022").is_err());
    }

    #[test]
    fn test_basic_auth_requires_both_parts() {
        assert!(BasicAuthCredentials::from_parts(Some("user".into()), None).is_none());
        assert!(BasicAuthCredentials::from_parts(None, Some("secret".into())).is_none());
        assert!(BasicAuthCredentials::from_parts(Some("".into()), Some("secret".into())).is_none());

        let creds = BasicAuthCredentials::from_parts(Some("user".into()), Some("secret".into()))
            .unwrap();
        assert_eq!(creds.username, "user");
        assert!(!format!("{:?}", creds).contains("secret"));
    }

    #[test]
    fn test_local_target_validation() {
        let http = LocalTarget::Http(LocalHttpEndpointSpecs {
            host: "127.0.0.1".into(),
            port: 3000,
            use_tls: false,
            path: String::new(),
        });
        assert!(http.validate().is_ok());
        assert_eq!(http.kind(), ServerKind::Proxy);
        assert_eq!(http.to_string(), "http://127.0.0.1:3000");

        let no_port = LocalTarget::Http(LocalHttpEndpointSpecs {
            host: "127.0.0.1".into(),
            port: 0,
            use_tls: false,
            path: String::new(),
        });
        assert!(no_port.validate().is_err());

        let missing_dir = LocalTarget::Directory(LocalDirectorySpecs {
            path: PathBuf::from("/definitely/not/here"),
        });
        assert!(missing_dir.validate().is_err());
    }

    #[test]
    fn test_tunnel_state_flags() {
        assert!(TunnelState::Stopped.is_terminal());
        assert!(TunnelState::Failed("boom".into()).is_terminal());
        assert!(!TunnelState::Accepting.is_terminal());
        assert!(TunnelState::Reconnecting.is_running());
        assert!(!TunnelState::Connecting.is_running());
    }
}
