// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Loophole Contributors

// Loophole - Client Configuration
// Endpoints, local paths and feature switches shared by the CLI and daemon

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::protocol::DEFAULT_DAEMON_PORT;
use crate::types::Endpoint;

/// Let's Encrypt production directory
pub const LETS_ENCRYPT_DIRECTORY: &str = "https://acme-v02.api.letsencrypt.org/directory";

/// Per-user state directory (`~/.loophole`)
pub fn loophole_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".loophole")
}

/// Expand a leading `~` in a configured path
pub fn expand_path(path: &Path) -> PathBuf {
    let raw = path.to_string_lossy();
    PathBuf::from(shellexpand::tilde(&raw).into_owned())
}

/// Where TLS certificates for the local server come from
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum CertificateMode {
    /// Issued through ACME for `{siteID}.{domain}`
    #[default]
    Acme,
    /// Generated locally on every start, never persisted
    SelfSigned,
}

/// Client configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClientConfig {
    /// Control-plane API base endpoint
    #[serde(default = "default_api_endpoint")]
    pub api_endpoint: Endpoint,

    /// SSH gateway endpoint
    #[serde(default = "default_gateway_endpoint")]
    pub gateway_endpoint: Endpoint,

    /// Domain public sites live under
    #[serde(default = "default_domain")]
    pub domain: String,

    /// SSH private key used for the gateway
    #[serde(default = "default_identity_file")]
    pub identity_file: PathBuf,

    /// OAuth token file written by the login flow
    #[serde(default = "default_token_file")]
    pub token_file: PathBuf,

    #[serde(default = "default_oauth_token_url")]
    pub oauth_token_url: String,

    #[serde(default = "default_oauth_client_id")]
    pub oauth_client_id: String,

    /// Certificate cache, keyed by site hostname
    #[serde(default = "default_cert_cache_dir")]
    pub cert_cache_dir: PathBuf,

    #[serde(default)]
    pub certificate_mode: CertificateMode,

    #[serde(default = "default_acme_directory_url")]
    pub acme_directory_url: String,

    /// Contact e-mail registered with the ACME account
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acme_contact: Option<String>,

    /// Loopback port of the daemon control protocol
    #[serde(default = "default_daemon_port")]
    pub daemon_port: u16,

    /// Gateway connect attempts before giving up
    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: u32,

    /// Delay between gateway connect attempts in seconds
    #[serde(default = "default_connect_retry_delay_secs")]
    pub connect_retry_delay_secs: u64,

    /// Refuse TLS below 1.3 on the local server
    #[serde(default)]
    pub disable_old_ciphers: bool,

    /// Serve a bare 502 instead of the HTML error page when the backend is down
    #[serde(default)]
    pub disable_proxy_error_page: bool,

    /// Replace directory listings with a placeholder page
    #[serde(default)]
    pub disable_directory_listing: bool,

    /// Request the public URL once after start so certificate issuance begins early
    #[serde(default = "default_prewarm_certificates")]
    pub prewarm_certificates: bool,
}

fn default_api_endpoint() -> Endpoint {
    Endpoint::new("https", "api.loophole.cloud", 443)
}

fn default_gateway_endpoint() -> Endpoint {
    Endpoint::new("ssh", "gateway.loophole.host", 8022)
}

fn default_domain() -> String {
    "loophole.site".to_string()
}

fn default_identity_file() -> PathBuf {
    loophole_home().join(".ssh").join("id_rsa")
}

fn default_token_file() -> PathBuf {
    loophole_home().join("tokens.json")
}

fn default_oauth_token_url() -> String {
    "https://loophole.eu.auth0.com/oauth/token".to_string()
}

fn default_oauth_client_id() -> String {
    "9ocnSAnfJSb6C52waL8xcPidCkRhUwBs".to_string()
}

fn default_cert_cache_dir() -> PathBuf {
    loophole_home().join("certs")
}

fn default_acme_directory_url() -> String {
    LETS_ENCRYPT_DIRECTORY.to_string()
}

fn default_daemon_port() -> u16 {
    DEFAULT_DAEMON_PORT
}

fn default_connect_attempts() -> u32 {
    5
}

fn default_connect_retry_delay_secs() -> u64 {
    10
}

fn default_prewarm_certificates() -> bool {
    true
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_endpoint: default_api_endpoint(),
            gateway_endpoint: default_gateway_endpoint(),
            domain: default_domain(),
            identity_file: default_identity_file(),
            token_file: default_token_file(),
            oauth_token_url: default_oauth_token_url(),
            oauth_client_id: default_oauth_client_id(),
            cert_cache_dir: default_cert_cache_dir(),
            certificate_mode: CertificateMode::default(),
            acme_directory_url: default_acme_directory_url(),
            acme_contact: None,
            daemon_port: default_daemon_port(),
            connect_attempts: default_connect_attempts(),
            connect_retry_delay_secs: default_connect_retry_delay_secs(),
            disable_old_ciphers: false,
            disable_proxy_error_page: false,
            disable_directory_listing: false,
            prewarm_certificates: default_prewarm_certificates(),
        }
    }
}

impl ClientConfig {
    /// Settings for a locally running control plane and gateway
    pub fn development() -> Self {
        Self {
            api_endpoint: Endpoint::new("http", "127.0.0.1", 4000),
            gateway_endpoint: Endpoint::new("ssh", "127.0.0.1", 8022),
            certificate_mode: CertificateMode::SelfSigned,
            prewarm_certificates: false,
            ..Self::default()
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.domain.trim().is_empty() {
            anyhow::bail!("domain cannot be empty");
        }
        if self.api_endpoint.port == 0 || self.gateway_endpoint.port == 0 {
            anyhow::bail!("API and gateway endpoints need a non-zero port");
        }
        if self.daemon_port == 0 {
            anyhow::bail!("daemon_port cannot be 0");
        }
        if self.connect_attempts == 0 {
            anyhow::bail!("connect_attempts must be at least 1");
        }
        Ok(())
    }

    /// Load configuration from the default location, writing defaults if missing
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    /// Load configuration from a specific file, writing defaults if missing
    pub fn load_from(config_path: &Path) -> Result<Self> {
        if !config_path.exists() {
            info!("No configuration found, using defaults");
            info!("Configuration will be saved to: {}", config_path.display());
            let config = Self::default();
            config.save_to(config_path)?;
            return Ok(config);
        }

        let contents =
            fs::read_to_string(config_path).context("Failed to read configuration")?;

        let config: Self = toml::from_str(&contents).context("Failed to parse configuration")?;

        config
            .validate()
            .context("Configuration validation failed")?;

        info!("Loaded configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Save configuration to the default location
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    /// Save configuration to a specific file (0600 on unix)
    pub fn save_to(&self, config_path: &Path) -> Result<()> {
        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent).context("Failed to create configuration directory")?;
        }

        let contents = toml::to_string_pretty(self).context("Failed to serialize configuration")?;
        fs::write(config_path, contents).context("Failed to write configuration")?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = fs::Permissions::from_mode(0o600);
            fs::set_permissions(config_path, perms)
                .context("Failed to set configuration file permissions")?;
        }

        Ok(())
    }

    /// Get the path to the configuration file
    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        Ok(config_dir.join("loophole").join("config.toml"))
    }

    pub fn identity_path(&self) -> PathBuf {
        expand_path(&self.identity_file)
    }

    pub fn token_path(&self) -> PathBuf {
        expand_path(&self.token_file)
    }

    pub fn cert_cache_path(&self) -> PathBuf {
        expand_path(&self.cert_cache_dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = ClientConfig::default();
        assert_eq!(config.api_endpoint.uri(), "https://api.loophole.cloud:443");
        assert_eq!(config.gateway_endpoint.host_port(), "gateway.loophole.host:8022");
        assert_eq!(config.domain, "loophole.site");
        assert_eq!(config.daemon_port, 9977);
        assert_eq!(config.connect_attempts, 5);
        assert_eq!(config.connect_retry_delay_secs, 10);
        assert_eq!(config.certificate_mode, CertificateMode::Acme);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_development_config() {
        let config = ClientConfig::development();
        assert_eq!(config.api_endpoint.uri(), "http://127.0.0.1:4000");
        assert_eq!(config.gateway_endpoint.host_port(), "127.0.0.1:8022");
        assert_eq!(config.certificate_mode, CertificateMode::SelfSigned);
        assert!(!config.prewarm_certificates);
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");

        let mut config = ClientConfig::development();
        config.domain = "example.test".to_string();
        config.acme_contact = Some("ops@example.test".to_string());
        config.save_to(&path).unwrap();

        let loaded = ClientConfig::load_from(&path).unwrap();
        assert_eq!(loaded.domain, "example.test");
        assert_eq!(loaded.api_endpoint, config.api_endpoint);
        assert_eq!(loaded.acme_contact.as_deref(), Some("ops@example.test"));

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn test_missing_fields_use_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "domain = \"tunnels.test\"\n").unwrap();

        let loaded = ClientConfig::load_from(&path).unwrap();
        assert_eq!(loaded.domain, "tunnels.test");
        assert_eq!(loaded.daemon_port, 9977);
        assert_eq!(loaded.gateway_endpoint, default_gateway_endpoint());
    }

    #[test]
    fn test_load_writes_defaults_when_missing() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let config = ClientConfig::load_from(&path).unwrap();
        assert!(path.exists());
        assert_eq!(config.domain, "loophole.site");
    }

    #[test]
    fn test_invalid_config_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "domain = \"\"\n").unwrap();
        assert!(ClientConfig::load_from(&path).is_err());

        fs::write(&path, "gateway_endpoint = \"gateway.example:8022\"\n").unwrap();
        assert!(ClientConfig::load_from(&path).is_err());
    }

    #[test]
    fn test_expand_path() {
        let expanded = expand_path(Path::new("~/.loophole/certs"));
        assert!(!expanded.to_string_lossy().starts_with('~'));
        assert_eq!(expand_path(Path::new("/tmp/x")), PathBuf::from("/tmp/x"));
    }
}
