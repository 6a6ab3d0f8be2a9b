// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Loophole Contributors

// SSH identity used to authenticate against the gateway

use std::fmt::Display;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use loophole_common::ConnectionError;
use russh::keys::key::safe_rng;
use russh::keys::ssh_key::private::RsaKeypair;
use russh::keys::ssh_key::LineEnding;
use russh::keys::{load_public_key, load_secret_key, PrivateKey, PublicKey, PublicKeyBase64};
use tracing::{debug, info};

/// Size of a freshly generated RSA identity
pub const GENERATED_KEY_BITS: usize = 4096;

/// Where signatures for the gateway come from
#[derive(Clone)]
pub enum IdentitySource {
    /// Key read from the identity file
    File(Arc<PrivateKey>),
    /// Passphrase-protected key held by the SSH agent listening on this socket
    Agent(PathBuf),
}

/// Signing source plus the public half in `"<type> <base64>"` form
#[derive(Clone)]
pub struct GatewayIdentity {
    source: IdentitySource,
    public: PublicKey,
    public_key: String,
}

impl GatewayIdentity {
    /// Load the identity file, generating an RSA key pair when it does not
    /// exist. Passphrase-protected keys are used through the agent named by
    /// `SSH_AUTH_SOCK`.
    pub async fn load_or_generate(path: &Path) -> Result<Self, ConnectionError> {
        let agent_socket = std::env::var_os("SSH_AUTH_SOCK").map(PathBuf::from);
        Self::load_with_agent(path, agent_socket.as_deref()).await
    }

    pub async fn load_with_agent(
        path: &Path,
        agent_socket: Option<&Path>,
    ) -> Result<Self, ConnectionError> {
        if !path.exists() {
            let key = generate_identity(path, GENERATED_KEY_BITS)?;
            return Ok(Self::from_key(key));
        }

        match load_secret_key(path, None) {
            Ok(key) => {
                info!("Loaded SSH identity from {}", path.display());
                Ok(Self::from_key(key))
            }
            Err(russh::keys::Error::KeyIsEncrypted) => {
                debug!("{} is passphrase-protected, asking the SSH agent", path.display());
                Self::from_agent(path, agent_socket).await
            }
            Err(e) => Err(identity_error(path, e)),
        }
    }

    pub fn from_key(key: PrivateKey) -> Self {
        let public = key.public_key().clone();
        Self {
            public_key: render_public_key(&public),
            source: IdentitySource::File(Arc::new(key)),
            public,
        }
    }

    async fn from_agent(path: &Path, agent_socket: Option<&Path>) -> Result<Self, ConnectionError> {
        let Some(socket) = agent_socket else {
            return Err(identity_error(
                path,
                "key is passphrase-protected and no SSH agent is available",
            ));
        };

        let public_path = public_key_path(path);
        let public = load_public_key(&public_path).map_err(|e| identity_error(&public_path, e))?;

        if !agent_holds(socket, &public)
            .await
            .map_err(|e| identity_error(path, format!("SSH agent unavailable: {}", e)))?
        {
            return Err(identity_error(
                path,
                "key is passphrase-protected and not loaded in the SSH agent",
            ));
        }

        info!("Using SSH identity {} through the SSH agent", path.display());
        Ok(Self {
            public_key: render_public_key(&public),
            source: IdentitySource::Agent(socket.to_path_buf()),
            public,
        })
    }

    /// Public key as sent to the registration API
    pub fn public_key(&self) -> &str {
        &self.public_key
    }

    pub fn public(&self) -> &PublicKey {
        &self.public
    }

    pub fn source(&self) -> &IdentitySource {
        &self.source
    }
}

/// Write a new RSA key pair to `path` (mode 0600) and `path.pub`
pub fn generate_identity(path: &Path, bits: usize) -> Result<PrivateKey, ConnectionError> {
    info!("No SSH identity at {}, generating a {}-bit RSA key", path.display(), bits);

    let keypair = RsaKeypair::random(&mut safe_rng(), bits).map_err(|e| identity_error(path, e))?;
    let key = PrivateKey::from(keypair);

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| identity_error(path, e))?;
    }
    key.write_openssh_file(path, LineEnding::LF)
        .map_err(|e| identity_error(path, e))?;

    let public_path = public_key_path(path);
    key.public_key()
        .write_openssh_file(&public_path)
        .map_err(|e| identity_error(&public_path, e))?;

    Ok(key)
}

fn public_key_path(path: &Path) -> PathBuf {
    let mut public = path.as_os_str().to_owned();
    public.push(".pub");
    PathBuf::from(public)
}

fn render_public_key(public: &PublicKey) -> String {
    format!("{} {}", public.algorithm().as_str(), public.public_key_base64())
}

fn identity_error(path: &Path, reason: impl Display) -> ConnectionError {
    ConnectionError::Identity {
        path: path.display().to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(unix)]
async fn agent_holds(socket: &Path, public: &PublicKey) -> Result<bool, russh::keys::Error> {
    let mut agent = russh::keys::agent::client::AgentClient::connect_uds(socket).await?;
    let held = agent.request_identities().await?;
    Ok(held.iter().any(|key| key.key_data() == public.key_data()))
}

#[cfg(not(unix))]
async fn agent_holds(_socket: &Path, _public: &PublicKey) -> Result<bool, russh::keys::Error> {
    Ok(false)
}
