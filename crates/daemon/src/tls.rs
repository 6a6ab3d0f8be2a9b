// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Loophole Contributors

// Loophole - TLS Module
// Certificate generation, loading and rustls server configuration for local servers

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use loophole_common::{CertificateMode, ServerError};
use rcgen::{CertificateParams, CustomExtension, DistinguishedName, DnType, KeyPair};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::server::ResolvesServerCert;
use rustls::sign::CertifiedKey;
use rustls::ServerConfig;
use rustls_pemfile::{certs, private_key};
use tracing::{info, warn};

use crate::acme::{AcmeResolver, AcmeSettings};

/// ALPN protocol of the ACME TLS-ALPN-01 challenge
pub const ACME_TLS_ALPN: &[u8] = b"acme-tls/1";

/// Certificates this close to expiry are replaced
const RENEW_BEFORE_DAYS: i64 = 30;

/// Where certificates for a site come from
#[derive(Debug, Clone)]
pub struct TlsSettings {
    pub mode: CertificateMode,
    pub cache_dir: PathBuf,
    pub acme_directory_url: String,
    pub acme_contact: Option<String>,
    /// Refuse TLS 1.2
    pub disable_old_ciphers: bool,
}

impl TlsSettings {
    /// Self-signed certificates, nothing persisted
    pub fn self_signed() -> Self {
        Self {
            mode: CertificateMode::SelfSigned,
            cache_dir: PathBuf::new(),
            acme_directory_url: String::new(),
            acme_contact: None,
            disable_old_ciphers: false,
        }
    }
}

/// Generate an in-memory self-signed certificate for `hostname`
pub fn generate_self_signed_cert(
    hostname: &str,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    info!("Generating self-signed TLS certificate for {}", hostname);

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, hostname);
    dn.push(DnType::OrganizationName, "Loophole Development");

    let mut params = CertificateParams::new(vec![hostname.to_string()])?;
    params.distinguished_name = dn;
    // Valid from 1 day ago (to handle clock skew)
    params.not_before = time::OffsetDateTime::now_utc() - time::Duration::days(1);
    params.not_after = time::OffsetDateTime::now_utc() + time::Duration::days(365);

    let key_pair = KeyPair::generate()?;
    let cert = params.self_signed(&key_pair)?;

    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));
    Ok((vec![cert.der().clone()], key))
}

/// Certificate answering a TLS-ALPN-01 challenge for `hostname`
pub fn acme_challenge_certificate(hostname: &str, key_authorization_digest: &[u8]) -> Result<Arc<CertifiedKey>> {
    let mut params = CertificateParams::new(vec![hostname.to_string()])?;
    params.custom_extensions = vec![CustomExtension::new_acme_identifier(key_authorization_digest)];

    let key_pair = KeyPair::generate()?;
    let cert = params.self_signed(&key_pair)?;
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));

    certified_key(vec![cert.der().clone()], &key)
}

/// Pair a chain with its signing key
pub fn certified_key(
    chain: Vec<CertificateDer<'static>>,
    key: &PrivateKeyDer<'static>,
) -> Result<Arc<CertifiedKey>> {
    let signing_key = rustls::crypto::aws_lc_rs::sign::any_supported_type(key)
        .map_err(|e| anyhow::anyhow!("Unsupported private key: {}", e))?;
    Ok(Arc::new(CertifiedKey::new(chain, signing_key)))
}

/// Parse a PEM chain and PEM private key
pub fn certified_key_from_pem(cert_pem: &str, key_pem: &str) -> Result<Arc<CertifiedKey>> {
    let chain = certs(&mut cert_pem.as_bytes())
        .collect::<Result<Vec<_>, _>>()
        .context("Failed to parse certificate chain")?;
    if chain.is_empty() {
        anyhow::bail!("No certificates found");
    }

    let key = private_key(&mut key_pem.as_bytes())
        .context("Failed to parse private key")?
        .ok_or_else(|| anyhow::anyhow!("No private key found"))?;

    certified_key(chain, &key)
}

/// Days until the certificate expires (negative once expired)
pub fn days_until_expiry(cert_der: &[u8]) -> Result<i64> {
    use x509_parser::prelude::*;

    let (_, cert) = X509Certificate::from_der(cert_der)
        .map_err(|e| anyhow::anyhow!("Failed to parse certificate DER: {}", e))?;

    let now = ::time::OffsetDateTime::now_utc().unix_timestamp();
    let not_after = cert.validity().not_after.timestamp();
    Ok((not_after - now) / 86400)
}

/// Check certificate expiry
/// Returns true if the certificate expires within 30 days or already expired
pub fn needs_renewal(cert_der: &[u8]) -> bool {
    match days_until_expiry(cert_der) {
        Ok(days) if days <= 0 => {
            warn!("TLS certificate has expired, it will be reissued");
            true
        }
        Ok(days) if days <= RENEW_BEFORE_DAYS => {
            warn!("TLS certificate expires in {} days, it will be reissued", days);
            true
        }
        Ok(_) => false,
        Err(e) => {
            warn!("Failed to check certificate expiry: {}", e);
            true
        }
    }
}

/// Cache file paths for a hostname: (certificate chain, private key)
pub fn cache_paths(cache_dir: &Path, hostname: &str) -> (PathBuf, PathBuf) {
    (
        cache_dir.join(format!("{}.crt", hostname)),
        cache_dir.join(format!("{}.key", hostname)),
    )
}

/// Load a cached certificate for `hostname` unless it is missing or expired.
/// One that is merely due for renewal is still returned.
pub fn load_cached_cert(cache_dir: &Path, hostname: &str) -> Option<Arc<CertifiedKey>> {
    let (cert_path, key_path) = cache_paths(cache_dir, hostname);
    if !cert_path.exists() || !key_path.exists() {
        return None;
    }

    let cert_pem = fs::read_to_string(&cert_path).ok()?;
    let key_pem = fs::read_to_string(&key_path).ok()?;

    let first = certs(&mut cert_pem.as_bytes()).next()?.ok()?;
    match days_until_expiry(&first) {
        Ok(days) if days > 0 => {}
        Ok(_) => {
            warn!("Cached certificate {} has expired", cert_path.display());
            return None;
        }
        Err(e) => {
            warn!("Ignoring unreadable cached certificate {}: {}", cert_path.display(), e);
            return None;
        }
    }

    match certified_key_from_pem(&cert_pem, &key_pem) {
        Ok(key) => {
            info!("Using cached certificate from {}", cert_path.display());
            Some(key)
        }
        Err(e) => {
            warn!("Ignoring unreadable cached certificate {}: {}", cert_path.display(), e);
            None
        }
    }
}

/// Store an issued certificate, key file restricted to the owner
pub fn store_cached_cert(cache_dir: &Path, hostname: &str, cert_pem: &str, key_pem: &str) -> Result<()> {
    fs::create_dir_all(cache_dir).context("Failed to create certificate cache directory")?;
    let (cert_path, key_path) = cache_paths(cache_dir, hostname);

    fs::write(&cert_path, cert_pem).context("Failed to write certificate file")?;
    fs::write(&key_path, key_pem).context("Failed to write private key file")?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&key_path, fs::Permissions::from_mode(0o600))
            .context("Failed to set private key permissions")?;
    }

    info!("Certificate cached at {}", cert_path.display());
    Ok(())
}

/// Build the rustls config for a site's local server
pub fn create_tls_config(hostname: &str, settings: &TlsSettings) -> Result<Arc<ServerConfig>, ServerError> {
    // Process-wide default for clients built elsewhere (ACME, pre-warm)
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
    let builder = ServerConfig::builder_with_provider(provider);
    let builder = if settings.disable_old_ciphers {
        builder.with_protocol_versions(&[&rustls::version::TLS13])
    } else {
        builder.with_protocol_versions(rustls::DEFAULT_VERSIONS)
    }
    .map_err(|e| ServerError::Tls(e.to_string()))?
    .with_no_client_auth();

    let mut config = match settings.mode {
        CertificateMode::SelfSigned => {
            let (chain, key) =
                generate_self_signed_cert(hostname).map_err(|e| ServerError::Tls(e.to_string()))?;
            builder
                .with_single_cert(chain, key)
                .map_err(|e| ServerError::Tls(e.to_string()))?
        }
        CertificateMode::Acme => {
            let resolver = AcmeResolver::new(
                hostname,
                AcmeSettings {
                    directory_url: settings.acme_directory_url.clone(),
                    contact: settings.acme_contact.clone(),
                    cache_dir: settings.cache_dir.clone(),
                },
            )?;
            let resolver: Arc<dyn ResolvesServerCert> = Arc::new(resolver);
            builder.with_cert_resolver(resolver)
        }
    };

    // Enable HTTP/2 and HTTP/1.1
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    if settings.mode == CertificateMode::Acme {
        config.alpn_protocols.push(ACME_TLS_ALPN.to_vec());
    }

    Ok(Arc::new(config))
}
