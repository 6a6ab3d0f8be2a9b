// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Loophole Contributors

// Loophole - ACME Module
// On-demand certificate issuance with the TLS-ALPN-01 challenge.
//
// The challenge is answered on the site's own TLS listener, so validation
// traffic from the CA reaches us through the tunnel like any other client.
// Issuance starts on the first handshake for the site hostname and runs in the
// background; handshakes that arrive before it completes are refused. A failed
// attempt is not retried before ISSUANCE_BACKOFF has passed. A certificate close
// to expiry keeps being served while its replacement is issued.

use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, ChallengeType, Identifier, NewAccount,
    NewOrder, OrderStatus,
};
use loophole_common::ServerError;
use rcgen::{CertificateParams, DistinguishedName, KeyPair};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use tracing::{debug, error, info, warn};

use crate::tls::{
    acme_challenge_certificate, certified_key_from_pem, load_cached_cert, needs_renewal,
    store_cached_cert, ACME_TLS_ALPN,
};

const ACCOUNT_FILE: &str = "account.json";
/// Quiet period after a failed issuance
const ISSUANCE_BACKOFF: Duration = Duration::from_secs(5 * 60);
/// How often handshakes look at the served certificate's expiry
const RENEWAL_CHECK_INTERVAL: Duration = Duration::from_secs(60 * 60);
const ORDER_POLL_ATTEMPTS: u32 = 10;
const CERTIFICATE_POLL_ATTEMPTS: u32 = 10;

#[derive(Debug, Clone)]
pub struct AcmeSettings {
    pub directory_url: String,
    pub contact: Option<String>,
    pub cache_dir: PathBuf,
}

#[derive(Debug)]
struct AcmeState {
    domain: String,
    settings: AcmeSettings,
    certificate: RwLock<Option<Arc<CertifiedKey>>>,
    challenge: RwLock<Option<Arc<CertifiedKey>>>,
    issuing: AtomicBool,
    last_failure: Mutex<Option<Instant>>,
    next_renewal_check: Mutex<Instant>,
    runtime: tokio::runtime::Handle,
}

/// Certificate resolver for one site hostname
#[derive(Debug)]
pub struct AcmeResolver {
    state: Arc<AcmeState>,
}

impl AcmeResolver {
    /// Must be called from within the tokio runtime
    pub fn new(domain: &str, settings: AcmeSettings) -> Result<Self, ServerError> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| ServerError::Tls(format!("ACME needs a tokio runtime: {}", e)))?;

        let cached = load_cached_cert(&settings.cache_dir, domain);
        if cached.is_none() {
            info!("No usable cached certificate for {}, it will be issued on first use", domain);
        }

        Ok(Self {
            state: Arc::new(AcmeState {
                domain: domain.to_string(),
                settings,
                certificate: RwLock::new(cached),
                challenge: RwLock::new(None),
                issuing: AtomicBool::new(false),
                last_failure: Mutex::new(None),
                next_renewal_check: Mutex::new(Instant::now()),
                runtime,
            }),
        })
    }

    pub fn has_certificate(&self) -> bool {
        self.state.current().is_some()
    }
}

impl ResolvesServerCert for AcmeResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let is_challenge = client_hello
            .alpn()
            .map(|mut protocols| protocols.any(|p| p == ACME_TLS_ALPN))
            .unwrap_or(false);

        if is_challenge {
            debug!("Answering TLS-ALPN-01 challenge for {}", self.state.domain);
            return self.state.challenge.read().ok()?.clone();
        }

        if let Some(name) = client_hello.server_name() {
            if !name.eq_ignore_ascii_case(&self.state.domain) {
                warn!("Refusing handshake for unknown host {}", name);
                return None;
            }
        }

        if let Some(cert) = self.state.current() {
            self.state.check_renewal(&cert);
            return Some(cert);
        }

        self.state.clone().start_issuance();
        None
    }
}

impl AcmeState {
    fn current(&self) -> Option<Arc<CertifiedKey>> {
        self.certificate.read().ok().and_then(|guard| guard.clone())
    }

    fn set_challenge(&self, cert: Option<Arc<CertifiedKey>>) {
        if let Ok(mut guard) = self.challenge.write() {
            *guard = cert;
        }
    }

    /// Start a background renewal when the served certificate is about to expire
    fn check_renewal(self: &Arc<Self>, cert: &CertifiedKey) {
        let now = Instant::now();
        match self.next_renewal_check.lock() {
            Ok(mut next) if now >= *next => *next = now + RENEWAL_CHECK_INTERVAL,
            _ => return,
        }

        let Some(leaf) = cert.cert.first() else {
            return;
        };
        if needs_renewal(leaf.as_ref()) {
            info!("Certificate for {} is due for renewal", self.domain);
            self.clone().start_issuance();
        }
    }

    fn in_backoff(&self) -> bool {
        self.last_failure
            .lock()
            .ok()
            .and_then(|guard| *guard)
            .map(|failed_at| failed_at.elapsed() < ISSUANCE_BACKOFF)
            .unwrap_or(false)
    }

    fn record_outcome(&self, failed: bool) {
        if let Ok(mut guard) = self.last_failure.lock() {
            *guard = failed.then(Instant::now);
        }
    }

    fn start_issuance(self: Arc<Self>) {
        if self.in_backoff() {
            debug!("Certificate issuance for {} failed recently, not retrying yet", self.domain);
            return;
        }
        if self.issuing.swap(true, Ordering::SeqCst) {
            return;
        }

        let runtime = self.runtime.clone();
        runtime.spawn(async move {
            info!("Requesting certificate for {}", self.domain);
            match issue(&self).await {
                Ok(cert) => {
                    if let Ok(mut guard) = self.certificate.write() {
                        *guard = Some(cert);
                    }
                    self.record_outcome(false);
                    info!("Certificate for {} issued", self.domain);
                }
                Err(e) => {
                    self.record_outcome(true);
                    error!("Certificate issuance for {} failed: {:#}", self.domain, e);
                }
            }
            self.set_challenge(None);
            self.issuing.store(false, Ordering::SeqCst);
        });
    }
}

async fn load_or_create_account(state: &AcmeState) -> Result<Account> {
    let path = state.settings.cache_dir.join(ACCOUNT_FILE);

    if let Ok(contents) = tokio::fs::read_to_string(&path).await {
        match serde_json::from_str::<AccountCredentials>(&contents) {
            Ok(credentials) => {
                debug!("Using ACME account from {}", path.display());
                return Ok(Account::from_credentials(credentials).await?);
            }
            Err(e) => warn!("Ignoring unreadable ACME account {}: {}", path.display(), e),
        }
    }

    let contact = state
        .settings
        .contact
        .as_ref()
        .map(|email| format!("mailto:{}", email));
    let contacts: Vec<&str> = contact.iter().map(String::as_str).collect();

    let (account, credentials) = Account::create(
        &NewAccount {
            contact: &contacts,
            terms_of_service_agreed: true,
            only_return_existing: false,
        },
        &state.settings.directory_url,
        None,
    )
    .await
    .context("Failed to create ACME account")?;

    fs::create_dir_all(&state.settings.cache_dir)
        .context("Failed to create certificate cache directory")?;
    fs::write(&path, serde_json::to_string_pretty(&credentials)?)
        .context("Failed to store ACME account")?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o600))
            .context("Failed to set ACME account permissions")?;
    }

    info!("Created ACME account");
    Ok(account)
}

async fn issue(state: &AcmeState) -> Result<Arc<CertifiedKey>> {
    let account = load_or_create_account(state).await?;

    let identifiers = [Identifier::Dns(state.domain.clone())];
    let mut order = account
        .new_order(&NewOrder {
            identifiers: &identifiers,
        })
        .await
        .context("Failed to create ACME order")?;

    let authorizations = order.authorizations().await?;
    for authz in &authorizations {
        match authz.status {
            AuthorizationStatus::Pending => {}
            AuthorizationStatus::Valid => continue,
            _ => anyhow::bail!("Authorization for {} is {:?}", state.domain, authz.status),
        }

        let challenge = authz
            .challenges
            .iter()
            .find(|c| c.r#type == ChallengeType::TlsAlpn01)
            .ok_or_else(|| anyhow::anyhow!("CA offered no tls-alpn-01 challenge"))?;

        let key_authorization = order.key_authorization(challenge);
        let challenge_cert =
            acme_challenge_certificate(&state.domain, key_authorization.digest().as_ref())?;
        state.set_challenge(Some(challenge_cert));

        order.set_challenge_ready(&challenge.url).await?;
    }

    let mut delay = Duration::from_millis(250);
    let mut ready = false;
    for _ in 0..ORDER_POLL_ATTEMPTS {
        tokio::time::sleep(delay).await;
        let order_state = order.refresh().await?;
        match order_state.status {
            OrderStatus::Ready => {
                ready = true;
                break;
            }
            OrderStatus::Invalid => anyhow::bail!("ACME order for {} became invalid", state.domain),
            _ => {}
        }
        delay = (delay * 2).min(Duration::from_secs(10));
    }
    if !ready {
        anyhow::bail!("ACME order for {} did not become ready", state.domain);
    }

    let key_pair = KeyPair::generate()?;
    let mut params = CertificateParams::new(vec![state.domain.clone()])?;
    params.distinguished_name = DistinguishedName::new();
    let csr = params.serialize_request(&key_pair)?;
    order.finalize(csr.der()).await?;

    let mut chain_pem = None;
    for _ in 0..CERTIFICATE_POLL_ATTEMPTS {
        if let Some(pem) = order.certificate().await? {
            chain_pem = Some(pem);
            break;
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
    let chain_pem = chain_pem
        .ok_or_else(|| anyhow::anyhow!("CA did not deliver the certificate for {}", state.domain))?;

    let key_pem = key_pair.serialize_pem();
    if let Err(e) = store_cached_cert(&state.settings.cache_dir, &state.domain, &chain_pem, &key_pem) {
        warn!("Certificate issued but not cached: {:#}", e);
    }

    certified_key_from_pem(&chain_pem, &key_pem)
}
