// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Loophole Contributors

// Loophole - Tunnel Registry
// Tunnels running under the daemon, by tunnel ID and by site ID

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use loophole_common::{TunnelError, Uuid};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

struct TunnelEntry {
    site_id: String,
    cancel: CancellationToken,
}

#[derive(Default)]
struct RegistryState {
    tunnels: HashMap<Uuid, TunnelEntry>,
    sites: HashMap<String, Uuid>,
    /// Site IDs claimed by a start that has not finished yet
    reserved: HashSet<String>,
}

impl RegistryState {
    fn site_taken(&self, site_id: &str) -> bool {
        self.sites.contains_key(site_id) || self.reserved.contains(site_id)
    }
}

/// Shared registry of active tunnels
///
/// Every mutation goes through one write lock, so a check for a site ID and
/// its reservation cannot interleave with another request for the same site.
#[derive(Clone, Default)]
pub struct TunnelRegistry {
    state: Arc<RwLock<RegistryState>>,
}

impl TunnelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `site_id` for a tunnel about to start
    pub async fn reserve(&self, site_id: &str) -> Result<(), TunnelError> {
        let mut state = self.state.write().await;
        if state.site_taken(site_id) {
            return Err(TunnelError::SiteInUse(site_id.to_string()));
        }
        state.reserved.insert(site_id.to_string());
        debug!("Reserved site {}", site_id);
        Ok(())
    }

    /// Give up a reservation after a failed start
    pub async fn release(&self, site_id: &str) {
        if self.state.write().await.reserved.remove(site_id) {
            debug!("Released site {}", site_id);
        }
    }

    /// Record a started tunnel. `requested` is the reservation it was started
    /// under, which the assigned site ID replaces.
    pub async fn insert(
        &self,
        tunnel_id: Uuid,
        site_id: &str,
        requested: Option<&str>,
        cancel: CancellationToken,
    ) -> Result<(), TunnelError> {
        let mut state = self.state.write().await;
        if let Some(requested) = requested {
            state.reserved.remove(requested);
        }
        if state.sites.contains_key(site_id) {
            return Err(TunnelError::SiteInUse(site_id.to_string()));
        }

        state.sites.insert(site_id.to_string(), tunnel_id);
        state.tunnels.insert(
            tunnel_id,
            TunnelEntry {
                site_id: site_id.to_string(),
                cancel,
            },
        );
        info!("Tunnel {} registered for site {}", tunnel_id, site_id);
        Ok(())
    }

    /// Forget a finished tunnel
    pub async fn remove(&self, tunnel_id: &Uuid) -> Option<String> {
        let mut state = self.state.write().await;
        let entry = state.tunnels.remove(tunnel_id)?;
        state.sites.remove(&entry.site_id);
        debug!("Tunnel {} removed from registry", tunnel_id);
        Some(entry.site_id)
    }

    /// Signal a tunnel to stop; `false` if it is not running
    pub async fn stop(&self, tunnel_id: &Uuid) -> bool {
        match self.state.read().await.tunnels.get(tunnel_id) {
            Some(entry) => {
                entry.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub async fn stop_all(&self) {
        let state = self.state.read().await;
        info!("Stopping {} tunnel(s)", state.tunnels.len());
        for entry in state.tunnels.values() {
            entry.cancel.cancel();
        }
    }

    /// `(tunnelID, siteID)` of every active tunnel
    pub async fn list(&self) -> Vec<(Uuid, String)> {
        self.state
            .read()
            .await
            .tunnels
            .iter()
            .map(|(id, entry)| (*id, entry.site_id.clone()))
            .collect()
    }

    pub async fn contains_site(&self, site_id: &str) -> bool {
        self.state.read().await.sites.contains_key(site_id)
    }

    pub async fn is_empty(&self) -> bool {
        self.state.read().await.tunnels.is_empty()
    }
}
