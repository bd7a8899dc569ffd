//! Tunnel registry — which tunnels does this pod serve, and the bridge to
//! cross-pod ownership in the coordination store.
//!
//! The local map is an advisory cache holding a [`TunnelHandle`] per locally
//! connected tunnel; the store is the source of truth for ownership, because
//! local memory cannot see other pods. Registration claims the store key
//! first and only then touches the local map, so a conflict never leaves a
//! half-registered tunnel behind. Lookups serve the local fast path without a
//! store round trip. No lock on the local map is ever held across store I/O.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::store::{ClaimOutcome, CoordinationStore, StoreError};
use crate::tunnel::connection::TunnelHandle;

/// Where a tunnel lives, from this pod's point of view.
pub enum TunnelLocation {
    /// Connected to this pod; the handle accepts requests.
    LocalActive(TunnelHandle),
    /// Another pod holds the live connection.
    OwnedElsewhere(String),
    /// No pod owns the tunnel.
    Unknown,
}

/// Why a registration was refused.
#[derive(Debug)]
pub enum RegisterError {
    /// The store says another pod already owns this tunnel. The new
    /// connection must be rejected; the agent's reconnect is the retry.
    Conflict { owner: String },
    /// The store could not be reached; ownership cannot be established.
    Store(StoreError),
}

impl std::fmt::Display for RegisterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegisterError::Conflict { owner } => {
                write!(f, "tunnel already registered to pod '{owner}'")
            }
            RegisterError::Store(e) => write!(f, "coordination store error: {e}"),
        }
    }
}

/// Per-pod authority over locally connected tunnels.
#[derive(Clone)]
pub struct TunnelRegistry {
    pod_id: Arc<str>,
    tunnels: Arc<RwLock<HashMap<String, TunnelHandle>>>,
    store: CoordinationStore,
    ownership_ttl: Duration,
}

impl TunnelRegistry {
    pub fn new(pod_id: &str, store: CoordinationStore, ownership_ttl: Duration) -> Self {
        Self {
            pod_id: Arc::from(pod_id),
            tunnels: Arc::new(RwLock::new(HashMap::new())),
            store,
            ownership_ttl,
        }
    }

    pub fn pod_id(&self) -> &str {
        &self.pod_id
    }

    /// Register a tunnel that has just reached `Active`. Claims the store key
    /// atomically; only a successful claim inserts the local entry.
    pub async fn register(&self, handle: TunnelHandle) -> Result<(), RegisterError> {
        let tunnel_id = handle.tunnel_id().to_string();
        match self
            .store
            .try_claim(&tunnel_id, &self.pod_id, self.ownership_ttl)
            .await
            .map_err(RegisterError::Store)?
        {
            ClaimOutcome::Claimed => {
                self.tunnels.write().await.insert(tunnel_id.clone(), handle);
                info!(tunnel_id = %tunnel_id, pod_id = %self.pod_id, "Tunnel registered");
                Ok(())
            }
            ClaimOutcome::OwnedBy(owner) => {
                warn!(
                    tunnel_id = %tunnel_id,
                    owner = %owner,
                    pod_id = %self.pod_id,
                    "Tunnel registration refused, owned elsewhere"
                );
                Err(RegisterError::Conflict { owner })
            }
        }
    }

    /// Remove a tunnel from local state and release its store key. The
    /// release is compare-and-delete: a newer registration by a peer pod
    /// after a reconnect is never clobbered.
    pub async fn deregister(&self, tunnel_id: &str) {
        self.tunnels.write().await.remove(tunnel_id);
        match self.store.release(tunnel_id, &self.pod_id).await {
            Ok(released) => {
                info!(tunnel_id, pod_id = %self.pod_id, released, "Tunnel deregistered");
            }
            Err(e) => {
                // The TTL is the backstop when the store is unreachable
                warn!(tunnel_id, error = %e, "Failed to release tunnel ownership key");
            }
        }
    }

    /// Locate a tunnel. Local hits never touch the store.
    pub async fn lookup(&self, tunnel_id: &str) -> Result<TunnelLocation, StoreError> {
        if let Some(handle) = self.tunnels.read().await.get(tunnel_id) {
            return Ok(TunnelLocation::LocalActive(handle.clone()));
        }
        match self.store.owner(tunnel_id).await? {
            // A key pointing at this pod without a local handle is a stale
            // leftover from a dead connection; treat it as absent.
            Some(owner) if owner != *self.pod_id => Ok(TunnelLocation::OwnedElsewhere(owner)),
            _ => Ok(TunnelLocation::Unknown),
        }
    }

    /// Keep the ownership key alive for a connected tunnel. Returns `false`
    /// only when another pod has taken the key over — the caller must close
    /// the connection. Transient store failures keep the connection up; the
    /// TTL decides if the outage lasts.
    pub async fn refresh_ownership(&self, tunnel_id: &str) -> bool {
        match self
            .store
            .refresh(tunnel_id, &self.pod_id, self.ownership_ttl)
            .await
        {
            Ok(still_owner) => still_owner,
            Err(e) => {
                warn!(tunnel_id, error = %e, "Ownership refresh failed");
                true
            }
        }
    }

    /// Number of tunnels connected to this pod.
    pub async fn local_count(&self) -> usize {
        self.tunnels.read().await.len()
    }

    /// Graceful shutdown: close every local connection and release every
    /// ownership key now, rather than leaving peers to wait out the TTL.
    pub async fn shutdown(&self) {
        let handles: Vec<TunnelHandle> = self.tunnels.read().await.values().cloned().collect();
        info!(pod_id = %self.pod_id, count = handles.len(), "Deregistering local tunnels");
        for handle in handles {
            handle.close();
            handle.drain("gateway shutting down").await;
            self.deregister(handle.tunnel_id()).await;
        }
    }
}
