//! Local slug → tunnel_id cache.
//!
//! Saves a Control Plane round trip on every public request. An unexpired
//! entry is authoritative; a miss or expired entry forces a synchronous
//! resolution before routing proceeds. A Control Plane failure on a miss is a
//! resolution failure — never a fall back to stale data, since a stale
//! binding would misroute public traffic. Eviction is pull-based: expiry is
//! checked on lookup and the slot is overwritten by the next resolution.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::control_plane::{ControlPlaneClient, TunnelStatus};
use crate::error::GatewayError;

struct CacheEntry {
    tunnel_id: String,
    expires_at: Instant,
}

/// Short-TTL cache over Control Plane slug resolution.
#[derive(Clone)]
pub struct SlugCache {
    entries: Arc<Mutex<HashMap<String, CacheEntry>>>,
    ttl: Duration,
}

impl SlugCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            ttl,
        }
    }

    /// Resolve a slug, consulting the Control Plane only on a miss. Only
    /// `active` tunnels are cached; an inactive resolution fails the request
    /// without polluting the cache.
    pub async fn resolve(
        &self,
        slug: &str,
        control_plane: &ControlPlaneClient,
    ) -> Result<String, GatewayError> {
        if let Some(tunnel_id) = self.get(slug).await {
            debug!(slug, tunnel_id = %tunnel_id, "Slug cache hit");
            return Ok(tunnel_id);
        }

        let resolution = control_plane
            .resolve_slug(slug)
            .await
            .map_err(|e| GatewayError::ResolutionFailed {
                detail: e.to_string(),
            })?;

        let Some(resolution) = resolution else {
            return Err(GatewayError::SlugNotFound {
                slug: slug.to_string(),
            });
        };

        if resolution.status != TunnelStatus::Active {
            return Err(GatewayError::TunnelInactive {
                slug: slug.to_string(),
                status: resolution.status,
            });
        }

        self.insert(slug, &resolution.tunnel_id).await;
        Ok(resolution.tunnel_id)
    }

    async fn get(&self, slug: &str) -> Option<String> {
        let mut entries = self.entries.lock().await;
        match entries.get(slug) {
            Some(entry) if entry.expires_at > Instant::now() => Some(entry.tunnel_id.clone()),
            Some(_) => {
                entries.remove(slug);
                None
            }
            None => None,
        }
    }

    async fn insert(&self, slug: &str, tunnel_id: &str) {
        let mut entries = self.entries.lock().await;
        entries.insert(
            slug.to_string(),
            CacheEntry {
                tunnel_id: tunnel_id.to_string(),
                expires_at: Instant::now() + self.ttl,
            },
        );
    }
}
