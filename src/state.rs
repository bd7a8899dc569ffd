//! Shared application state passed to every handler via Axum's `State` extractor.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Instant;

use crate::config::Config;
use crate::control_plane::ControlPlaneClient;
use crate::registry::TunnelRegistry;
use crate::slug_cache::SlugCache;

/// Shared application state for the gateway.
#[derive(Clone)]
pub struct AppState {
    /// Immutable configuration loaded at startup.
    pub config: Arc<Config>,
    /// This pod's identity in the coordination store (`{hostname}-{uuid8}`).
    pub pod_id: Arc<str>,
    /// Monotonic instant when the server started (for uptime calculation).
    pub start_time: Instant,
    /// Locally connected tunnels plus the cross-pod ownership bridge.
    pub registry: TunnelRegistry,
    /// Short-TTL slug → tunnel_id cache over the Control Plane.
    pub slug_cache: SlugCache,
    /// Control Plane client (HTTP or mock).
    pub control_plane: Arc<ControlPlaneClient>,
    /// Flipped once startup connectivity checks pass; gates `/health/ready`.
    pub ready: Arc<AtomicBool>,
}

/// Generate a pod id unique across restarts and replicas: the hostname plus
/// an 8-character random suffix, so two pods on the same host (or the same
/// pod restarted) never collide in the coordination store.
pub fn generate_pod_id() -> String {
    let hostname = std::fs::read_to_string("/proc/sys/kernel/hostname")
        .map(|s| s.trim().to_string())
        .ok()
        .filter(|s| !s.is_empty())
        .or_else(|| std::env::var("HOSTNAME").ok())
        .unwrap_or_else(|| "localhost".to_string());
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{hostname}-{}", &suffix[..8])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pod_ids_are_unique() {
        let a = generate_pod_id();
        let b = generate_pod_id();
        assert_ne!(a, b);
        // hostname, a dash, then the 8-char suffix
        assert!(a.rsplit('-').next().unwrap().len() == 8);
    }
}
