//! Control Plane client — tunnel credential validation and slug resolution.
//!
//! The Control Plane is the external authority for two questions:
//!
//! - is this `(tunnel_id, token)` pair allowed to connect, and what is the
//!   tunnel's status? (`POST /api/tunnels/validate`)
//! - which tunnel does this public slug route to? (`GET /api/tunnels/resolve/{slug}`)
//!
//! A mock backend answers both from an in-memory directory, for development
//! without a Control Plane deployment and for tests. The mock also counts
//! resolution calls so cache behavior can be asserted.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::ControlPlaneConfig;

/// Tunnel status as reported by the Control Plane. The gateway never upgrades
/// a status locally; anything but `active` rejects the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelStatus {
    Active,
    Expired,
    Revoked,
    /// Anything the Control Plane reports that we don't recognize, plus
    /// locally synthesized rejections (bad token, unknown tunnel).
    Invalid,
}

// Manual impl so unrecognized status strings land on Invalid instead of
// failing the whole response.
impl<'de> Deserialize<'de> for TunnelStatus {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ok(match s.as_str() {
            "active" => TunnelStatus::Active,
            "expired" => TunnelStatus::Expired,
            "revoked" => TunnelStatus::Revoked,
            _ => TunnelStatus::Invalid,
        })
    }
}

impl TunnelStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TunnelStatus::Active => "active",
            TunnelStatus::Expired => "expired",
            TunnelStatus::Revoked => "revoked",
            TunnelStatus::Invalid => "invalid",
        }
    }
}

/// Result of a credential check.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct TunnelValidation {
    pub valid: bool,
    pub status: TunnelStatus,
}

/// Result of a slug lookup.
#[derive(Debug, Clone, Deserialize)]
pub struct SlugResolution {
    pub tunnel_id: String,
    pub status: TunnelStatus,
}

/// Errors from Control Plane calls. These are never retried here — a
/// validation failure rejects the connection attempt, a resolution failure is
/// surfaced to the HTTP caller.
#[derive(Debug)]
pub enum ControlPlaneError {
    /// HTTP transport error (connection refused, timeout, DNS failure, etc.).
    Request(reqwest::Error),
    /// The Control Plane answered with something we can't interpret.
    Protocol(String),
}

impl std::fmt::Display for ControlPlaneError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ControlPlaneError::Request(e) => write!(f, "control plane request failed: {e}"),
            ControlPlaneError::Protocol(msg) => write!(f, "control plane protocol error: {msg}"),
        }
    }
}

/// A tunnel entry in the mock directory.
#[derive(Debug, Clone)]
pub struct MockTunnel {
    pub token: String,
    pub status: TunnelStatus,
}

/// In-memory stand-in for the Control Plane.
#[derive(Debug, Clone, Default)]
pub struct MockDirectory {
    tunnels: HashMap<String, MockTunnel>,
    slugs: HashMap<String, String>,
    resolve_calls: Arc<AtomicUsize>,
}

impl MockDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tunnel with its expected token and status.
    pub fn add_tunnel(&mut self, tunnel_id: &str, token: &str, status: TunnelStatus) {
        self.tunnels.insert(
            tunnel_id.to_string(),
            MockTunnel {
                token: token.to_string(),
                status,
            },
        );
    }

    /// Bind a public slug to a tunnel.
    pub fn add_slug(&mut self, slug: &str, tunnel_id: &str) {
        self.slugs.insert(slug.to_string(), tunnel_id.to_string());
    }

    /// Number of slug resolutions served so far (cache-miss counter).
    pub fn resolve_calls(&self) -> usize {
        self.resolve_calls.load(Ordering::Relaxed)
    }
}

enum Backend {
    Http { http: reqwest::Client, base_url: String },
    Mock(MockDirectory),
}

/// Client for the Control Plane, HTTP or mock depending on configuration.
pub struct ControlPlaneClient {
    backend: Backend,
}

impl ControlPlaneClient {
    /// Build the client from configuration. `mock = true` serves everything
    /// from an empty in-memory directory (populate via [`ControlPlaneClient::mock`]
    /// for tests that need specific entries).
    pub fn from_config(config: &ControlPlaneConfig) -> Self {
        if config.mock {
            info!("Control plane client in mock mode — no external calls");
            return Self::mock(MockDirectory::new());
        }
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.request_timeout_secs))
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .expect("Failed to build HTTP client");
        let base_url = config.url.trim_end_matches('/').to_string();
        info!(base_url = %base_url, "Control plane client initialized");
        Self {
            backend: Backend::Http { http, base_url },
        }
    }

    /// Build a mock client over the given directory.
    pub fn mock(directory: MockDirectory) -> Self {
        Self {
            backend: Backend::Mock(directory),
        }
    }

    /// Check that the Control Plane is reachable. Any HTTP answer counts —
    /// this only verifies connectivity for the readiness probe.
    pub async fn verify(&self) -> Result<(), ControlPlaneError> {
        match &self.backend {
            Backend::Mock(_) => Ok(()),
            Backend::Http { http, base_url } => {
                http.get(format!("{base_url}/api/health"))
                    .send()
                    .await
                    .map_err(ControlPlaneError::Request)?;
                Ok(())
            }
        }
    }

    /// Validate a tunnel's credentials. Called once per connection attempt,
    /// before any registry interaction. A 401/404 from the Control Plane is a
    /// definitive "no", not a transport failure.
    pub async fn validate_tunnel(
        &self,
        tunnel_id: &str,
        token: &str,
    ) -> Result<TunnelValidation, ControlPlaneError> {
        match &self.backend {
            Backend::Mock(directory) => {
                let validation = match directory.tunnels.get(tunnel_id) {
                    Some(entry) if entry.token == token => TunnelValidation {
                        valid: true,
                        status: entry.status,
                    },
                    _ => TunnelValidation {
                        valid: false,
                        status: TunnelStatus::Invalid,
                    },
                };
                Ok(validation)
            }
            Backend::Http { http, base_url } => {
                let resp = http
                    .post(format!("{base_url}/api/tunnels/validate"))
                    .json(&serde_json::json!({"tunnel_id": tunnel_id, "token": token}))
                    .send()
                    .await
                    .map_err(ControlPlaneError::Request)?;

                match resp.status().as_u16() {
                    200 => resp
                        .json::<TunnelValidation>()
                        .await
                        .map_err(|e| ControlPlaneError::Protocol(e.to_string())),
                    401 | 404 => {
                        warn!(tunnel_id, status = resp.status().as_u16(), "Tunnel validation denied");
                        Ok(TunnelValidation {
                            valid: false,
                            status: TunnelStatus::Invalid,
                        })
                    }
                    other => Err(ControlPlaneError::Protocol(format!(
                        "unexpected status {other} from validate"
                    ))),
                }
            }
        }
    }

    /// Resolve a public slug to its tunnel. `Ok(None)` means the slug is not
    /// registered; transport failures are errors the cache must not paper over
    /// with stale data.
    pub async fn resolve_slug(
        &self,
        slug: &str,
    ) -> Result<Option<SlugResolution>, ControlPlaneError> {
        match &self.backend {
            Backend::Mock(directory) => {
                directory.resolve_calls.fetch_add(1, Ordering::Relaxed);
                let resolution = directory.slugs.get(slug).map(|tunnel_id| {
                    let status = directory
                        .tunnels
                        .get(tunnel_id)
                        .map_or(TunnelStatus::Active, |t| t.status);
                    SlugResolution {
                        tunnel_id: tunnel_id.clone(),
                        status,
                    }
                });
                Ok(resolution)
            }
            Backend::Http { http, base_url } => {
                let resp = http
                    .get(format!("{base_url}/api/tunnels/resolve/{slug}"))
                    .send()
                    .await
                    .map_err(ControlPlaneError::Request)?;

                match resp.status().as_u16() {
                    200 => {
                        let resolution = resp
                            .json::<SlugResolution>()
                            .await
                            .map_err(|e| ControlPlaneError::Protocol(e.to_string()))?;
                        info!(slug, tunnel_id = %resolution.tunnel_id, "Slug resolved");
                        Ok(Some(resolution))
                    }
                    404 => Ok(None),
                    other => Err(ControlPlaneError::Protocol(format!(
                        "unexpected status {other} from resolve"
                    ))),
                }
            }
        }
    }
}
