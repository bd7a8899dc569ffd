//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables** — `EDGEGATE_LISTEN`, `EDGEGATE_REDIS_URL`,
//!    `EDGEGATE_CONTROL_PLANE_URL`
//! 2. **Config file** — path via `--config <path>`, or `edgegate.toml` in CWD
//! 3. **Compiled defaults** — see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [server]
//! listen = "0.0.0.0:8080"
//!
//! [tunnel]
//! heartbeat_interval_secs = 10   # ping cadence; pong grace is 2x this
//! request_timeout_secs = 30      # routed request deadline
//! ownership_ttl_secs = 300       # coordination store key TTL
//! outbound_queue_size = 64       # frames buffered per connection
//!
//! [slug_cache]
//! ttl_secs = 60
//!
//! [control_plane]
//! url = "http://localhost:9000"
//! mock = false                   # true = in-process directory, no HTTP
//! request_timeout_secs = 5
//!
//! [store]
//! redis_url = "redis://localhost:6379"
//!
//! [logging]
//! level = "info"
//! ```

use serde::Deserialize;
use std::path::Path;

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub tunnel: TunnelConfig,
    #[serde(default)]
    pub slug_cache: SlugCacheConfig,
    #[serde(default)]
    pub control_plane: ControlPlaneConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// HTTP server settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Socket address to bind (default `0.0.0.0:8080`).
    #[serde(default = "default_listen")]
    pub listen: String,
}

/// Tunnel connection and routing settings.
#[derive(Debug, Clone, Deserialize)]
pub struct TunnelConfig {
    /// Seconds between heartbeat pings to agents (default 10). Connections
    /// whose last pong is older than twice this are closed.
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
    /// Deadline in seconds for a routed request's correlated response
    /// (default 30).
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// TTL in seconds on `tunnel:{tunnel_id}` ownership keys (default 300).
    /// Refreshed by each connection's heartbeat; must exceed the heartbeat
    /// interval by a wide margin.
    #[serde(default = "default_ownership_ttl")]
    pub ownership_ttl_secs: u64,
    /// Outbound frames buffered per connection before senders block
    /// (default 64).
    #[serde(default = "default_outbound_queue_size")]
    pub outbound_queue_size: usize,
}

/// Slug cache settings.
#[derive(Debug, Clone, Deserialize)]
pub struct SlugCacheConfig {
    /// Seconds a slug → tunnel_id binding is served locally before the
    /// Control Plane is consulted again (default 60).
    #[serde(default = "default_slug_ttl")]
    pub ttl_secs: u64,
}

/// Control Plane client settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ControlPlaneConfig {
    /// Base URL of the Control Plane API. Override with
    /// `EDGEGATE_CONTROL_PLANE_URL`.
    #[serde(default = "default_control_plane_url")]
    pub url: String,
    /// Use the in-process mock directory instead of HTTP (default false).
    /// For development and tests only.
    #[serde(default)]
    pub mock: bool,
    /// Per-request timeout in seconds for Control Plane calls (default 5).
    #[serde(default = "default_control_plane_timeout")]
    pub request_timeout_secs: u64,
}

/// Coordination Store settings.
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// Redis connection URL. Override with `EDGEGATE_REDIS_URL`.
    #[serde(default = "default_redis_url")]
    pub redis_url: String,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}
fn default_heartbeat_interval() -> u64 {
    10
}
fn default_request_timeout() -> u64 {
    30
}
fn default_ownership_ttl() -> u64 {
    300
}
fn default_outbound_queue_size() -> usize {
    64
}
fn default_slug_ttl() -> u64 {
    60
}
fn default_control_plane_url() -> String {
    "http://localhost:9000".to_string()
}
fn default_control_plane_timeout() -> u64 {
    5
}
fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            tunnel: TunnelConfig::default(),
            slug_cache: SlugCacheConfig::default(),
            control_plane: ControlPlaneConfig::default(),
            store: StoreConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: default_heartbeat_interval(),
            request_timeout_secs: default_request_timeout(),
            ownership_ttl_secs: default_ownership_ttl(),
            outbound_queue_size: default_outbound_queue_size(),
        }
    }
}

impl Default for SlugCacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_slug_ttl(),
        }
    }
}

impl Default for ControlPlaneConfig {
    fn default() -> Self {
        Self {
            url: default_control_plane_url(),
            mock: false,
            request_timeout_secs: default_control_plane_timeout(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            redis_url: default_redis_url(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, reads that file (panics on failure). Otherwise looks
    /// for `edgegate.toml` in the current directory, falling back to compiled
    /// defaults.
    pub fn load(path: Option<&str>) -> Self {
        let mut config: Config = if let Some(p) = path {
            let content = std::fs::read_to_string(p)
                .unwrap_or_else(|e| panic!("Failed to read config file {p}: {e}"));
            toml::from_str(&content)
                .unwrap_or_else(|e| panic!("Failed to parse config file {p}: {e}"))
        } else if Path::new("edgegate.toml").exists() {
            let content =
                std::fs::read_to_string("edgegate.toml").expect("Failed to read edgegate.toml");
            toml::from_str(&content).expect("Failed to parse edgegate.toml")
        } else {
            Config::default()
        };

        // Env var overrides
        if let Ok(listen) = std::env::var("EDGEGATE_LISTEN") {
            config.server.listen = listen;
        }
        if let Ok(url) = std::env::var("EDGEGATE_REDIS_URL") {
            config.store.redis_url = url;
        }
        if let Ok(url) = std::env::var("EDGEGATE_CONTROL_PLANE_URL") {
            config.control_plane.url = url;
        }

        config
    }
}
