#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::cast_possible_truncation)]

//! # edgegate
//!
//! Reverse-tunnel edge gateway. Private agents dial out over WebSocket and
//! hold a persistent tunnel; public HTTP requests addressed by slug are
//! carried over that tunnel to the agent and its response is returned to the
//! caller. Multiple gateway pods coordinate tunnel ownership through a shared
//! Redis store so any pod can tell where a tunnel lives.
//!
//! ## Architecture
//!
//! ```text
//! main.rs          — entry point, clap CLI, startup checks, graceful shutdown
//! config.rs        — TOML + env-var configuration
//! state.rs         — shared AppState, pod identity
//! error.rs         — routing failure taxonomy, HTTP mapping
//! control_plane.rs — tunnel credential validation and slug resolution
//! store.rs         — cross-pod ownership keys (Redis / in-memory)
//! slug_cache.rs    — short-TTL slug → tunnel_id cache
//! registry.rs      — local tunnel map + ownership bridge
//! tunnel/
//!   protocol.rs    — request/response/ping/pong frames, 64 KiB limit
//!   connection.rs  — per-connection dispatch loop, heartbeat, TunnelHandle
//! routes/
//!   health.rs      — GET /health/live, GET /health/ready
//!   tunnel_ws.rs   — GET /ws/{tunnel_id} agent endpoint
//!   proxy.rs       — ANY /local_tunnel/{slug}/{*path} public endpoint
//! ```

pub mod config;
pub mod control_plane;
pub mod error;
pub mod registry;
pub mod routes;
pub mod slug_cache;
pub mod state;
pub mod store;
pub mod tunnel;

pub use config::Config;
pub use state::AppState;
