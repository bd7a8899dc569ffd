//! Tunnel connections and their wire protocol.
//!
//! - [`protocol`] — the `request`/`response`/`ping`/`pong` frame schema and
//!   the 64 KiB frame limit.
//! - [`connection`] — the per-connection dispatch loop, heartbeat, and the
//!   [`connection::TunnelHandle`] used by the registry and the router.

pub mod connection;
pub mod protocol;
