//! HTTP route handlers.
//!
//! Three surfaces: health probes for orchestration, the agent-facing
//! WebSocket endpoint, and the public routing endpoint that carries HTTP
//! requests over established tunnels.

pub mod health;
pub mod proxy;
pub mod tunnel_ws;

use axum::routing::{any, get};
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Build the gateway router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health/live", get(health::live))
        .route("/health/ready", get(health::ready))
        .route("/ws/{tunnel_id}", get(tunnel_ws::establish))
        .route("/local_tunnel/{slug}", any(proxy::forward_root))
        .route("/local_tunnel/{slug}/{*path}", any(proxy::forward))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
