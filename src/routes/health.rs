//! Unauthenticated health-check endpoints.

use std::sync::atomic::Ordering;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};

use crate::state::AppState;

/// `GET /health/live` — liveness probe.
///
/// Returns 200 whenever the process is up, with uptime, version, pod id, and
/// the number of locally connected tunnels. Suitable for load-balancer
/// health checks.
pub async fn live(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "uptime_secs": state.start_time.elapsed().as_secs(),
        "version": env!("CARGO_PKG_VERSION"),
        "pod_id": &*state.pod_id,
        "tunnels": state.registry.local_count().await,
    }))
}

/// `GET /health/ready` — readiness probe.
///
/// 503 until the startup connectivity checks against the Coordination Store
/// and the Control Plane have passed, 200 afterwards.
pub async fn ready(State(state): State<AppState>) -> Response {
    if state.ready.load(Ordering::Relaxed) {
        Json(json!({"status": "ready"})).into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(json!({"status": "starting"}))).into_response()
    }
}
