//! Routing failure taxonomy.
//!
//! Every way a public request can fail maps to a distinct machine-readable
//! `code` so callers can pick different retry strategies — in particular a
//! timed-out request (`TUNNEL_TIMEOUT`, agent may still be working) versus a
//! torn-down connection (`TUNNEL_CLOSED`, agent must reconnect first). The
//! caller always receives one of these or the agent's own response, never a
//! silent hang.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use crate::control_plane::TunnelStatus;

/// A structured routing failure returned to the public HTTP caller.
#[derive(Debug)]
pub enum GatewayError {
    /// The slug is not registered with the Control Plane.
    SlugNotFound { slug: String },
    /// The slug resolved, but the tunnel is expired or revoked.
    TunnelInactive { slug: String, status: TunnelStatus },
    /// The Control Plane could not be reached for a cache miss.
    ResolutionFailed { detail: String },
    /// The Coordination Store could not be reached for an ownership lookup.
    StoreUnavailable { detail: String },
    /// No pod owns the tunnel.
    TunnelNotFound { tunnel_id: String },
    /// Another pod owns the live connection; cross-pod forwarding is not
    /// implemented, so this surfaces as an explicit failure.
    TunnelElsewhere { tunnel_id: String, pod_id: String },
    /// Request body or encoded frame exceeds the frame limit.
    PayloadTooLarge { limit: usize },
    /// The client's request body failed mid-transfer.
    BodyReadFailed { detail: String },
    /// The connection's outbound queue is gone (connection tearing down).
    SendFailed { tunnel_id: String },
    /// The connection closed while the request was in flight.
    TunnelClosed { tunnel_id: String },
    /// The agent did not answer within the configured deadline.
    RequestTimeout { tunnel_id: String, timeout_secs: u64 },
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::SlugNotFound { .. } | GatewayError::TunnelNotFound { .. } => {
                StatusCode::NOT_FOUND
            }
            GatewayError::TunnelInactive { .. } => StatusCode::GONE,
            GatewayError::ResolutionFailed { .. }
            | GatewayError::StoreUnavailable { .. }
            | GatewayError::SendFailed { .. }
            | GatewayError::TunnelClosed { .. } => StatusCode::BAD_GATEWAY,
            GatewayError::TunnelElsewhere { .. } => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            GatewayError::BodyReadFailed { .. } => StatusCode::BAD_REQUEST,
            GatewayError::RequestTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::SlugNotFound { .. } => "SLUG_NOT_FOUND",
            GatewayError::TunnelInactive { .. } => "TUNNEL_INACTIVE",
            GatewayError::ResolutionFailed { .. } => "RESOLUTION_FAILED",
            GatewayError::StoreUnavailable { .. } => "STORE_UNAVAILABLE",
            GatewayError::TunnelNotFound { .. } => "TUNNEL_NOT_FOUND",
            GatewayError::TunnelElsewhere { .. } => "TUNNEL_ELSEWHERE",
            GatewayError::PayloadTooLarge { .. } => "PAYLOAD_TOO_LARGE",
            GatewayError::BodyReadFailed { .. } => "BODY_READ_FAILED",
            GatewayError::SendFailed { .. } => "TUNNEL_SEND_FAILED",
            GatewayError::TunnelClosed { .. } => "TUNNEL_CLOSED",
            GatewayError::RequestTimeout { .. } => "TUNNEL_TIMEOUT",
        }
    }
}

impl std::fmt::Display for GatewayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GatewayError::SlugNotFound { slug } => write!(f, "slug '{slug}' not found"),
            GatewayError::TunnelInactive { slug, status } => {
                write!(f, "tunnel for slug '{slug}' is {}", status.as_str())
            }
            GatewayError::ResolutionFailed { detail } => {
                write!(f, "slug resolution failed: {detail}")
            }
            GatewayError::StoreUnavailable { detail } => {
                write!(f, "coordination store unavailable: {detail}")
            }
            GatewayError::TunnelNotFound { tunnel_id } => {
                write!(f, "tunnel '{tunnel_id}' is not connected")
            }
            GatewayError::TunnelElsewhere { tunnel_id, pod_id } => {
                write!(f, "tunnel '{tunnel_id}' is connected to pod '{pod_id}'")
            }
            GatewayError::PayloadTooLarge { limit } => {
                write!(f, "payload exceeds the {limit} byte tunnel frame limit")
            }
            GatewayError::BodyReadFailed { detail } => {
                write!(f, "failed to read request body: {detail}")
            }
            GatewayError::SendFailed { tunnel_id } => {
                write!(f, "failed to send to tunnel '{tunnel_id}'")
            }
            GatewayError::TunnelClosed { tunnel_id } => {
                write!(f, "tunnel '{tunnel_id}' closed while the request was in flight")
            }
            GatewayError::RequestTimeout { tunnel_id, timeout_secs } => {
                write!(f, "tunnel '{tunnel_id}' did not respond within {timeout_secs}s")
            }
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let mut body = json!({
            "error": self.to_string(),
            "code": self.code(),
        });
        // Extra context callers can act on
        if let GatewayError::TunnelElsewhere { pod_id, .. } = &self {
            body["pod_id"] = json!(pod_id);
        }
        (self.status(), Json(body)).into_response()
    }
}
