//! Agent-facing WebSocket endpoint — `GET /ws/{tunnel_id}`.
//!
//! Establishment: upgrade, validate the `X-Tunnel-Token` credential with the
//! Control Plane, claim cross-pod ownership, then hand the socket to the
//! connection loop. Rejections happen after the upgrade with an explicit
//! close frame so the agent can tell a policy refusal (1008) from gateway
//! trouble (1011) and back off accordingly. A rejected agent leaves no trace:
//! no registry entry, no ownership key.

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::Response;
use tracing::{error, info, info_span, warn, Instrument};

use crate::control_plane::TunnelStatus;
use crate::registry::RegisterError;
use crate::state::AppState;
use crate::tunnel::connection::{self, TunnelHandle};
use crate::tunnel::protocol;

/// Policy violation: bad or missing credentials, inactive tunnel, ownership
/// conflict.
const CLOSE_POLICY_VIOLATION: u16 = 1008;
/// The gateway could not reach the Control Plane or the Coordination Store.
const CLOSE_INTERNAL_ERROR: u16 = 1011;

const TOKEN_HEADER: &str = "x-tunnel-token";

/// `GET /ws/{tunnel_id}` — agent tunnel establishment.
pub async fn establish(
    State(state): State<AppState>,
    Path(tunnel_id): Path<String>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let token = headers
        .get(TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    // Enforce the frame limit at the transport so an oversize message is
    // refused as it streams in, never buffered whole first.
    ws.max_message_size(protocol::MAX_FRAME_BYTES)
        .max_frame_size(protocol::MAX_FRAME_BYTES)
        .on_upgrade(move |socket| {
            let span = info_span!("tunnel", tunnel_id = %tunnel_id);
            handle_agent_ws(socket, state, tunnel_id, token).instrument(span)
        })
}

/// Send an explicit close frame and drop the socket.
async fn reject(mut socket: WebSocket, code: u16, reason: &'static str) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.into(),
        })))
        .await;
}

async fn handle_agent_ws(
    socket: WebSocket,
    state: AppState,
    tunnel_id: String,
    token: Option<String>,
) {
    let Some(token) = token else {
        warn!(
            tunnel_id,
            pod_id = %state.pod_id,
            "Rejecting tunnel: missing X-Tunnel-Token header"
        );
        reject(socket, CLOSE_POLICY_VIOLATION, "missing credentials").await;
        return;
    };

    let validation = match state.control_plane.validate_tunnel(&tunnel_id, &token).await {
        Ok(validation) => validation,
        Err(e) => {
            error!(
                tunnel_id,
                pod_id = %state.pod_id,
                error = %e,
                "Rejecting tunnel: control plane unreachable"
            );
            reject(socket, CLOSE_INTERNAL_ERROR, "control plane unreachable").await;
            return;
        }
    };

    if !validation.valid || validation.status != TunnelStatus::Active {
        warn!(
            tunnel_id,
            pod_id = %state.pod_id,
            status = validation.status.as_str(),
            "Rejecting tunnel: invalid credentials or inactive tunnel"
        );
        reject(socket, CLOSE_POLICY_VIOLATION, "invalid credentials").await;
        return;
    }

    let (handle, outbound_rx) =
        TunnelHandle::new(&tunnel_id, state.config.tunnel.outbound_queue_size);

    match state.registry.register(handle.clone()).await {
        Ok(()) => {}
        Err(RegisterError::Conflict { owner }) => {
            warn!(
                tunnel_id,
                pod_id = %state.pod_id,
                owner = %owner,
                "Rejecting tunnel: already connected to another pod"
            );
            reject(socket, CLOSE_POLICY_VIOLATION, "tunnel already connected").await;
            return;
        }
        Err(RegisterError::Store(e)) => {
            error!(
                tunnel_id,
                pod_id = %state.pod_id,
                error = %e,
                "Rejecting tunnel: coordination store unavailable"
            );
            reject(socket, CLOSE_INTERNAL_ERROR, "coordination store unavailable").await;
            return;
        }
    }

    info!(tunnel_id, pod_id = %state.pod_id, "Tunnel established");
    connection::run(socket, state, handle, outbound_rx).await;
}
