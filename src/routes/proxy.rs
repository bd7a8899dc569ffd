//! Public routing endpoint — `ANY /local_tunnel/{slug}/{*path}`.
//!
//! Resolve the slug, locate the tunnel, submit a `request` frame, and await
//! the correlated `response` with a hard deadline. One attempt per request:
//! no retries anywhere on this path, the caller's retry policy is the retry
//! policy. Every failure becomes a structured [`GatewayError`] response; a
//! deadline expiry abandons the correlation slot so the agent's late answer
//! is dropped instead of leaking.

use std::collections::HashMap;
use std::time::Duration;

use axum::body::{to_bytes, Body};
use axum::extract::{Path, Request, State};
use axum::http::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_LENGTH};
use axum::http::StatusCode;
use http_body_util::LengthLimitError;
use axum::response::{IntoResponse, Response};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::GatewayError;
use crate::registry::TunnelLocation;
use crate::state::AppState;
use crate::tunnel::protocol::{self, Frame, RequestFrame};

/// `ANY /local_tunnel/{slug}/{*path}`.
pub async fn forward(
    State(state): State<AppState>,
    Path((slug, path)): Path<(String, String)>,
    req: Request,
) -> Response {
    match route_request(&state, &slug, &path, req).await {
        Ok(response) => response,
        Err(e) => e.into_response(),
    }
}

/// `ANY /local_tunnel/{slug}` — same as [`forward`] with an empty sub-path.
pub async fn forward_root(
    State(state): State<AppState>,
    Path(slug): Path<String>,
    req: Request,
) -> Response {
    match route_request(&state, &slug, "", req).await {
        Ok(response) => response,
        Err(e) => e.into_response(),
    }
}

async fn route_request(
    state: &AppState,
    slug: &str,
    path: &str,
    req: Request,
) -> Result<Response, GatewayError> {
    let tunnel_id = state.slug_cache.resolve(slug, &state.control_plane).await?;

    let location =
        state
            .registry
            .lookup(&tunnel_id)
            .await
            .map_err(|e| GatewayError::StoreUnavailable {
                detail: e.to_string(),
            })?;
    let handle = match location {
        TunnelLocation::LocalActive(handle) => handle,
        TunnelLocation::OwnedElsewhere(pod_id) => {
            return Err(GatewayError::TunnelElsewhere { tunnel_id, pod_id });
        }
        TunnelLocation::Unknown => return Err(GatewayError::TunnelNotFound { tunnel_id }),
    };

    let (parts, body) = req.into_parts();

    // Declared sizes over the limit fail before the body is read at all
    if let Some(declared) = declared_length(&parts.headers) {
        if declared > protocol::MAX_FRAME_BYTES {
            return Err(GatewayError::PayloadTooLarge {
                limit: protocol::MAX_FRAME_BYTES,
            });
        }
    }

    let bytes = to_bytes(body, protocol::MAX_FRAME_BYTES)
        .await
        .map_err(|e| {
            // Only an actual limit breach is the caller's fault; anything
            // else is the body dying mid-transfer.
            if is_length_limit(&e) {
                GatewayError::PayloadTooLarge {
                    limit: protocol::MAX_FRAME_BYTES,
                }
            } else {
                GatewayError::BodyReadFailed {
                    detail: e.to_string(),
                }
            }
        })?;

    let request_id = Uuid::new_v4().to_string();
    let frame = RequestFrame {
        request_id: request_id.clone(),
        method: parts.method.to_string(),
        path: agent_path(path, parts.uri.query()),
        headers: frame_headers(&parts.headers),
        body: if bytes.is_empty() {
            None
        } else {
            Some(String::from_utf8_lossy(&bytes).into_owned())
        },
    };

    // Fail fast before occupying a correlation slot. RequestFrame always
    // serializes, so an encode failure here is the size check.
    if protocol::encode(&Frame::Request(frame.clone())).is_err() {
        return Err(GatewayError::PayloadTooLarge {
            limit: protocol::MAX_FRAME_BYTES,
        });
    }

    let timeout_secs = state.config.tunnel.request_timeout_secs;
    let rx = handle.submit(frame).await?;

    debug!(slug, tunnel_id = %tunnel_id, request_id = %request_id, "Request submitted");

    let response = match tokio::time::timeout(Duration::from_secs(timeout_secs), rx).await {
        Ok(Ok(response)) => response,
        // Sender dropped: the connection drained its pending map mid-flight.
        Ok(Err(_)) => return Err(GatewayError::TunnelClosed { tunnel_id }),
        Err(_) => {
            handle.abandon(&request_id).await;
            warn!(
                tunnel_id = %tunnel_id,
                request_id = %request_id,
                timeout_secs,
                "Request deadline expired"
            );
            return Err(GatewayError::RequestTimeout {
                tunnel_id,
                timeout_secs,
            });
        }
    };

    let status =
        StatusCode::from_u16(response.status).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut http_response = Response::new(Body::from(response.body.unwrap_or_default()));
    *http_response.status_mut() = status;
    *http_response.headers_mut() = response_headers(&response.headers);
    Ok(http_response)
}

/// Parsed `Content-Length`, if the client declared one.
fn declared_length(headers: &HeaderMap) -> Option<usize> {
    headers
        .get(CONTENT_LENGTH)?
        .to_str()
        .ok()?
        .parse()
        .ok()
}

/// Whether a body-collection error is the length cap firing, as opposed to a
/// transport failure mid-body.
fn is_length_limit(err: &axum::Error) -> bool {
    let mut source: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(e) = source {
        if e.is::<LengthLimitError>() {
            return true;
        }
        source = e.source();
    }
    false
}

/// Path the agent sees: leading slash, sub-path, original query string.
fn agent_path(path: &str, query: Option<&str>) -> String {
    match query {
        Some(q) => format!("/{path}?{q}"),
        None => format!("/{path}"),
    }
}

/// Request headers copied into the frame. Hop-by-hop headers stay behind;
/// `host` names the gateway, not the agent's local service.
fn frame_headers(headers: &HeaderMap) -> HashMap<String, String> {
    headers
        .iter()
        .filter(|(name, _)| !skip_header(name.as_str()))
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect()
}

/// Response headers returned to the caller. Framing headers are recomputed
/// for the actual body the gateway writes.
fn response_headers(headers: &HashMap<String, String>) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (name, value) in headers {
        if skip_header(name) {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            out.insert(name, value);
        }
    }
    out
}

fn skip_header(name: &str) -> bool {
    name.eq_ignore_ascii_case("host")
        || name.eq_ignore_ascii_case("content-length")
        || name.eq_ignore_ascii_case("transfer-encoding")
        || name.eq_ignore_ascii_case("connection")
}
