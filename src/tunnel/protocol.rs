//! Tunnel wire protocol — JSON text frames exchanged with agents.
//!
//! Every message over a tunnel WebSocket is one frame: `request`, `response`,
//! `ping`, or `pong`, discriminated by a `type` tag. Request and response
//! frames carry a `request_id` used to correlate the two halves of an
//! in-flight HTTP exchange; many exchanges are multiplexed concurrently over
//! one connection, so responses may arrive in any order.
//!
//! Frames are bounded by [`MAX_FRAME_BYTES`]. An oversize frame in either
//! direction is a protocol violation: inbound it closes the connection,
//! outbound it fails the HTTP request before anything touches the tunnel.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Hard limit on the serialized size of a single frame (64 KiB).
///
/// Unbounded frames would let a single misbehaving agent exhaust gateway
/// memory, so this is enforced, not advisory.
pub const MAX_FRAME_BYTES: usize = 64 * 1024;

/// One protocol message. The closed set of tags is matched exhaustively on
/// receipt; anything else fails to parse and counts as a violation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    /// Gateway → agent: a routed HTTP request.
    Request(RequestFrame),
    /// Agent → gateway: the correlated answer to an earlier request.
    Response(ResponseFrame),
    /// Heartbeat probe. The peer answers with `pong`.
    Ping,
    /// Heartbeat answer.
    Pong,
}

/// An HTTP request forwarded over the tunnel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestFrame {
    pub request_id: String,
    pub method: String,
    pub path: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

/// The agent's HTTP response, returned verbatim to the public caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseFrame {
    pub request_id: String,
    pub status: u16,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

/// Why a frame failed to decode or encode.
#[derive(Debug)]
pub enum FrameError {
    /// Serialized size exceeds [`MAX_FRAME_BYTES`].
    Oversize(usize),
    /// Not valid JSON, or not one of the known frame shapes.
    Malformed(String),
}

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameError::Oversize(size) => {
                write!(f, "frame of {size} bytes exceeds {MAX_FRAME_BYTES} byte limit")
            }
            FrameError::Malformed(detail) => write!(f, "malformed frame: {detail}"),
        }
    }
}

/// Parse an inbound text frame, enforcing the size limit before the JSON ever
/// reaches a parser.
pub fn decode(text: &str) -> Result<Frame, FrameError> {
    if text.len() > MAX_FRAME_BYTES {
        return Err(FrameError::Oversize(text.len()));
    }
    serde_json::from_str(text).map_err(|e| FrameError::Malformed(e.to_string()))
}

/// Serialize an outbound frame, rejecting it if the encoded form would exceed
/// the size limit.
pub fn encode(frame: &Frame) -> Result<String, FrameError> {
    let text = serde_json::to_string(frame).map_err(|e| FrameError::Malformed(e.to_string()))?;
    if text.len() > MAX_FRAME_BYTES {
        return Err(FrameError::Oversize(text.len()));
    }
    Ok(text)
}
