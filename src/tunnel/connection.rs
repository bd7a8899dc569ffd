//! One authenticated agent connection.
//!
//! After the endpoint has authenticated the agent and registered ownership,
//! [`run`] drives the socket: a writer task drains the outbound frame queue,
//! a heartbeat task pings the agent and refreshes the ownership TTL, and the
//! inbound loop dispatches frames until something forces the `Closing`
//! transition (transport error, close frame, heartbeat timeout, protocol
//! violation, or process shutdown). None of these are retried here — the
//! agent reconnects and re-authenticates from scratch.
//!
//! The [`TunnelHandle`] is the non-owning side kept by the registry and the
//! router: cheap to clone, it carries the outbound queue, the pending-request
//! map, and the cancellation token, but never the socket itself.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::protocol::{self, Frame, FrameError, RequestFrame, ResponseFrame};
use crate::error::GatewayError;
use crate::registry::TunnelRegistry;
use crate::state::AppState;

/// Shared, non-owning reference to a live tunnel connection.
#[derive(Clone)]
pub struct TunnelHandle {
    tunnel_id: Arc<str>,
    outbound: mpsc::Sender<Frame>,
    /// In-flight requests awaiting a correlated `response` frame. The
    /// response path and the router's deadline race to remove an entry; the
    /// oneshot guarantees at most one of them fulfills it.
    pending: Arc<Mutex<HashMap<String, oneshot::Sender<ResponseFrame>>>>,
    /// Last received pong as ms since `epoch` (lock-free hot path).
    last_pong_ms: Arc<AtomicU64>,
    epoch: Instant,
    cancel: CancellationToken,
}

impl TunnelHandle {
    /// Create a handle and the receiving end of its outbound queue.
    pub fn new(tunnel_id: &str, queue_size: usize) -> (Self, mpsc::Receiver<Frame>) {
        let (outbound, outbound_rx) = mpsc::channel(queue_size);
        let handle = Self {
            tunnel_id: Arc::from(tunnel_id),
            outbound,
            pending: Arc::new(Mutex::new(HashMap::new())),
            last_pong_ms: Arc::new(AtomicU64::new(0)),
            epoch: Instant::now(),
            cancel: CancellationToken::new(),
        };
        (handle, outbound_rx)
    }

    pub fn tunnel_id(&self) -> &str {
        &self.tunnel_id
    }

    /// Queue a routed request and return the receiver its response will be
    /// delivered on. The caller owns the deadline; on expiry it must
    /// [`abandon`](Self::abandon) the request id so a late response is
    /// dropped as unmatched.
    pub async fn submit(
        &self,
        frame: RequestFrame,
    ) -> Result<oneshot::Receiver<ResponseFrame>, GatewayError> {
        let request_id = frame.request_id.clone();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(request_id.clone(), tx);

        if self.outbound.send(Frame::Request(frame)).await.is_err() {
            self.pending.lock().await.remove(&request_id);
            return Err(GatewayError::SendFailed {
                tunnel_id: self.tunnel_id.to_string(),
            });
        }
        Ok(rx)
    }

    /// Forget an in-flight request (deadline fired on the router side).
    pub async fn abandon(&self, request_id: &str) {
        self.pending.lock().await.remove(request_id);
    }

    /// Fulfill the pending request matching this response. Returns `false`
    /// when no entry matches — already timed out, or an agent-side duplicate —
    /// in which case the frame is dropped without touching anything else.
    pub(crate) async fn complete(&self, response: ResponseFrame) -> bool {
        let sender = self.pending.lock().await.remove(&response.request_id);
        match sender {
            Some(tx) => tx.send(response).is_ok(),
            None => false,
        }
    }

    /// Send a frame on the outbound queue. Returns `false` if the writer is
    /// gone.
    pub(crate) async fn send(&self, frame: Frame) -> bool {
        self.outbound.send(frame).await.is_ok()
    }

    pub(crate) fn record_pong(&self) {
        let now_ms = self.epoch.elapsed().as_millis() as u64;
        self.last_pong_ms.store(now_ms, Ordering::Relaxed);
    }

    pub(crate) fn pong_age(&self) -> Duration {
        let now_ms = self.epoch.elapsed().as_millis() as u64;
        let last = self.last_pong_ms.load(Ordering::Relaxed);
        Duration::from_millis(now_ms.saturating_sub(last))
    }

    /// Fail every outstanding request. Dropping the oneshot senders wakes
    /// each waiting router with a closed-channel error, which the router
    /// reports as a distinct tunnel-closed failure (never a timeout).
    pub async fn drain(&self, reason: &str) {
        let mut pending = self.pending.lock().await;
        let count = pending.len();
        pending.clear();
        if count > 0 {
            info!(
                tunnel_id = %self.tunnel_id,
                count,
                "Failed {count} pending requests: {reason}"
            );
        }
    }

    /// Force the `Closing` transition from outside the dispatch loop.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub(crate) fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }
}

/// The gateway is shutting down.
const CLOSE_GOING_AWAY: u16 = 1001;
/// Malformed, binary, or unexpected frame from the agent.
const CLOSE_PROTOCOL_ERROR: u16 = 1002;
/// Frame exceeds the 64 KiB limit.
const CLOSE_MESSAGE_TOO_BIG: u16 = 1009;

/// Drive an authenticated, registered connection until it closes, then tear
/// down: fail pending requests, deregister ownership, stop the helper tasks.
/// Closes the gateway initiates carry an explicit close frame so the agent
/// can tell a violation from a dropped transport.
pub async fn run(
    socket: WebSocket,
    state: AppState,
    handle: TunnelHandle,
    mut outbound_rx: mpsc::Receiver<Frame>,
) {
    let (mut ws_sink, mut ws_stream) = socket.split();
    let tunnel_id = handle.tunnel_id().to_string();

    // Writer: outbound queue -> socket. A write failure is a transport
    // failure for the whole connection. The close slot delivers the final
    // close frame and ends the writer; dropping it unsent ends the writer
    // without one.
    let (close_tx, mut close_rx) = oneshot::channel::<CloseFrame>();
    let writer_cancel = handle.cancel_token();
    let send_task = tokio::spawn(async move {
        loop {
            tokio::select! {
                frame = outbound_rx.recv() => {
                    let Some(frame) = frame else { break };
                    let text = match protocol::encode(&frame) {
                        Ok(text) => text,
                        Err(e) => {
                            warn!(error = %e, "Dropping unencodable outbound frame");
                            continue;
                        }
                    };
                    if ws_sink.send(Message::Text(text.into())).await.is_err() {
                        writer_cancel.cancel();
                        break;
                    }
                }
                close = &mut close_rx => {
                    if let Ok(frame) = close {
                        let _ = ws_sink.send(Message::Close(Some(frame))).await;
                    }
                    break;
                }
            }
        }
    });

    let heartbeat_interval = Duration::from_secs(state.config.tunnel.heartbeat_interval_secs);
    let heartbeat_task = tokio::spawn(heartbeat_loop(
        handle.clone(),
        state.registry.clone(),
        heartbeat_interval,
    ));

    let cancel = handle.cancel_token();
    let (close_reason, close_code) = loop {
        let msg = tokio::select! {
            msg = ws_stream.next() => match msg {
                Some(Ok(msg)) => msg,
                // Includes transport-level refusal of an oversize message
                Some(Err(_)) => break ("transport error", None),
                None => break ("connection closed", None),
            },
            () = cancel.cancelled() => break ("shutting down", Some(CLOSE_GOING_AWAY)),
        };

        match msg {
            Message::Text(text) => match protocol::decode(text.as_str()) {
                Ok(Frame::Response(response)) => {
                    if !handle.complete(response).await {
                        debug!("Dropped response for timed-out or unknown request");
                    }
                }
                Ok(Frame::Pong) => handle.record_pong(),
                Ok(Frame::Ping) => {
                    let _ = handle.send(Frame::Pong).await;
                }
                Ok(Frame::Request(_)) => {
                    // Agents never originate requests; the schema leaves no
                    // room for ignoring unexpected traffic.
                    warn!("Agent sent a request frame, closing");
                    break ("unexpected request frame", Some(CLOSE_PROTOCOL_ERROR));
                }
                Err(e @ FrameError::Oversize(_)) => {
                    warn!(error = %e, "Closing tunnel");
                    break ("oversize frame", Some(CLOSE_MESSAGE_TOO_BIG));
                }
                Err(e) => {
                    warn!(error = %e, "Closing tunnel");
                    break ("malformed frame", Some(CLOSE_PROTOCOL_ERROR));
                }
            },
            Message::Binary(_) => {
                warn!("Agent sent a binary frame, closing");
                break ("binary frame", Some(CLOSE_PROTOCOL_ERROR));
            }
            Message::Close(_) => break ("close frame", None),
            // Transport-level ping/pong; axum answers these itself.
            _ => {}
        }
    };

    info!(reason = close_reason, "Tunnel closing");
    handle.drain("tunnel closed").await;
    state.registry.deregister(&tunnel_id).await;
    heartbeat_task.abort();

    match close_code {
        Some(code) => {
            let _ = close_tx.send(CloseFrame {
                code,
                reason: close_reason.into(),
            });
        }
        // No frame to send; dropping the slot ends the writer
        None => drop(close_tx),
    }
    // Let the writer flush the close frame, but never hang teardown on it
    let _ = tokio::time::timeout(Duration::from_secs(1), send_task).await;
}

/// Emit a ping every interval, enforce the pong grace window (2x interval),
/// and keep the coordination store ownership key alive. The only mechanism
/// that downgrades an active tunnel locally without an explicit close.
async fn heartbeat_loop(handle: TunnelHandle, registry: TunnelRegistry, interval: Duration) {
    let grace = interval * 2;
    let mut ticker = tokio::time::interval(interval);
    // interval fires immediately; the first real tick is one period in
    ticker.tick().await;
    loop {
        ticker.tick().await;

        if !handle.send(Frame::Ping).await {
            handle.close();
            return;
        }

        if handle.pong_age() > grace {
            warn!(tunnel_id = handle.tunnel_id(), "Pong timeout, closing tunnel");
            handle.close();
            return;
        }

        if !registry.refresh_ownership(handle.tunnel_id()).await {
            warn!(
                tunnel_id = handle.tunnel_id(),
                "Tunnel ownership taken over by another pod, closing"
            );
            handle.close();
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request_frame(request_id: &str) -> RequestFrame {
        RequestFrame {
            request_id: request_id.to_string(),
            method: "GET".into(),
            path: "/".into(),
            headers: HashMap::new(),
            body: None,
        }
    }

    fn response_frame(request_id: &str, body: &str) -> ResponseFrame {
        ResponseFrame {
            request_id: request_id.to_string(),
            status: 200,
            headers: HashMap::new(),
            body: Some(body.to_string()),
        }
    }

    #[tokio::test]
    async fn test_submit_and_complete_correlates() {
        let (handle, mut outbound_rx) = TunnelHandle::new("t1", 8);

        let rx_a = handle.submit(request_frame("a")).await.unwrap();
        let rx_b = handle.submit(request_frame("b")).await.unwrap();
        assert_eq!(handle.pending_count().await, 2);

        // Both requests went out on the queue
        assert!(matches!(outbound_rx.recv().await, Some(Frame::Request(_))));
        assert!(matches!(outbound_rx.recv().await, Some(Frame::Request(_))));

        // Responses complete out of order
        assert!(handle.complete(response_frame("b", "second")).await);
        assert!(handle.complete(response_frame("a", "first")).await);

        assert_eq!(rx_a.await.unwrap().body.as_deref(), Some("first"));
        assert_eq!(rx_b.await.unwrap().body.as_deref(), Some("second"));
        assert_eq!(handle.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_unmatched_response_dropped() {
        let (handle, _outbound_rx) = TunnelHandle::new("t1", 8);
        let rx = handle.submit(request_frame("a")).await.unwrap();

        // A response nobody asked for affects nothing
        assert!(!handle.complete(response_frame("ghost", "x")).await);
        assert_eq!(handle.pending_count().await, 1);

        assert!(handle.complete(response_frame("a", "ok")).await);
        assert_eq!(rx.await.unwrap().body.as_deref(), Some("ok"));
    }

    #[tokio::test]
    async fn test_abandon_then_late_response_dropped() {
        let (handle, _outbound_rx) = TunnelHandle::new("t1", 8);
        let _rx = handle.submit(request_frame("a")).await.unwrap();

        handle.abandon("a").await;
        assert_eq!(handle.pending_count().await, 0);
        assert!(!handle.complete(response_frame("a", "late")).await);
    }

    #[tokio::test]
    async fn test_drain_fails_all_pending() {
        let (handle, _outbound_rx) = TunnelHandle::new("t1", 8);
        let rx_a = handle.submit(request_frame("a")).await.unwrap();
        let rx_b = handle.submit(request_frame("b")).await.unwrap();

        handle.drain("tunnel closed").await;

        // Receivers observe a closed channel, not a value
        assert!(rx_a.await.is_err());
        assert!(rx_b.await.is_err());
        assert_eq!(handle.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_submit_fails_when_writer_gone() {
        let (handle, outbound_rx) = TunnelHandle::new("t1", 8);
        drop(outbound_rx);

        let err = handle.submit(request_frame("a")).await.unwrap_err();
        assert_eq!(err.code(), "TUNNEL_SEND_FAILED");
        assert_eq!(handle.pending_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pong_age_tracks_time() {
        let (handle, _outbound_rx) = TunnelHandle::new("t1", 8);
        handle.record_pong();
        tokio::time::advance(Duration::from_secs(25)).await;
        assert!(handle.pong_age() >= Duration::from_secs(25));
        handle.record_pong();
        assert!(handle.pong_age() < Duration::from_secs(1));
    }
}
