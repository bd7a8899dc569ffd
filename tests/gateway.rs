//! End-to-end gateway scenarios over real sockets: a scripted agent connects
//! through the WebSocket endpoint while public requests are driven at the
//! routing endpoint with an HTTP client.

use std::net::SocketAddr;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use edgegate::config::Config;
use edgegate::control_plane::{ControlPlaneClient, MockDirectory, TunnelStatus};
use edgegate::registry::TunnelRegistry;
use edgegate::routes;
use edgegate::slug_cache::SlugCache;
use edgegate::state::AppState;
use edgegate::store::CoordinationStore;

const POD_ID: &str = "pod-test";

struct TestGateway {
    addr: SocketAddr,
    store: CoordinationStore,
}

impl TestGateway {
    fn http(&self, path: &str) -> String {
        format!("http://{}{path}", self.addr)
    }

    fn ws(&self, tunnel_id: &str) -> String {
        format!("ws://{}/ws/{tunnel_id}", self.addr)
    }

    /// Wait until a tunnel's ownership key lands in the store. Registration
    /// happens after the WS upgrade, so tests must not race it.
    async fn wait_registered(&self, tunnel_id: &str) {
        for _ in 0..200 {
            if self.store.owner(tunnel_id).await.unwrap().is_some() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("tunnel {tunnel_id} never registered");
    }

    /// Wait until a tunnel's ownership key is gone from the store.
    async fn wait_released(&self, tunnel_id: &str) {
        for _ in 0..200 {
            if self.store.owner(tunnel_id).await.unwrap().is_none() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("tunnel {tunnel_id} never released");
    }
}

/// Directory with one active tunnel (`tunnel_a` / `my-slug`) and one revoked
/// (`tunnel_b` / `dead-slug`).
fn directory() -> MockDirectory {
    let mut dir = MockDirectory::new();
    dir.add_tunnel("tunnel_a", "token-a", TunnelStatus::Active);
    dir.add_tunnel("tunnel_b", "token-b", TunnelStatus::Revoked);
    dir.add_slug("my-slug", "tunnel_a");
    dir.add_slug("dead-slug", "tunnel_b");
    dir
}

async fn spawn_gateway(dir: MockDirectory, request_timeout_secs: u64) -> TestGateway {
    let mut config = Config::default();
    config.tunnel.request_timeout_secs = request_timeout_secs;

    let store = CoordinationStore::in_memory();
    let state = AppState {
        config: Arc::new(config),
        pod_id: Arc::from(POD_ID),
        start_time: Instant::now(),
        registry: TunnelRegistry::new(POD_ID, store.clone(), Duration::from_secs(300)),
        slug_cache: SlugCache::new(Duration::from_secs(60)),
        control_plane: Arc::new(ControlPlaneClient::mock(dir)),
        ready: Arc::new(AtomicBool::new(true)),
    };

    let app = routes::router(state);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    TestGateway { addr, store }
}

type AgentSocket = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

async fn connect_agent(gateway: &TestGateway, tunnel_id: &str, token: &str) -> AgentSocket {
    let mut request = gateway.ws(tunnel_id).into_client_request().unwrap();
    request
        .headers_mut()
        .insert("x-tunnel-token", HeaderValue::from_str(token).unwrap());
    let (socket, _) = connect_async(request).await.unwrap();
    socket
}

/// Drive an agent that answers every request with 200 and a body echoing the
/// method and path; pings get pongs.
async fn echo_agent(mut socket: AgentSocket) {
    while let Some(Ok(msg)) = socket.next().await {
        let Message::Text(text) = msg else { continue };
        let frame: Value = serde_json::from_str(&text).unwrap();
        let reply = match frame["type"].as_str() {
            Some("request") => json!({
                "type": "response",
                "request_id": frame["request_id"],
                "status": 200,
                "headers": {"content-type": "text/plain", "x-agent": "echo"},
                "body": format!(
                    "{} {}",
                    frame["method"].as_str().unwrap(),
                    frame["path"].as_str().unwrap()
                ),
            }),
            Some("ping") => json!({"type": "pong"}),
            _ => continue,
        };
        if socket
            .send(Message::Text(reply.to_string().into()))
            .await
            .is_err()
        {
            return;
        }
    }
}

/// Read frames until the server's close frame arrives; return its code.
async fn expect_close(socket: &mut AgentSocket) -> u16 {
    while let Some(Ok(msg)) = socket.next().await {
        if let Message::Close(Some(frame)) = msg {
            return u16::from(frame.code);
        }
    }
    panic!("socket ended without a close frame");
}

#[tokio::test]
async fn test_roundtrip_delivers_agent_response() {
    let gateway = spawn_gateway(directory(), 30).await;
    let agent = connect_agent(&gateway, "tunnel_a", "token-a").await;
    tokio::spawn(echo_agent(agent));
    gateway.wait_registered("tunnel_a").await;

    let response = reqwest::Client::new()
        .get(gateway.http("/local_tunnel/my-slug/api/items?page=2"))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    assert_eq!(
        response.headers().get("x-agent").unwrap(),
        "echo"
    );
    assert_eq!(response.text().await.unwrap(), "GET /api/items?page=2");
}

#[tokio::test]
async fn test_silent_agent_times_out_at_deadline() {
    let gateway = spawn_gateway(directory(), 1).await;
    let mut agent = connect_agent(&gateway, "tunnel_a", "token-a").await;
    // Keep the socket alive but never answer
    tokio::spawn(async move { while agent.next().await.is_some() {} });
    gateway.wait_registered("tunnel_a").await;

    let started = Instant::now();
    let response = reqwest::Client::new()
        .get(gateway.http("/local_tunnel/my-slug/slow"))
        .send()
        .await
        .unwrap();

    // The deadline is honored, not undercut
    assert!(started.elapsed() >= Duration::from_secs(1));
    assert_eq!(response.status(), 504);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["code"], "TUNNEL_TIMEOUT");
}

#[tokio::test]
async fn test_invalid_token_closed_with_policy_violation() {
    let gateway = spawn_gateway(directory(), 30).await;
    let mut agent = connect_agent(&gateway, "tunnel_a", "wrong-token").await;

    assert_eq!(expect_close(&mut agent).await, 1008);
    // A rejected agent leaves no ownership behind
    assert!(gateway.store.owner("tunnel_a").await.unwrap().is_none());
}

#[tokio::test]
async fn test_missing_token_closed_with_policy_violation() {
    let gateway = spawn_gateway(directory(), 30).await;
    let request = gateway.ws("tunnel_a").into_client_request().unwrap();
    let (mut agent, _) = connect_async(request).await.unwrap();

    assert_eq!(expect_close(&mut agent).await, 1008);
}

#[tokio::test]
async fn test_revoked_tunnel_rejected() {
    let gateway = spawn_gateway(directory(), 30).await;
    let mut agent = connect_agent(&gateway, "tunnel_b", "token-b").await;

    assert_eq!(expect_close(&mut agent).await, 1008);
}

#[tokio::test]
async fn test_duplicate_connection_rejected() {
    let gateway = spawn_gateway(directory(), 30).await;
    let first = connect_agent(&gateway, "tunnel_a", "token-a").await;
    tokio::spawn(echo_agent(first));
    gateway.wait_registered("tunnel_a").await;

    let mut second = connect_agent(&gateway, "tunnel_a", "token-a").await;
    assert_eq!(expect_close(&mut second).await, 1008);

    // The original connection still serves traffic
    let response = reqwest::Client::new()
        .get(gateway.http("/local_tunnel/my-slug/still-up"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
}

#[tokio::test]
async fn test_unknown_slug_is_404() {
    let gateway = spawn_gateway(directory(), 30).await;

    let response = reqwest::Client::new()
        .get(gateway.http("/local_tunnel/no-such-slug/x"))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 404);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["code"], "SLUG_NOT_FOUND");
}

#[tokio::test]
async fn test_inactive_slug_is_410() {
    let gateway = spawn_gateway(directory(), 30).await;

    let response = reqwest::Client::new()
        .get(gateway.http("/local_tunnel/dead-slug/x"))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 410);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["code"], "TUNNEL_INACTIVE");
}

#[tokio::test]
async fn test_resolved_but_unconnected_tunnel_is_404() {
    let gateway = spawn_gateway(directory(), 30).await;

    let response = reqwest::Client::new()
        .get(gateway.http("/local_tunnel/my-slug/x"))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 404);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["code"], "TUNNEL_NOT_FOUND");
}

#[tokio::test]
async fn test_tunnel_on_other_pod_is_503() {
    let gateway = spawn_gateway(directory(), 30).await;
    // Another pod holds the live connection
    gateway
        .store
        .try_claim("tunnel_a", "pod-other", Duration::from_secs(300))
        .await
        .unwrap();

    let response = reqwest::Client::new()
        .get(gateway.http("/local_tunnel/my-slug/x"))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 503);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["code"], "TUNNEL_ELSEWHERE");
    assert_eq!(body["pod_id"], "pod-other");
}

#[tokio::test]
async fn test_agent_disconnect_fails_inflight_request() {
    let gateway = spawn_gateway(directory(), 30).await;
    let mut agent = connect_agent(&gateway, "tunnel_a", "token-a").await;
    gateway.wait_registered("tunnel_a").await;

    // Agent hangs up as soon as the request reaches it
    let agent_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = agent.next().await {
            if let Message::Text(text) = msg {
                let frame: Value = serde_json::from_str(&text).unwrap();
                if frame["type"] == "request" {
                    let _ = agent.close(None).await;
                    return;
                }
            }
        }
    });

    let response = reqwest::Client::new()
        .get(gateway.http("/local_tunnel/my-slug/x"))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 502);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["code"], "TUNNEL_CLOSED");

    agent_task.await.unwrap();
    // Teardown released the ownership key
    gateway.wait_released("tunnel_a").await;
}

#[tokio::test]
async fn test_oversize_body_is_413() {
    let gateway = spawn_gateway(directory(), 30).await;
    let agent = connect_agent(&gateway, "tunnel_a", "token-a").await;
    tokio::spawn(echo_agent(agent));
    gateway.wait_registered("tunnel_a").await;

    let response = reqwest::Client::new()
        .post(gateway.http("/local_tunnel/my-slug/upload"))
        .body(vec![b'a'; 80 * 1024])
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 413);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["code"], "PAYLOAD_TOO_LARGE");
}

#[tokio::test]
async fn test_oversize_frame_closes_connection() {
    let gateway = spawn_gateway(directory(), 30).await;
    let mut agent = connect_agent(&gateway, "tunnel_a", "token-a").await;
    gateway.wait_registered("tunnel_a").await;

    // Over the frame limit; the transport refuses it as it streams in
    agent
        .send(Message::Text("x".repeat(70 * 1024).into()))
        .await
        .unwrap();

    loop {
        match agent.next().await {
            None | Some(Err(_)) | Some(Ok(Message::Close(_))) => break,
            Some(Ok(_)) => {}
        }
    }
    gateway.wait_released("tunnel_a").await;
}

#[tokio::test]
async fn test_binary_frame_closed_with_protocol_error() {
    let gateway = spawn_gateway(directory(), 30).await;
    let mut agent = connect_agent(&gateway, "tunnel_a", "token-a").await;
    gateway.wait_registered("tunnel_a").await;

    agent
        .send(Message::Binary(vec![0x01, 0x02, 0x03].into()))
        .await
        .unwrap();

    assert_eq!(expect_close(&mut agent).await, 1002);
    gateway.wait_released("tunnel_a").await;
}

#[tokio::test]
async fn test_agent_request_frame_closed_with_protocol_error() {
    let gateway = spawn_gateway(directory(), 30).await;
    let mut agent = connect_agent(&gateway, "tunnel_a", "token-a").await;
    gateway.wait_registered("tunnel_a").await;

    // Agents never originate requests
    let frame = json!({
        "type": "request",
        "request_id": "r1",
        "method": "GET",
        "path": "/",
    });
    agent
        .send(Message::Text(frame.to_string().into()))
        .await
        .unwrap();

    assert_eq!(expect_close(&mut agent).await, 1002);
    gateway.wait_released("tunnel_a").await;
}

#[tokio::test]
async fn test_health_probes() {
    let gateway = spawn_gateway(directory(), 30).await;

    let live = reqwest::Client::new()
        .get(gateway.http("/health/live"))
        .send()
        .await
        .unwrap();
    assert_eq!(live.status(), 200);
    let body: Value = live.json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["pod_id"], POD_ID);
    assert_eq!(body["tunnels"], 0);

    let ready = reqwest::Client::new()
        .get(gateway.http("/health/ready"))
        .send()
        .await
        .unwrap();
    assert_eq!(ready.status(), 200);
}
