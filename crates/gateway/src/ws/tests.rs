use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tandem_common::protocol::{envelope::ServerEnvelope, CLOSE_MESSAGE_RATE_LIMITED};
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_tungstenite::{
    connect_async, tungstenite::Error as WsError, tungstenite::Message as WsFrame, MaybeTlsStream,
    WebSocketStream,
};

use crate::admission::AdmissionGateway;
use crate::auth::jwt::JwtAccessTokenService;
use crate::config::{GatewayConfig, LogFormat};
use crate::coordinator::{BucketSpec, Coordinator};
use crate::metrics::RoomKind;
use crate::rooms::RoomHub;

const TEST_SECRET: &str = "tandem_test_secret_that_is_definitely_long_enough";

type ClientSocket = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

struct TestServer {
    addr: SocketAddr,
    jwt: Arc<JwtAccessTokenService>,
}

impl TestServer {
    fn url(&self, token: Option<&str>) -> String {
        match token {
            Some(token) => format!("ws://{}/ws?token={token}", self.addr),
            None => format!("ws://{}/ws", self.addr),
        }
    }

    fn token(&self, user_id: &str) -> String {
        self.jwt.issue_token(user_id, &["editor"]).expect("token should be issued")
    }

    async fn connect(&self, user_id: &str) -> ClientSocket {
        let (mut socket, _) =
            connect_async(self.url(Some(&self.token(user_id)))).await.expect("socket should connect");
        let auth_ok = recv_envelope(&mut socket).await;
        assert_eq!(auth_ok.code, 0);
        assert_eq!(auth_ok.message, "auth_ok");
        socket
    }
}

fn test_config(connection_limit: BucketSpec, message_limit: BucketSpec) -> GatewayConfig {
    GatewayConfig {
        listen_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
        jwt_secret: TEST_SECRET.to_string(),
        database_url: None,
        connection_limit,
        message_limit,
        idempotency_ttl: Duration::from_secs(300),
        handshake_timeout: Duration::from_secs(5),
        trust_forwarded_for: false,
        sweep_interval: Duration::from_secs(60),
        log_filter: "info".to_string(),
        log_format: LogFormat::Pretty,
    }
}

async fn spawn_server(config: GatewayConfig) -> TestServer {
    let jwt = Arc::new(JwtAccessTokenService::new(&config.jwt_secret).expect("jwt service should initialize"));
    let admission = AdmissionGateway::new(&config, Arc::clone(&jwt), Coordinator::in_memory());
    let app = super::router(admission, Arc::new(RoomHub::new(RoomKind::Command)));

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("listener should bind");
    let addr = listener.local_addr().expect("listener should expose local address");
    tokio::spawn(async move {
        axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
            .await
            .expect("test server should run");
    });

    TestServer { addr, jwt }
}

async fn spawn_default_server() -> TestServer {
    spawn_server(test_config(
        BucketSpec::new(100, Duration::from_secs(60)),
        BucketSpec::new(300, Duration::from_secs(60)),
    ))
    .await
}

async fn send_json(socket: &mut ClientSocket, value: Value) {
    socket.send(WsFrame::Text(value.to_string().into())).await.expect("frame should send");
}

async fn recv_frame(socket: &mut ClientSocket) -> WsFrame {
    loop {
        let next = timeout(Duration::from_secs(2), socket.next())
            .await
            .expect("timed out waiting for websocket frame");
        let frame = next.expect("websocket should remain open").expect("frame should decode");
        match frame {
            WsFrame::Ping(_) | WsFrame::Pong(_) | WsFrame::Frame(_) => continue,
            other => return other,
        }
    }
}

async fn recv_envelope(socket: &mut ClientSocket) -> ServerEnvelope {
    match recv_frame(socket).await {
        WsFrame::Text(payload) => {
            serde_json::from_str(payload.as_str()).expect("text frame should decode as envelope")
        }
        other => panic!("expected text frame, got {other:?}"),
    }
}

fn rejection_status(error: WsError) -> (u16, Option<String>) {
    match error {
        WsError::Http(response) => (
            response.status().as_u16(),
            response
                .headers()
                .get("retry-after")
                .and_then(|value| value.to_str().ok())
                .map(ToOwned::to_owned),
        ),
        other => panic!("expected HTTP rejection, got {other:?}"),
    }
}

#[tokio::test]
async fn accepted_connection_receives_auth_ok_with_user_id() {
    let server = spawn_default_server().await;
    let (mut socket, _) = connect_async(server.url(Some(&server.token("user-1"))))
        .await
        .expect("socket should connect");

    let auth_ok = recv_envelope(&mut socket).await;
    assert_eq!(auth_ok.code, 0);
    assert_eq!(auth_ok.message, "auth_ok");
    assert!(!auth_ok.trace_id.is_empty());
    assert!(auth_ok.request_id.is_none());
    assert_eq!(auth_ok.data.expect("auth_ok data")["userId"], "user-1");
}

#[tokio::test]
async fn missing_or_invalid_token_refuses_the_upgrade() {
    let server = spawn_default_server().await;

    let error = connect_async(server.url(None)).await.expect_err("upgrade should be refused");
    assert_eq!(rejection_status(error).0, 401);

    let error =
        connect_async(server.url(Some("not-a-jwt"))).await.expect_err("upgrade should be refused");
    assert_eq!(rejection_status(error).0, 401);
}

#[tokio::test]
async fn connection_budget_exhaustion_refuses_upgrade_with_retry_after() {
    let server = spawn_server(test_config(
        BucketSpec::new(2, Duration::from_secs(60)),
        BucketSpec::new(300, Duration::from_secs(60)),
    ))
    .await;

    let _first = server.connect("user-1").await;
    let _second = server.connect("user-1").await;
    let error = connect_async(server.url(Some(&server.token("user-1"))))
        .await
        .expect_err("third attempt should be throttled");

    let (status, retry_after) = rejection_status(error);
    assert_eq!(status, 429);
    let seconds: u64 = retry_after.expect("retry-after header").parse().expect("numeric retry-after");
    assert!((1..=60).contains(&seconds));
}

#[tokio::test]
async fn replayed_request_id_is_processed_once() {
    let server = spawn_default_server().await;
    let mut socket = server.connect("user-1").await;

    send_json(&mut socket, json!({ "requestId": "r-1", "type": "ping" })).await;
    let first = recv_envelope(&mut socket).await;
    assert_eq!(first.code, 0);
    assert_eq!(first.message, "pong");
    assert_eq!(first.request_id.as_deref(), Some("r-1"));

    for _ in 0..3 {
        send_json(&mut socket, json!({ "requestId": "r-1", "type": "ping" })).await;
        let repeat = recv_envelope(&mut socket).await;
        assert_eq!(repeat.code, 409);
        assert_eq!(repeat.message, "duplicate");
        assert_eq!(repeat.request_id.as_deref(), Some("r-1"));
    }

    // Dedup is keyed by user, not connection.
    let mut second = server.connect("user-1").await;
    send_json(&mut second, json!({ "requestId": "r-1", "type": "ping" })).await;
    assert_eq!(recv_envelope(&mut second).await.code, 409);
}

#[tokio::test]
async fn malformed_payloads_get_a_structured_reply_and_keep_the_socket() {
    let server = spawn_default_server().await;
    let mut socket = server.connect("user-1").await;

    socket.send(WsFrame::Text("{not json".into())).await.expect("frame should send");
    let reply = recv_envelope(&mut socket).await;
    assert_eq!(reply.code, 500);

    send_json(&mut socket, json!({ "requestId": "r-2", "type": "teleport" })).await;
    let reply = recv_envelope(&mut socket).await;
    assert_eq!(reply.code, 500);
    assert_eq!(reply.request_id.as_deref(), Some("r-2"));

    send_json(&mut socket, json!({ "requestId": "r-3", "type": "whoami" })).await;
    let reply = recv_envelope(&mut socket).await;
    assert_eq!(reply.code, 0);
    assert_eq!(reply.data.expect("whoami data")["userId"], "user-1");
}

#[tokio::test]
async fn message_budget_exhaustion_closes_with_distinct_code_and_allows_retry() {
    let server = spawn_server(test_config(
        BucketSpec::new(100, Duration::from_secs(60)),
        BucketSpec::new(2, Duration::from_secs(1)),
    ))
    .await;
    let mut socket = server.connect("user-1").await;

    for request_id in ["m-1", "m-2"] {
        send_json(&mut socket, json!({ "requestId": request_id, "type": "ping" })).await;
        assert_eq!(recv_envelope(&mut socket).await.code, 0);
    }

    send_json(&mut socket, json!({ "requestId": "m-3", "type": "ping" })).await;
    let notice = recv_envelope(&mut socket).await;
    assert_eq!(notice.code, 429);
    assert_eq!(notice.request_id.as_deref(), Some("m-3"));
    let retry_after_ms = notice.data.expect("retry data")["retryAfterMs"].as_u64().expect("retry ms");
    assert!(retry_after_ms <= 1_000);

    match recv_frame(&mut socket).await {
        WsFrame::Close(Some(frame)) => assert_eq!(u16::from(frame.code), CLOSE_MESSAGE_RATE_LIMITED),
        other => panic!("expected close frame, got {other:?}"),
    }

    // A fresh connection is admitted immediately; once the window refills the
    // throttled request id is processed rather than reported as a duplicate.
    let mut retry = server.connect("user-1").await;
    tokio::time::sleep(Duration::from_millis(1_100)).await;
    send_json(&mut retry, json!({ "requestId": "m-3", "type": "ping" })).await;
    let reply = recv_envelope(&mut retry).await;
    assert_eq!(reply.code, 0);
    assert_eq!(reply.request_id.as_deref(), Some("m-3"));
}

#[tokio::test]
async fn room_members_receive_peer_events_and_announcements() {
    let server = spawn_default_server().await;
    let mut alice = server.connect("alice").await;
    let mut bob = server.connect("bob").await;

    send_json(&mut alice, json!({ "requestId": "a-1", "type": "join", "documentId": "doc-1" })).await;
    let joined = recv_envelope(&mut alice).await;
    assert_eq!(joined.message, "joined");
    assert_eq!(joined.data.expect("join data")["members"], 1);

    send_json(&mut bob, json!({ "requestId": "b-1", "type": "join", "documentId": "doc-1" })).await;
    assert_eq!(recv_envelope(&mut bob).await.message, "joined");

    let event = recv_envelope(&mut alice).await;
    assert_eq!(event.message, "event");
    let data = event.data.expect("event data");
    assert_eq!(data["event"], "peer_joined");
    assert_eq!(data["userId"], "bob");

    send_json(
        &mut alice,
        json!({ "requestId": "a-2", "type": "announce", "documentId": "doc-1", "payload": { "typing": true } }),
    )
    .await;
    let ack = recv_envelope(&mut alice).await;
    assert_eq!(ack.message, "announced");
    assert_eq!(ack.data.expect("announce data")["delivered"], 1);

    let announcement = recv_envelope(&mut bob).await.data.expect("announcement data");
    assert_eq!(announcement["event"], "announcement");
    assert_eq!(announcement["payload"], json!({ "typing": true }));

    bob.close(None).await.expect("close should send");
    let left = recv_envelope(&mut alice).await.data.expect("peer_left data");
    assert_eq!(left["event"], "peer_left");
    assert_eq!(left["userId"], "bob");
}

#[tokio::test]
async fn announce_without_joining_is_rejected() {
    let server = spawn_default_server().await;
    let mut socket = server.connect("user-1").await;

    send_json(
        &mut socket,
        json!({ "requestId": "x-1", "type": "announce", "documentId": "doc-9", "payload": {} }),
    )
    .await;
    let reply = recv_envelope(&mut socket).await;
    assert_eq!(reply.code, 500);
    assert_eq!(reply.request_id.as_deref(), Some("x-1"));
}

#[tokio::test]
async fn failed_command_can_be_retried_with_the_same_request_id() {
    let server = spawn_default_server().await;
    let mut socket = server.connect("user-1").await;
    let announce = json!({ "requestId": "x-2", "type": "announce", "documentId": "doc-9", "payload": {} });

    send_json(&mut socket, announce.clone()).await;
    assert_eq!(recv_envelope(&mut socket).await.code, 500);

    send_json(&mut socket, json!({ "requestId": "x-3", "type": "join", "documentId": "doc-9" })).await;
    assert_eq!(recv_envelope(&mut socket).await.message, "joined");

    send_json(&mut socket, announce).await;
    let reply = recv_envelope(&mut socket).await;
    assert_eq!(reply.code, 0);
    assert_eq!(reply.message, "announced");
    assert_eq!(reply.request_id.as_deref(), Some("x-2"));
}
