// Replication room host: `GET /collab/{documentId}?token=<jwt>`.
//
// Speaks the y-sync binary protocol per document room. Connections pass the
// same connection admission as the command socket (IP budget and bearer
// credential) but their frames never draw from the per-user message budget;
// heartbeats and edits flow here. Room state lives in memory only while the
// room has members.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{rejection::WebSocketUpgradeRejection, Message as WsMessage, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::{Extensions, HeaderMap, Uri},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use tandem_common::protocol::command::MAX_DOCUMENT_ID_LEN;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn, Instrument};
use yrs::encoding::read::Cursor;
use yrs::sync::{Awareness, AwarenessUpdate, DefaultProtocol, Message, MessageReader, Protocol, SyncMessage};
use yrs::updates::decoder::{Decode, DecoderV1};
use yrs::updates::encoder::Encode;
use yrs::{Doc, ReadTxn, Transact, Update};

use crate::admission::{AdmissionGateway, ConnectionRequest, SessionIdentity};
use crate::error::{trace_id_from_headers_or_generate, with_trace_id_scope, ErrorCode, GatewayError};
use crate::metrics::{self, RoomKind};
use crate::rooms::RoomHub;
use crate::ws::{admit, peer_addr, MAX_FRAME_BYTES};

struct ReplicaRoom {
    awareness: Mutex<Awareness>,
    /// Awareness client id -> connection that first announced it. Only the
    /// owning connection's departure clears that client's state.
    owners: Mutex<HashMap<u64, String>>,
}

impl ReplicaRoom {
    fn new() -> Self {
        Self { awareness: Mutex::new(Awareness::new(Doc::new())), owners: Mutex::new(HashMap::new()) }
    }

    /// Record `connection_id` as owner of every live client in `update` that
    /// no other connection owns yet.
    async fn claim(&self, connection_id: &str, update: &AwarenessUpdate) {
        let mut owners = self.owners.lock().await;
        for (client_id, entry) in &update.clients {
            if entry.json.as_ref() != "null" {
                owners.entry(*client_id).or_insert_with(|| connection_id.to_owned());
            }
        }
    }

    async fn release(&self, connection_id: &str) -> Vec<u64> {
        let mut owners = self.owners.lock().await;
        let released: Vec<u64> =
            owners.iter().filter(|(_, owner)| *owner == connection_id).map(|(client_id, _)| *client_id).collect();
        for client_id in &released {
            owners.remove(client_id);
        }
        released
    }
}

pub struct ReplicationHost {
    rooms: Mutex<HashMap<String, Arc<ReplicaRoom>>>,
    fanout: RoomHub<Vec<u8>>,
}

impl Default for ReplicationHost {
    fn default() -> Self {
        Self { rooms: Mutex::new(HashMap::new()), fanout: RoomHub::new(RoomKind::Replication) }
    }
}

impl ReplicationHost {
    async fn enter(
        &self,
        document_id: &str,
        connection_id: &str,
        sender: mpsc::UnboundedSender<Vec<u8>>,
    ) -> Arc<ReplicaRoom> {
        let mut rooms = self.rooms.lock().await;
        let room = Arc::clone(
            rooms.entry(document_id.to_owned()).or_insert_with(|| Arc::new(ReplicaRoom::new())),
        );
        self.fanout.join(document_id, connection_id, sender).await;
        room
    }

    async fn exit(&self, document_id: &str, connection_id: &str) -> bool {
        let mut rooms = self.rooms.lock().await;
        let departure = self.fanout.leave(document_id, connection_id).await;
        if departure.room_closed {
            rooms.remove(document_id);
        }
        departure.room_closed
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.lock().await.len()
    }
}

#[derive(Clone)]
struct ReplicationState {
    admission: AdmissionGateway,
    host: Arc<ReplicationHost>,
}

pub fn router(admission: AdmissionGateway, host: Arc<ReplicationHost>) -> Router {
    Router::new()
        .route("/collab/{document_id}", get(collab_upgrade))
        .with_state(ReplicationState { admission, host })
}

async fn collab_upgrade(
    Path(document_id): Path<String>,
    State(state): State<ReplicationState>,
    uri: Uri,
    headers: HeaderMap,
    extensions: Extensions,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let trace_id = trace_id_from_headers_or_generate(&headers);
    let request = ConnectionRequest { uri, headers, peer: peer_addr(&extensions) };

    let identity = match with_trace_id_scope(trace_id.clone(), admit(&state.admission, &request)).await {
        Ok(identity) => identity,
        Err(response) => return response,
    };
    if document_id.trim().is_empty() || document_id.chars().count() > MAX_DOCUMENT_ID_LEN {
        return GatewayError::new(ErrorCode::MalformedPayload, "invalid document id").into_response();
    }
    let upgrade = match upgrade {
        Ok(upgrade) => upgrade,
        Err(rejection) => return rejection.into_response(),
    };

    metrics::record_connection_accepted();
    let span = tracing::info_span!(
        "replication_socket",
        user_id = %identity.user_id,
        connection_id = %identity.connection_id,
        document_id = %document_id,
        trace_id = %trace_id,
    );
    upgrade.max_frame_size(MAX_FRAME_BYTES).on_upgrade(move |socket| {
        with_trace_id_scope(trace_id, handle_socket(socket, state.host, identity, document_id))
            .instrument(span)
    })
}

async fn handle_socket(
    mut socket: WebSocket,
    host: Arc<ReplicationHost>,
    identity: SessionIdentity,
    document_id: String,
) {
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let room = host.enter(&document_id, &identity.connection_id, outbound_tx).await;
    info!("replication peer joined");

    if let Some(snapshot) = awareness_snapshot(&room).await {
        if socket.send(WsMessage::Binary(snapshot.into())).await.is_err() {
            depart(&host, &room, &identity, &document_id).await;
            return;
        }
    }

    loop {
        tokio::select! {
            incoming = socket.recv() => {
                let Some(Ok(message)) = incoming else {
                    break;
                };

                match message {
                    WsMessage::Binary(payload) => {
                        let outcome = process_incoming_binary(payload.as_ref(), &room, &identity.connection_id).await;
                        match outcome {
                            Ok(dispatch) => {
                                let mut failed = false;
                                for response in dispatch.responses {
                                    if socket.send(WsMessage::Binary(response.into())).await.is_err() {
                                        failed = true;
                                        break;
                                    }
                                }
                                for frame in dispatch.broadcasts {
                                    host.fanout.broadcast(&document_id, Some(&identity.connection_id), frame).await;
                                }
                                if failed {
                                    break;
                                }
                            }
                            Err(error) => {
                                warn!(?error, "failed to process y-sync frame");
                                break;
                            }
                        }
                    }
                    WsMessage::Close(_) => break,
                    WsMessage::Ping(payload) => {
                        if socket.send(WsMessage::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    WsMessage::Pong(_) | WsMessage::Text(_) => {}
                }
            }
            outbound = outbound_rx.recv() => {
                let Some(frame) = outbound else {
                    break;
                };
                if socket.send(WsMessage::Binary(frame.into())).await.is_err() {
                    break;
                }
            }
        }
    }

    depart(&host, &room, &identity, &document_id).await;
}

/// Remove the awareness states the departed connection owns and tell the
/// rest of the room, then release the room if it is now empty.
async fn depart(host: &ReplicationHost, room: &ReplicaRoom, identity: &SessionIdentity, document_id: &str) {
    let room_closed = host.exit(document_id, &identity.connection_id).await;
    let owned = room.release(&identity.connection_id).await;
    if !room_closed && !owned.is_empty() {
        let removal = {
            let awareness = room.awareness.lock().await;
            for client_id in &owned {
                awareness.remove_state(*client_id);
            }
            awareness.update_with_clients(owned.iter().copied())
        };
        match removal {
            Ok(update) => {
                let frame = Message::Awareness(update).encode_v1();
                host.fanout.broadcast(document_id, None, frame).await;
            }
            Err(error) => warn!(?error, "failed to encode awareness removal"),
        }
    }
    metrics::connection_closed();
    debug!(room_closed, "replication peer left");
}

async fn awareness_snapshot(room: &ReplicaRoom) -> Option<Vec<u8>> {
    let awareness = room.awareness.lock().await;
    if !awareness.iter().any(|(_, state)| state.data.is_some()) {
        return None;
    }
    awareness.update().ok().map(|update| Message::Awareness(update).encode_v1())
}

#[derive(Debug, Default)]
struct Dispatch {
    responses: Vec<Vec<u8>>,
    broadcasts: Vec<Vec<u8>>,
}

async fn process_incoming_binary(payload: &[u8], room: &ReplicaRoom, connection_id: &str) -> Result<Dispatch> {
    let protocol = DefaultProtocol;
    let mut dispatch = Dispatch::default();

    let awareness = room.awareness.lock().await;
    let mut decoder = DecoderV1::new(Cursor::new(payload));
    let mut reader = MessageReader::new(&mut decoder);

    while let Some(next_message) = reader.next() {
        let message = next_message.context("failed to decode y-sync message")?;
        match message {
            Message::Sync(SyncMessage::SyncStep1(state_vector)) => {
                if let Some(response) = protocol
                    .handle_sync_step1(&awareness, state_vector)
                    .context("failed to process sync step 1")?
                {
                    dispatch.responses.push(response.encode_v1());
                }
                let host_sv = awareness.doc().transact().state_vector();
                dispatch.responses.push(Message::Sync(SyncMessage::SyncStep1(host_sv)).encode_v1());
            }
            Message::Sync(SyncMessage::SyncStep2(update)) | Message::Sync(SyncMessage::Update(update)) => {
                let decoded = Update::decode_v1(&update).context("failed to decode update")?;
                protocol.handle_update(&awareness, decoded).context("failed to apply update")?;
                dispatch.broadcasts.push(Message::Sync(SyncMessage::Update(update)).encode_v1());
            }
            Message::Awareness(update) => {
                room.claim(connection_id, &update).await;
                if let Some(summary) =
                    awareness.apply_update_summary(update).context("failed to apply awareness update")?
                {
                    let changed = summary.all_changes();
                    if !changed.is_empty() {
                        let rebroadcast = awareness
                            .update_with_clients(changed)
                            .context("failed to encode awareness rebroadcast")?;
                        dispatch.broadcasts.push(Message::Awareness(rebroadcast).encode_v1());
                    }
                }
            }
            other => {
                if let Some(response) =
                    protocol.handle_message(&awareness, other).context("failed to process y-sync message")?
                {
                    dispatch.responses.push(response.encode_v1());
                }
            }
        }
    }

    Ok(dispatch)
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::time::Duration;

    use futures_util::{SinkExt, StreamExt};
    use tokio::net::TcpListener;
    use tokio::time::timeout;
    use tokio_tungstenite::{connect_async, tungstenite::Message as WsFrame, MaybeTlsStream, WebSocketStream};
    use yrs::sync::{Awareness, Message, SyncMessage};
    use yrs::updates::decoder::Decode;
    use yrs::updates::encoder::Encode;
    use yrs::{Doc, GetString, ReadTxn, StateVector, Text, Transact, Update};

    use super::*;
    use crate::auth::jwt::JwtAccessTokenService;
    use crate::config::{GatewayConfig, LogFormat};
    use crate::coordinator::{BucketSpec, Coordinator};

    const TEST_SECRET: &str = "tandem_test_secret_that_is_definitely_long_enough";

    type ClientSocket = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

    async fn spawn_host() -> (SocketAddr, Arc<JwtAccessTokenService>, Arc<ReplicationHost>) {
        let config = GatewayConfig {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            jwt_secret: TEST_SECRET.to_string(),
            database_url: None,
            connection_limit: BucketSpec::new(100, Duration::from_secs(60)),
            message_limit: BucketSpec::new(1, Duration::from_secs(60)),
            idempotency_ttl: Duration::from_secs(300),
            handshake_timeout: Duration::from_secs(5),
            trust_forwarded_for: false,
            sweep_interval: Duration::from_secs(60),
            log_filter: "info".to_string(),
            log_format: LogFormat::Pretty,
        };
        let jwt = Arc::new(JwtAccessTokenService::new(TEST_SECRET).expect("jwt service should initialize"));
        let admission = AdmissionGateway::new(&config, Arc::clone(&jwt), Coordinator::in_memory());
        let host = Arc::new(ReplicationHost::default());
        let app = router(admission, Arc::clone(&host));

        let listener = TcpListener::bind("127.0.0.1:0").await.expect("listener should bind");
        let addr = listener.local_addr().expect("listener should expose local address");
        tokio::spawn(async move {
            axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
                .await
                .expect("test server should run");
        });
        (addr, jwt, host)
    }

    async fn connect(addr: SocketAddr, jwt: &JwtAccessTokenService, user: &str) -> ClientSocket {
        let token = jwt.issue_token(user, &[]).expect("token should be issued");
        let (socket, _) = connect_async(format!("ws://{addr}/collab/doc-1?token={token}"))
            .await
            .expect("socket should connect");
        socket
    }

    async fn recv_message(socket: &mut ClientSocket) -> Message {
        loop {
            let frame = timeout(Duration::from_secs(2), socket.next())
                .await
                .expect("timed out waiting for frame")
                .expect("socket should remain open")
                .expect("frame should decode");
            if let WsFrame::Binary(payload) = frame {
                return Message::decode_v1(payload.as_ref()).expect("y-sync message should decode");
            }
        }
    }

    async fn send_message(socket: &mut ClientSocket, message: Message) {
        socket.send(WsFrame::Binary(message.encode_v1().into())).await.expect("frame should send");
    }

    #[tokio::test]
    async fn late_joiner_receives_existing_state_through_sync_step2() {
        let (addr, jwt, _host) = spawn_host().await;
        let mut writer = connect(addr, &jwt, "alice").await;

        let doc = Doc::with_client_id(1);
        let text = doc.get_or_insert_text("body");
        text.insert(&mut doc.transact_mut(), 0, "hello");
        let update = doc.transact().encode_state_as_update_v1(&StateVector::default());
        send_message(&mut writer, Message::Sync(SyncMessage::Update(update))).await;

        let mut reader = connect(addr, &jwt, "bob").await;
        send_message(&mut reader, Message::Sync(SyncMessage::SyncStep1(StateVector::default()))).await;

        let replica = Doc::with_client_id(2);
        loop {
            match recv_message(&mut reader).await {
                Message::Sync(SyncMessage::SyncStep2(update)) => {
                    let update = Update::decode_v1(&update).expect("update should decode");
                    replica.transact_mut().apply_update(update).expect("update should apply");
                    break;
                }
                _ => continue,
            }
        }
        let body = replica.get_or_insert_text("body");
        assert_eq!(body.get_string(&replica.transact()), "hello");
    }

    #[tokio::test]
    async fn frames_do_not_draw_from_the_message_budget() {
        let (addr, jwt, _host) = spawn_host().await;
        let mut socket = connect(addr, &jwt, "alice").await;

        // The configured message budget is 1; several sync rounds still answer.
        for _ in 0..3 {
            send_message(&mut socket, Message::Sync(SyncMessage::SyncStep1(StateVector::default()))).await;
            assert!(matches!(recv_message(&mut socket).await, Message::Sync(SyncMessage::SyncStep2(_))));
            assert!(matches!(recv_message(&mut socket).await, Message::Sync(SyncMessage::SyncStep1(_))));
        }
    }

    #[tokio::test]
    async fn departed_peer_awareness_is_removed_and_room_collected() {
        let (addr, jwt, host) = spawn_host().await;
        let mut alice = connect(addr, &jwt, "alice").await;
        let mut bob = connect(addr, &jwt, "bob").await;

        let alice_awareness = Awareness::new(Doc::with_client_id(11));
        alice_awareness
            .set_local_state(serde_json::json!({ "user": { "id": "alice" } }))
            .expect("local state should encode");
        let update = alice_awareness.update().expect("awareness update should encode");
        send_message(&mut alice, Message::Awareness(update)).await;

        match recv_message(&mut bob).await {
            Message::Awareness(update) => assert!(update.clients.contains_key(&11)),
            other => panic!("expected awareness update, got {other:?}"),
        }

        alice.close(None).await.expect("close should send");
        match recv_message(&mut bob).await {
            Message::Awareness(update) => {
                let entry = update.clients.get(&11).expect("removal entry for departed client");
                assert_eq!(entry.json.as_ref(), "null");
            }
            other => panic!("expected awareness removal, got {other:?}"),
        }

        bob.close(None).await.expect("close should send");
        timeout(Duration::from_secs(2), async {
            while host.room_count().await > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("room should be collected after the last peer leaves");
    }

    #[tokio::test]
    async fn departure_only_clears_states_the_connection_announced_first() {
        let (addr, jwt, _host) = spawn_host().await;
        let mut alice = connect(addr, &jwt, "alice").await;
        let alice_awareness = Awareness::new(Doc::with_client_id(11));
        alice_awareness
            .set_local_state(serde_json::json!({ "user": { "id": "alice" } }))
            .expect("local state should encode");
        let alice_update = alice_awareness.update().expect("awareness update should encode");
        send_message(&mut alice, Message::Awareness(alice_update.clone())).await;

        let mut carol = connect(addr, &jwt, "carol").await;
        match recv_message(&mut carol).await {
            Message::Awareness(update) => assert!(update.clients.contains_key(&11)),
            other => panic!("expected alice's awareness, got {other:?}"),
        }

        // Bob's client relays every state it knows, Alice's included.
        let mut bob = connect(addr, &jwt, "bob").await;
        assert!(matches!(recv_message(&mut bob).await, Message::Awareness(_)));
        let bob_awareness = Awareness::new(Doc::with_client_id(12));
        bob_awareness.apply_update(alice_update).expect("alice state should apply");
        bob_awareness
            .set_local_state(serde_json::json!({ "user": { "id": "bob" } }))
            .expect("local state should encode");
        send_message(&mut bob, Message::Awareness(bob_awareness.update().expect("encode"))).await;
        match recv_message(&mut carol).await {
            Message::Awareness(update) => assert!(update.clients.contains_key(&12)),
            other => panic!("expected bob's awareness, got {other:?}"),
        }

        bob.close(None).await.expect("close should send");
        match recv_message(&mut carol).await {
            Message::Awareness(update) => {
                assert_eq!(update.clients.get(&12).map(|entry| entry.json.as_ref()), Some("null"));
                assert!(!update.clients.contains_key(&11));
            }
            other => panic!("expected bob's removal, got {other:?}"),
        }

        let mut dave = connect(addr, &jwt, "dave").await;
        match recv_message(&mut dave).await {
            Message::Awareness(update) => {
                assert!(update.clients.contains_key(&11));
                assert!(!update.clients.contains_key(&12));
            }
            other => panic!("expected awareness snapshot, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unauthenticated_collab_upgrade_is_refused() {
        let (addr, _jwt, _host) = spawn_host().await;
        let error = connect_async(format!("ws://{addr}/collab/doc-1"))
            .await
            .expect_err("upgrade should be refused");
        match error {
            tokio_tungstenite::tungstenite::Error::Http(response) => {
                assert_eq!(response.status().as_u16(), 401)
            }
            other => panic!("expected HTTP rejection, got {other:?}"),
        }
    }
}
