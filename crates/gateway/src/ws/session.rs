use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use chrono::Utc;
use serde_json::{json, Value};
use tandem_common::protocol::{
    command::{ClientCommand, RoomEvent, MAX_DOCUMENT_ID_LEN},
    envelope::{ClientEnvelope, ServerEnvelope},
    CLOSE_MESSAGE_RATE_LIMITED,
};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::admission::{AdmissionGateway, MessageAdmission, SessionIdentity};
use crate::error::{current_trace_id, ErrorCode, GatewayError};
use crate::metrics::{self, MessageOutcome};
use crate::rooms::RoomHub;

const HEARTBEAT_INTERVAL_MS: u64 = 15_000;
const IDLE_TIMEOUT_MS: u64 = 45_000;

enum Flow {
    Continue,
    Close,
}

struct CommandSocket {
    socket: WebSocket,
    identity: SessionIdentity,
    admission: AdmissionGateway,
    rooms: Arc<RoomHub<ServerEnvelope>>,
    outbound_tx: mpsc::UnboundedSender<ServerEnvelope>,
    joined: HashSet<String>,
    trace_id: String,
}

pub(super) async fn run(
    socket: WebSocket,
    identity: SessionIdentity,
    admission: AdmissionGateway,
    rooms: Arc<RoomHub<ServerEnvelope>>,
) {
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<ServerEnvelope>();
    let mut connection = CommandSocket {
        socket,
        identity,
        admission,
        rooms,
        outbound_tx,
        joined: HashSet::new(),
        trace_id: current_trace_id().unwrap_or_default(),
    };

    let auth_ok = ServerEnvelope::ok(
        "auth_ok",
        Some(json!({
            "userId": connection.identity.user_id,
            "connectionId": connection.identity.connection_id,
            "roles": connection.identity.roles,
        })),
        connection.trace_id.clone(),
        now_ms(),
    );
    if connection.send(&auth_ok).await.is_err() {
        connection.finish().await;
        return;
    }

    let mut heartbeat = tokio::time::interval(Duration::from_millis(HEARTBEAT_INTERVAL_MS));
    heartbeat.reset();
    let mut last_seen = Instant::now();
    let idle_timeout = Duration::from_millis(IDLE_TIMEOUT_MS);

    loop {
        tokio::select! {
            _ = heartbeat.tick() => {
                if last_seen.elapsed() > idle_timeout {
                    warn!("command socket idle timeout, disconnecting");
                    break;
                }
                if connection.socket.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
            maybe_outbound = outbound_rx.recv() => {
                let Some(envelope) = maybe_outbound else {
                    break;
                };
                if connection.send(&envelope).await.is_err() {
                    break;
                }
            }
            maybe_frame = connection.socket.recv() => {
                let Some(Ok(frame)) = maybe_frame else {
                    break;
                };
                last_seen = Instant::now();

                let flow = match frame {
                    Message::Text(raw) => connection.handle_text(raw.as_str()).await,
                    Message::Binary(_) => {
                        connection.reply_malformed(None, "binary frames are not accepted on the command socket").await
                    }
                    Message::Close(_) => Flow::Close,
                    Message::Ping(_) | Message::Pong(_) => Flow::Continue,
                };
                if matches!(flow, Flow::Close) {
                    break;
                }
            }
        }
    }

    connection.finish().await;
}

impl CommandSocket {
    async fn send(&mut self, envelope: &ServerEnvelope) -> Result<(), ()> {
        let encoded = serde_json::to_string(envelope).map_err(|_| ())?;
        self.socket.send(Message::Text(encoded.into())).await.map_err(|_| ())
    }

    /// Send, and translate a transport failure into closing the loop.
    async fn reply(&mut self, envelope: ServerEnvelope) -> Flow {
        match self.send(&envelope).await {
            Ok(()) => Flow::Continue,
            Err(()) => Flow::Close,
        }
    }

    async fn reply_error(&mut self, error: GatewayError, request_id: Option<&str>) -> Flow {
        let mut envelope = error.to_envelope(now_ms());
        if let Some(request_id) = request_id {
            envelope = envelope.with_request_id(request_id);
        }
        self.reply(envelope).await
    }

    async fn reply_malformed(&mut self, request_id: Option<&str>, message: &str) -> Flow {
        metrics::record_message(MessageOutcome::Malformed);
        self.reply_error(GatewayError::new(ErrorCode::MalformedPayload, message), request_id).await
    }

    async fn handle_text(&mut self, raw: &str) -> Flow {
        let envelope = match ClientEnvelope::parse(raw) {
            Ok(envelope) => envelope,
            Err(error) => {
                debug!(error = %error, "malformed command frame");
                let request_id = error.request_id().map(ToOwned::to_owned);
                return self.reply_malformed(request_id.as_deref(), &error.to_string()).await;
            }
        };
        let request_id = envelope.request_id.as_str();

        let admission = match self.admission.admit_message(&self.identity, request_id).await {
            Ok(admission) => admission,
            Err(error) => {
                warn!(error = ?error, request_id, "message admission unavailable");
                return self
                    .reply_error(GatewayError::from_code(ErrorCode::InternalError), Some(request_id))
                    .await;
            }
        };

        match admission {
            MessageAdmission::Duplicate => {
                metrics::record_message(MessageOutcome::Duplicate);
                self.reply_error(GatewayError::from_code(ErrorCode::DuplicateRequest), Some(request_id))
                    .await
            }
            MessageAdmission::Throttled { retry_after } => {
                metrics::record_message(MessageOutcome::Throttled);
                info!(request_id, retry_after_ms = retry_after.as_millis() as u64, "message budget exhausted, closing");
                let notice = GatewayError::from_code(ErrorCode::MessageThrottled).with_retry_after(retry_after);
                self.reply_error(notice, Some(request_id)).await;
                let _ = self
                    .socket
                    .send(Message::Close(Some(CloseFrame {
                        code: CLOSE_MESSAGE_RATE_LIMITED,
                        reason: ErrorCode::MessageThrottled.default_message().into(),
                    })))
                    .await;
                Flow::Close
            }
            MessageAdmission::Accepted => {
                let request_id = envelope.request_id.clone();
                match self.dispatch(envelope.command).await {
                    Ok((message, data)) => {
                        metrics::record_message(MessageOutcome::Processed);
                        let reply = ServerEnvelope::ok(message, data, self.trace_id.clone(), now_ms())
                            .with_request_id(request_id);
                        self.reply(reply).await
                    }
                    Err(error) => {
                        metrics::record_message(MessageOutcome::Malformed);
                        self.admission.release_message(&self.identity, &request_id).await;
                        self.reply_error(error, Some(&request_id)).await
                    }
                }
            }
        }
    }

    async fn dispatch(&mut self, command: ClientCommand) -> Result<(&'static str, Option<Value>), GatewayError> {
        if let Some(document_id) = command.document_id() {
            validate_document_id(document_id)?;
        }

        match command {
            ClientCommand::Ping => Ok(("pong", Some(json!({ "serverTime": now_ms() })))),
            ClientCommand::Whoami => Ok((
                "ok",
                Some(json!({
                    "userId": self.identity.user_id,
                    "roles": self.identity.roles,
                    "connectionId": self.identity.connection_id,
                })),
            )),
            ClientCommand::Join { document_id } => {
                let newly_joined = self
                    .rooms
                    .join(&document_id, &self.identity.connection_id, self.outbound_tx.clone())
                    .await;
                if newly_joined {
                    self.joined.insert(document_id.clone());
                    self.publish(RoomEvent::PeerJoined {
                        document_id: document_id.clone(),
                        user_id: self.identity.user_id.clone(),
                        connection_id: self.identity.connection_id.clone(),
                    })
                    .await;
                }
                let members = self.rooms.member_count(&document_id).await;
                Ok(("joined", Some(json!({ "documentId": document_id, "members": members }))))
            }
            ClientCommand::Leave { document_id } => {
                let departure = self.rooms.leave(&document_id, &self.identity.connection_id).await;
                self.joined.remove(&document_id);
                if departure.was_member && !departure.room_closed {
                    self.publish(RoomEvent::PeerLeft {
                        document_id: document_id.clone(),
                        user_id: self.identity.user_id.clone(),
                        connection_id: self.identity.connection_id.clone(),
                    })
                    .await;
                }
                Ok(("left", Some(json!({ "documentId": document_id, "wasMember": departure.was_member }))))
            }
            ClientCommand::Announce { document_id, payload } => {
                if !self.joined.contains(&document_id) {
                    return Err(GatewayError::new(
                        ErrorCode::MalformedPayload,
                        "announce requires joining the document room first",
                    ));
                }
                let delivered = self
                    .publish(RoomEvent::Announcement {
                        document_id: document_id.clone(),
                        user_id: self.identity.user_id.clone(),
                        connection_id: self.identity.connection_id.clone(),
                        payload,
                    })
                    .await;
                Ok(("announced", Some(json!({ "documentId": document_id, "delivered": delivered }))))
            }
        }
    }

    async fn publish(&mut self, event: RoomEvent) -> usize {
        let document_id = match &event {
            RoomEvent::PeerJoined { document_id, .. }
            | RoomEvent::PeerLeft { document_id, .. }
            | RoomEvent::Announcement { document_id, .. } => document_id.clone(),
        };
        let data = match serde_json::to_value(&event) {
            Ok(data) => data,
            Err(error) => {
                warn!(error = %error, "failed to encode room event");
                return 0;
            }
        };
        let envelope = ServerEnvelope::ok("event", Some(data), self.trace_id.clone(), now_ms());
        self.rooms.broadcast(&document_id, Some(event.origin()), envelope).await
    }

    async fn finish(mut self) {
        for (document_id, departure) in self.rooms.leave_all(&self.identity.connection_id).await {
            if departure.was_member && !departure.room_closed {
                self.publish(RoomEvent::PeerLeft {
                    document_id,
                    user_id: self.identity.user_id.clone(),
                    connection_id: self.identity.connection_id.clone(),
                })
                .await;
            }
        }
        metrics::connection_closed();
        info!("command socket closed");
    }
}

fn validate_document_id(document_id: &str) -> Result<(), GatewayError> {
    if document_id.trim().is_empty() || document_id.chars().count() > MAX_DOCUMENT_ID_LEN {
        return Err(GatewayError::new(
            ErrorCode::MalformedPayload,
            format!("documentId must be 1..={MAX_DOCUMENT_ID_LEN} characters"),
        ));
    }
    Ok(())
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::validate_document_id;

    #[test]
    fn document_ids_are_bounded() {
        assert!(validate_document_id("doc-1").is_ok());
        assert!(validate_document_id("  ").is_err());
        assert!(validate_document_id(&"x".repeat(129)).is_err());
    }
}
