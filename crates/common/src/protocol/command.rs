// Command kinds accepted on the gateway command socket, and the room events
// pushed back to members.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Longest document id accepted in room commands.
pub const MAX_DOCUMENT_ID_LEN: usize = 128;

/// Client -> server commands. Each kind carries its own payload; the
/// surrounding `requestId` lives on [`super::envelope::ClientEnvelope`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ClientCommand {
    /// Liveness check; answered with the server clock.
    Ping,
    /// Echo the identity attached at admission.
    Whoami,
    /// Join a document room to receive peer events.
    Join { document_id: String },
    /// Leave a previously joined room.
    Leave { document_id: String },
    /// Fan an ephemeral payload out to the other members of a room.
    Announce { document_id: String, payload: Value },
}

impl ClientCommand {
    /// Stable label used in logs and metrics.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Ping => "ping",
            Self::Whoami => "whoami",
            Self::Join { .. } => "join",
            Self::Leave { .. } => "leave",
            Self::Announce { .. } => "announce",
        }
    }

    pub fn document_id(&self) -> Option<&str> {
        match self {
            Self::Join { document_id }
            | Self::Leave { document_id }
            | Self::Announce { document_id, .. } => Some(document_id),
            Self::Ping | Self::Whoami => None,
        }
    }
}

/// Server -> client room events, carried as the `data` of an `event` envelope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum RoomEvent {
    PeerJoined { document_id: String, user_id: String, connection_id: String },
    PeerLeft { document_id: String, user_id: String, connection_id: String },
    Announcement { document_id: String, user_id: String, connection_id: String, payload: Value },
}

impl RoomEvent {
    /// Connection that caused the event; members never receive their own.
    pub fn origin(&self) -> &str {
        match self {
            Self::PeerJoined { connection_id, .. }
            | Self::PeerLeft { connection_id, .. }
            | Self::Announcement { connection_id, .. } => connection_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn command_tags_are_snake_case_with_camel_case_fields() {
        let command = ClientCommand::Announce {
            document_id: "doc-1".to_string(),
            payload: json!({ "typing": true }),
        };
        let value = serde_json::to_value(&command).expect("command should serialize");
        assert_eq!(value, json!({ "type": "announce", "documentId": "doc-1", "payload": { "typing": true } }));
    }

    #[test]
    fn unit_commands_parse_from_type_only() {
        let ping: ClientCommand =
            serde_json::from_value(json!({ "type": "ping", "requestId": "r" })).expect("ping");
        assert_eq!(ping, ClientCommand::Ping);
        assert_eq!(ping.kind(), "ping");
        assert_eq!(ping.document_id(), None);
    }

    #[test]
    fn room_event_shape() {
        let event = RoomEvent::PeerJoined {
            document_id: "doc-1".to_string(),
            user_id: "u1".to_string(),
            connection_id: "c1".to_string(),
        };
        let value = serde_json::to_value(&event).expect("event should serialize");
        assert_eq!(value["event"], "peer_joined");
        assert_eq!(value["documentId"], "doc-1");
        assert_eq!(value["connectionId"], "c1");
        assert_eq!(event.origin(), "c1");
    }
}
