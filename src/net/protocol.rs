//! Lobby wire protocol
//!
//! JSON text frames over WebSocket. Every client request gets exactly one
//! reply, in request order; queue events and signaling envelopes are pushed
//! in between as they occur.

use serde::{Deserialize, Serialize};

use crate::identity::Identity;
use crate::matching::{EntryId, QueueEvent, RoomCode};
use crate::signaling::SignalingEnvelope;

/// Client -> server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ClientMessage {
    /// Enter the waiting pool. Binds the connection to `identity`.
    Join { identity: Identity },
    Leave,
    /// End the bound identity's active room, or only `room_code` if given
    EndRoom {
        #[serde(default)]
        room_code: Option<RoomCode>,
    },
    CountWaiting,
    /// Receive envelopes for a room the bound identity is a member of
    Subscribe { room_code: RoomCode },
    Unsubscribe { room_code: RoomCode },
    Signal { envelope: SignalingEnvelope },
}

/// Server -> client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ServerMessage {
    Joined { entry_id: EntryId },
    Ack,
    /// Reply to `EndRoom`: the room that was ended, if any
    Closed { room_code: Option<RoomCode> },
    WaitingCount { count: usize },
    Error { message: String },

    // Pushed
    Queue { event: QueueEvent },
    Signal { envelope: SignalingEnvelope },
}

impl ServerMessage {
    /// Whether this message answers a request, as opposed to a push
    pub fn is_reply(&self) -> bool {
        !matches!(self, ServerMessage::Queue { .. } | ServerMessage::Signal { .. })
    }

    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_message_shape() {
        let msg = ClientMessage::Join {
            identity: Identity::new("alice@uni.edu").unwrap(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"Join\""));
        assert!(json.contains("\"identity\":\"alice@uni.edu\""));

        let unit: ClientMessage = serde_json::from_str(r#"{"type":"CountWaiting"}"#).unwrap();
        assert_eq!(unit, ClientMessage::CountWaiting);

        let end: ClientMessage = serde_json::from_str(r#"{"type":"EndRoom","data":{}}"#).unwrap();
        assert_eq!(end, ClientMessage::EndRoom { room_code: None });
    }

    #[test]
    fn test_blank_join_rejected() {
        let blank = serde_json::from_str::<ClientMessage>(
            r#"{"type":"Join","data":{"identity":"   "}}"#,
        );
        assert!(blank.is_err());
    }

    #[test]
    fn test_replies_and_pushes() {
        assert!(ServerMessage::Ack.is_reply());
        assert!(ServerMessage::error("nope").is_reply());

        let event = QueueEvent::RoomEnded {
            room_code: RoomCode::generate(),
            members: [
                Identity::new("alice@uni.edu").unwrap(),
                Identity::new("bob@uni.edu").unwrap(),
            ],
            ended_by: Identity::new("bob@uni.edu").unwrap(),
        };
        let pushed = ServerMessage::Queue { event };
        assert!(!pushed.is_reply());

        let json = serde_json::to_string(&pushed).unwrap();
        let back: ServerMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back, pushed);
    }
}
