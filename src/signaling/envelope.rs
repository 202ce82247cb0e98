//! Signaling envelopes

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::identity::Identity;
use crate::matching::RoomCode;

/// Kind of a signaling envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    Offer,
    Answer,
    Candidate,
    Ready,
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SignalKind::Offer => "offer",
            SignalKind::Answer => "answer",
            SignalKind::Candidate => "candidate",
            SignalKind::Ready => "ready",
        };
        f.write_str(name)
    }
}

/// One negotiation message addressed to a specific peer in a specific room
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalingEnvelope {
    pub room_code: RoomCode,
    pub sender: Identity,
    pub recipient: Identity,
    pub kind: SignalKind,
    /// Opaque to the relay
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl SignalingEnvelope {
    pub fn new(
        room_code: RoomCode,
        sender: Identity,
        recipient: Identity,
        kind: SignalKind,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            room_code,
            sender,
            recipient,
            kind,
            payload,
            timestamp: Utc::now(),
        }
    }

    /// Whether this envelope belongs to the given room and direction
    pub fn is_for(&self, room_code: &RoomCode, recipient: &Identity, sender: &Identity) -> bool {
        &self.room_code == room_code && &self.recipient == recipient && &self.sender == sender
    }
}
