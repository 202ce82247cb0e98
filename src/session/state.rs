//! Connection state for one local participant

use std::fmt;

use serde::{Deserialize, Serialize};

/// Connection state
///
/// ```text
/// [*] --> Idle
/// Idle --> Searching: connect()
/// Searching --> Matched: match event
/// Matched --> AwaitingReadiness: relay opened
/// AwaitingReadiness --> Negotiating: both sides ready
/// Negotiating --> Connected: capability host reports connected
/// Matched/AwaitingReadiness/Negotiating/Connected --> Ended: peer left / disconnected
/// Matched/AwaitingReadiness/Negotiating/Connected --> Failed: negotiation or transport failure
/// any --> Searching: skip()
/// any --> Idle: disconnect()
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Not in the queue
    #[default]
    Idle,
    /// Waiting in the queue
    Searching,
    /// Room committed, relay not yet open
    Matched,
    /// Relay open, waiting for the peer's ready signal
    AwaitingReadiness,
    /// Exchanging offer, answer and candidates
    Negotiating,
    /// Peer connection established
    Connected,
    /// Room ended normally
    Ended,
    /// Room ended by a negotiation or transport failure
    Failed,
}

impl ConnectionState {
    /// Whether the participant currently holds a room
    pub fn is_in_room(&self) -> bool {
        matches!(
            self,
            Self::Matched | Self::AwaitingReadiness | Self::Negotiating | Self::Connected
        )
    }

    /// Terminal for the current room; a new room starts from a fresh state
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Ended | Self::Failed)
    }

    /// Whether `connect()` starts a new search from here
    pub fn can_connect(&self) -> bool {
        matches!(self, Self::Idle | Self::Ended | Self::Failed)
    }

    /// Check if the data channel can carry messages
    pub fn can_send_data(&self) -> bool {
        matches!(self, Self::Connected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Searching => "searching",
            Self::Matched => "matched",
            Self::AwaitingReadiness => "awaiting-readiness",
            Self::Negotiating => "negotiating",
            Self::Connected => "connected",
            Self::Ended => "ended",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}
