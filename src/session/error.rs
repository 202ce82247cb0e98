//! Session error types

use thiserror::Error;

use crate::matching::MatchError;
use crate::signaling::SignalingError;

/// Errors surfaced to the application by a participant session
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Failed to join queue: {0}")]
    Join(#[from] MatchError),

    /// Local media could not be acquired; joining is blocked until resolved
    #[error("Media unavailable: {0}")]
    CapabilityUnavailable(String),

    #[error("Negotiation failed: {0}")]
    NegotiationFailed(String),

    #[error("Not connected")]
    NotConnected,

    #[error("Signaling error: {0}")]
    Signaling(#[from] SignalingError),

    /// The session task has exited
    #[error("Session stopped")]
    Stopped,
}
