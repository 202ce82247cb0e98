//! Signaling error types

use thiserror::Error;

/// Errors that can occur in the signaling subsystem
#[derive(Error, Debug)]
pub enum SignalingError {
    /// `send` was called before `open`
    #[error("Signaling not initialized")]
    NotInitialized,

    /// A negotiation message was sent before both sides signalled ready
    #[error("Peer not ready")]
    NotReady,

    #[error("Signaling transport error: {0}")]
    Transport(String),

    #[error("Signaling transport closed")]
    Closed,

    #[error("Serialize error: {0}")]
    Serialize(#[from] serde_json::Error),
}
