//! Matching queue error types

use thiserror::Error;

/// Errors that can occur in the matching subsystem
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MatchError {
    /// The queue backend could not record the join
    #[error("Failed to join queue: {0}")]
    JoinFailed(String),

    /// The selected partner was claimed or left before the pair committed
    #[error("Match candidate vanished before commit")]
    RaceLost,

    #[error("Invalid identity")]
    InvalidIdentity,

    /// A remote lobby connection is already bound to another identity
    #[error("Connection already bound to {0}")]
    AlreadyBound(String),
}
