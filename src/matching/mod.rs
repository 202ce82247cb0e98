//! Matching queue
//!
//! Holds anonymous participants waiting for a partner and pairs them into
//! two-member rooms, one atomic commit per pair.

mod error;
mod queue;
mod room;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::identity::Identity;

pub use error::MatchError;
pub use queue::{MatchingQueue, WaitingEntry, MAX_MATCH_ATTEMPTS};
pub use room::{EntryId, MatchNotice, QueueEvent, Room, RoomCode};

/// Queue operations as seen by a participant session.
///
/// Implemented in-process by [`MatchingQueue`] and remotely by
/// [`crate::net::LobbyClient`].
#[async_trait]
pub trait Matchmaker: Send + Sync {
    /// Enter the waiting pool (replacing any stale entry) and try to match
    async fn join(&self, identity: &Identity) -> Result<EntryId, MatchError>;

    /// Leave the waiting pool; no-op if not waiting
    async fn leave(&self, identity: &Identity) -> Result<(), MatchError>;

    /// Deactivate the caller's active room and leave the pool; idempotent.
    ///
    /// Returns the code of the room this call ended, if any.
    async fn end_room(&self, identity: &Identity) -> Result<Option<RoomCode>, MatchError>;

    /// Deactivate `room_code` if it is still the caller's active room.
    /// The waiting pool is not touched.
    async fn close_room(
        &self,
        identity: &Identity,
        room_code: &RoomCode,
    ) -> Result<bool, MatchError>;

    /// Advisory count of unmatched waiting participants
    async fn count_waiting(&self) -> Result<usize, MatchError>;

    /// Subscribe to match and room-ended events
    fn events(&self) -> broadcast::Receiver<QueueEvent>;
}
