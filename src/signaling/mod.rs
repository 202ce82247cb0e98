//! Signaling relay
//!
//! Carries offer/answer/candidate envelopes and the readiness handshake
//! between the two members of a room. The relay owns transport only; all
//! negotiation state lives in the session orchestrator.

mod envelope;
mod error;
mod hub;
mod relay;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::identity::Identity;
use crate::matching::RoomCode;

pub use envelope::{SignalKind, SignalingEnvelope};
pub use error::SignalingError;
pub use hub::SignalingHub;
pub use relay::{RelayEvent, SignalingRelay};

/// Message bus underneath a [`SignalingRelay`].
///
/// Implemented in-process by [`SignalingHub`] and remotely by
/// [`crate::net::LobbyClient`]. Subscriptions may over-deliver; the relay
/// filters by room, sender and recipient.
#[async_trait]
pub trait SignalTransport: Send + Sync {
    /// Publish an envelope to the room's subscribers
    async fn publish(&self, envelope: SignalingEnvelope) -> Result<(), SignalingError>;

    /// Start receiving envelopes for `room_code` addressed to `recipient`
    async fn subscribe(
        &self,
        room_code: &RoomCode,
        recipient: &Identity,
    ) -> Result<broadcast::Receiver<SignalingEnvelope>, SignalingError>;

    /// Stop receiving envelopes for `room_code`
    async fn unsubscribe(&self, _room_code: &RoomCode, _recipient: &Identity) {}
}
