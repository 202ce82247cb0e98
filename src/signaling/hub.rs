//! In-process signaling hub
//!
//! One broadcast channel per room, created on first subscription. Publishing
//! to a room nobody has subscribed to yet drops the envelope, which is the
//! situation the readiness handshake exists for.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::{debug, trace};

use super::envelope::SignalingEnvelope;
use super::error::SignalingError;
use super::SignalTransport;
use crate::identity::Identity;
use crate::matching::RoomCode;

/// Default per-room channel capacity
const ROOM_CHANNEL_CAPACITY: usize = 100;

/// Room-scoped broadcast bus
pub struct SignalingHub {
    rooms: RwLock<HashMap<RoomCode, broadcast::Sender<SignalingEnvelope>>>,
    capacity: usize,
}

impl SignalingHub {
    pub fn new() -> Self {
        Self::with_capacity(ROOM_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Deliver an envelope to current subscribers of its room.
    ///
    /// Returns the number of subscribers reached.
    pub fn deliver(&self, envelope: SignalingEnvelope) -> usize {
        let rooms = self.rooms.read();
        let Some(tx) = rooms.get(&envelope.room_code) else {
            debug!(
                "No subscribers in {} for {} from {}, dropped",
                envelope.room_code.display_suffix(),
                envelope.kind,
                envelope.sender
            );
            return 0;
        };

        trace!(
            "{} {} -> {} in {}",
            envelope.kind,
            envelope.sender,
            envelope.recipient,
            envelope.room_code.display_suffix()
        );
        tx.send(envelope).unwrap_or(0)
    }

    /// Subscribe to a room's envelopes
    pub fn attach(&self, room_code: &RoomCode) -> broadcast::Receiver<SignalingEnvelope> {
        let mut rooms = self.rooms.write();

        // Drop channels whose subscribers are all gone
        rooms.retain(|code, tx| code == room_code || tx.receiver_count() > 0);

        rooms
            .entry(room_code.clone())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Remove a room's channel; live receivers observe `Closed`
    pub fn close_room(&self, room_code: &RoomCode) {
        if self.rooms.write().remove(room_code).is_some() {
            debug!("Signaling channel for {} closed", room_code.display_suffix());
        }
    }

    /// Number of rooms with a channel
    pub fn room_count(&self) -> usize {
        self.rooms.read().len()
    }
}

impl Default for SignalingHub {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SignalTransport for SignalingHub {
    async fn publish(&self, envelope: SignalingEnvelope) -> Result<(), SignalingError> {
        self.deliver(envelope);
        Ok(())
    }

    async fn subscribe(
        &self,
        room_code: &RoomCode,
        _recipient: &Identity,
    ) -> Result<broadcast::Receiver<SignalingEnvelope>, SignalingError> {
        Ok(self.attach(room_code))
    }
}
