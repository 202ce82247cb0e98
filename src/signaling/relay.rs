//! Per-room signaling relay with readiness handshake
//!
//! ```text
//! open():  subscribe -> start pump -> mark local ready -> send ready{ack:false}
//! pump:    ready{ack:false} from peer -> reply ready{ack:true}, mark remote
//!          ready{ack:true}  from peer -> mark remote
//! Ready fires once, when local and remote are both marked.
//! ```
//!
//! A peer that subscribes after our announcement misses it, but its own
//! announcement reaches us and our acknowledgement reaches it.

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::envelope::{SignalKind, SignalingEnvelope};
use super::error::SignalingError;
use super::SignalTransport;
use crate::identity::Identity;
use crate::matching::RoomCode;

/// Capacity of the relay event channel
const EVENT_CAPACITY: usize = 64;

/// Events surfaced by an open relay
#[derive(Debug, Clone, PartialEq)]
pub enum RelayEvent {
    /// Both sides can receive each other's messages. Fires once per room.
    Ready { room_code: RoomCode },
    /// An offer, answer or candidate from the peer
    Signal(SignalingEnvelope),
}

#[derive(Debug, Default)]
struct Readiness {
    local: bool,
    remote: bool,
    fired: bool,
}

impl Readiness {
    /// Returns true on the single call that completes the handshake
    fn mark(&mut self, local: bool) -> bool {
        if local {
            self.local = true;
        } else {
            self.remote = true;
        }

        if self.local && self.remote && !self.fired {
            self.fired = true;
            return true;
        }
        false
    }
}

/// Addressing of an open channel
#[derive(Debug, Clone)]
struct Route {
    room_code: RoomCode,
    me: Identity,
    peer: Identity,
}

impl Route {
    fn envelope(&self, kind: SignalKind, payload: serde_json::Value) -> SignalingEnvelope {
        SignalingEnvelope::new(
            self.room_code.clone(),
            self.me.clone(),
            self.peer.clone(),
            kind,
            payload,
        )
    }
}

struct OpenChannel {
    route: Route,
    readiness: Arc<Mutex<Readiness>>,
    pump: JoinHandle<()>,
}

/// Bidirectional signaling channel between the two members of one room
pub struct SignalingRelay {
    transport: Arc<dyn SignalTransport>,
    channel: Option<OpenChannel>,
    events: broadcast::Sender<RelayEvent>,
}

impl SignalingRelay {
    pub fn new(transport: Arc<dyn SignalTransport>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            transport,
            channel: None,
            events,
        }
    }

    /// Subscribe to relay events. Subscribe before `open` to observe `Ready`.
    pub fn subscribe(&self) -> broadcast::Receiver<RelayEvent> {
        self.events.subscribe()
    }

    /// Open the channel for `room_code` and announce readiness.
    ///
    /// Only envelopes addressed to `me` from `peer` in this room are surfaced.
    /// An already open channel is closed first.
    pub async fn open(
        &mut self,
        room_code: RoomCode,
        me: Identity,
        peer: Identity,
    ) -> Result<(), SignalingError> {
        self.close();

        let route = Route {
            room_code,
            me,
            peer,
        };
        let rx = self.transport.subscribe(&route.room_code, &route.me).await?;
        let readiness = Arc::new(Mutex::new(Readiness::default()));

        let task = tokio::spawn(pump(
            rx,
            route.clone(),
            readiness.clone(),
            self.transport.clone(),
            self.events.clone(),
        ));

        self.channel = Some(OpenChannel {
            route: route.clone(),
            readiness: readiness.clone(),
            pump: task,
        });

        debug!(
            "Relay open in {} for {} <-> {}",
            route.room_code.display_suffix(),
            route.me,
            route.peer
        );

        // Mark before announcing so a fast acknowledgement completes the handshake
        let fired = readiness.lock().mark(true);
        if fired {
            fire_ready(&self.events, &route);
        }

        let announce = route.envelope(SignalKind::Ready, json!({ "ack": false }));
        if let Err(e) = self.transport.publish(announce).await {
            self.close();
            return Err(e);
        }

        Ok(())
    }

    /// Send a negotiation message to the peer.
    ///
    /// Fails with [`SignalingError::NotInitialized`] before `open`, and with
    /// [`SignalingError::NotReady`] until the handshake has completed.
    pub async fn send(
        &self,
        kind: SignalKind,
        payload: serde_json::Value,
    ) -> Result<(), SignalingError> {
        let channel = self.channel.as_ref().ok_or(SignalingError::NotInitialized)?;

        if kind != SignalKind::Ready && !channel.readiness.lock().fired {
            return Err(SignalingError::NotReady);
        }

        self.transport
            .publish(channel.route.envelope(kind, payload))
            .await
    }

    /// Whether both sides have signalled ready
    pub fn is_ready(&self) -> bool {
        self.channel
            .as_ref()
            .is_some_and(|channel| channel.readiness.lock().fired)
    }

    pub fn is_open(&self) -> bool {
        self.channel.is_some()
    }

    pub fn room_code(&self) -> Option<&RoomCode> {
        self.channel.as_ref().map(|channel| &channel.route.room_code)
    }

    /// Stop delivering messages; idempotent
    pub fn close(&mut self) {
        if let Some(channel) = self.channel.take() {
            channel.pump.abort();
            debug!(
                "Relay closed in {}",
                channel.route.room_code.display_suffix()
            );
        }
    }

    /// Close and release the transport subscription
    pub async fn dispose(&mut self) {
        if let Some(channel) = self.channel.as_ref() {
            let route = channel.route.clone();
            self.close();
            self.transport
                .unsubscribe(&route.room_code, &route.me)
                .await;
        }
    }
}

impl Drop for SignalingRelay {
    fn drop(&mut self) {
        self.close();
    }
}

fn fire_ready(events: &broadcast::Sender<RelayEvent>, route: &Route) {
    info!(
        "Signaling ready in {} ({} <-> {})",
        route.room_code.display_suffix(),
        route.me,
        route.peer
    );
    let _ = events.send(RelayEvent::Ready {
        room_code: route.room_code.clone(),
    });
}

/// Filter the transport stream down to this route and run the handshake
async fn pump(
    mut rx: broadcast::Receiver<SignalingEnvelope>,
    route: Route,
    readiness: Arc<Mutex<Readiness>>,
    transport: Arc<dyn SignalTransport>,
    events: broadcast::Sender<RelayEvent>,
) {
    loop {
        let envelope = match rx.recv().await {
            Ok(envelope) => envelope,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(
                    "Relay in {} lagged, {} envelopes skipped",
                    route.room_code.display_suffix(),
                    skipped
                );
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => {
                debug!(
                    "Signaling transport for {} closed",
                    route.room_code.display_suffix()
                );
                break;
            }
        };

        if !envelope.is_for(&route.room_code, &route.me, &route.peer) {
            trace!(
                "Dropped {} from {} to {} (not for {})",
                envelope.kind,
                envelope.sender,
                envelope.recipient,
                route.me
            );
            continue;
        }

        if envelope.kind != SignalKind::Ready {
            let _ = events.send(RelayEvent::Signal(envelope));
            continue;
        }

        let ack = envelope
            .payload
            .get("ack")
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false);

        if !ack {
            let reply = route.envelope(SignalKind::Ready, json!({ "ack": true }));
            if let Err(e) = transport.publish(reply).await {
                warn!("Failed to acknowledge ready from {}: {}", route.peer, e);
            }
        }

        let fired = readiness.lock().mark(false);
        if fired {
            fire_ready(&events, &route);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_readiness_fires_once() {
        let mut readiness = Readiness::default();
        assert!(!readiness.mark(false));
        assert!(readiness.mark(true));
        assert!(!readiness.mark(false));
        assert!(!readiness.mark(true));
    }

    #[tokio::test]
    async fn test_send_before_open_fails() {
        let relay = SignalingRelay::new(Arc::new(crate::signaling::SignalingHub::new()));
        let result = relay.send(SignalKind::Offer, serde_json::Value::Null).await;
        assert!(matches!(result, Err(SignalingError::NotInitialized)));
        assert!(!relay.is_ready());
    }
}
