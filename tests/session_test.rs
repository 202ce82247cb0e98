//! Session orchestrator tests
//!
//! Full participant lifecycles over the in-process queue, hub and loopback
//! capability host.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;

use pairup::config::SessionConfig;
use pairup::identity::{Identity, Role};
use pairup::matching::{EntryId, MatchError, MatchingQueue, Matchmaker, QueueEvent, RoomCode};
use pairup::session::{
    CapabilityHost, ConnectionState, IceCandidate, LoopbackHost, LoopbackNetwork,
    LoopbackOptions, LoopbackStats, MediaConstraints, Orchestrator, SessionDescription,
    SessionError, SessionEvent, SessionHandle,
};
use pairup::signaling::{
    RelayEvent, SignalKind, SignalTransport, SignalingEnvelope, SignalingHub, SignalingRelay,
};

const WAIT: Duration = Duration::from_secs(5);

fn id(s: &str) -> Identity {
    Identity::new(s).unwrap()
}

fn fast_config() -> SessionConfig {
    SessionConfig {
        settle_delay_ms: 0,
        ..Default::default()
    }
}

struct Lobby {
    queue: Arc<MatchingQueue>,
    hub: Arc<SignalingHub>,
    network: Arc<LoopbackNetwork>,
}

impl Lobby {
    fn new() -> Self {
        Self {
            queue: Arc::new(MatchingQueue::new()),
            hub: Arc::new(SignalingHub::new()),
            network: LoopbackNetwork::new(),
        }
    }

    fn participant(
        &self,
        name: &str,
        options: LoopbackOptions,
        config: SessionConfig,
    ) -> (SessionHandle, Arc<LoopbackHost>) {
        self.participant_with(name, self.queue.clone(), options, config)
    }

    fn participant_with(
        &self,
        name: &str,
        matchmaker: Arc<dyn Matchmaker>,
        options: LoopbackOptions,
        config: SessionConfig,
    ) -> (SessionHandle, Arc<LoopbackHost>) {
        let host = Arc::new(LoopbackHost::new(self.network.clone(), options));
        let handle = Orchestrator::spawn(id(name), matchmaker, self.hub.clone(), host.clone(), config);
        (handle, host)
    }
}

/// Queue front whose event stream can be fed extra, out-of-date events
struct ReplayingMatchmaker {
    queue: Arc<MatchingQueue>,
    events: broadcast::Sender<QueueEvent>,
}

impl ReplayingMatchmaker {
    fn new(queue: Arc<MatchingQueue>) -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        let mut source = queue.subscribe();
        let forward = events.clone();
        tokio::spawn(async move {
            loop {
                match source.recv().await {
                    Ok(event) => {
                        let _ = forward.send(event);
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Arc::new(Self { queue, events })
    }

    fn replay(&self, event: QueueEvent) {
        let _ = self.events.send(event);
    }
}

#[async_trait]
impl Matchmaker for ReplayingMatchmaker {
    async fn join(&self, identity: &Identity) -> Result<EntryId, MatchError> {
        self.queue.join(identity).await
    }

    async fn leave(&self, identity: &Identity) -> Result<(), MatchError> {
        self.queue.leave(identity).await
    }

    async fn end_room(&self, identity: &Identity) -> Result<Option<RoomCode>, MatchError> {
        self.queue.end_room(identity).await
    }

    async fn close_room(
        &self,
        identity: &Identity,
        room_code: &RoomCode,
    ) -> Result<bool, MatchError> {
        self.queue.close_room(identity, room_code).await
    }

    async fn count_waiting(&self) -> Result<usize, MatchError> {
        self.queue.count_waiting().await
    }

    fn events(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }
}

/// Wait for the first event matching `pred`
async fn wait_event<F>(rx: &mut broadcast::Receiver<SessionEvent>, pred: F) -> Option<SessionEvent>
where
    F: Fn(&SessionEvent) -> bool,
{
    tokio::time::timeout(WAIT, async {
        loop {
            match rx.recv().await {
                Ok(event) if pred(&event) => return Some(event),
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
    .await
    .ok()
    .flatten()
}

async fn wait_relay<F>(rx: &mut broadcast::Receiver<RelayEvent>, pred: F) -> Option<RelayEvent>
where
    F: Fn(&RelayEvent) -> bool,
{
    tokio::time::timeout(WAIT, async {
        loop {
            match rx.recv().await {
                Ok(event) if pred(&event) => return Some(event),
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
    .await
    .ok()
    .flatten()
}

/// Test: Two participants connect and chat
/// Given alice and bob with the default settle delay
/// When both connect
/// Then alice initiates, both reach Connected, and a chat line arrives
#[tokio::test]
async fn test_alice_and_bob_connect_and_chat() {
    let lobby = Lobby::new();
    let (alice, alice_host) =
        lobby.participant("alice@uni.edu", LoopbackOptions::default(), SessionConfig::default());
    let (bob, bob_host) =
        lobby.participant("bob@uni.edu", LoopbackOptions::default(), SessionConfig::default());
    let mut alice_events = alice.subscribe();
    let mut bob_events = bob.subscribe();

    alice.connect().await.unwrap();
    assert_eq!(alice.state(), ConnectionState::Searching);
    assert_eq!(alice.waiting_count().await.unwrap(), 1);
    bob.connect().await.unwrap();

    match wait_event(&mut alice_events, |e| matches!(e, SessionEvent::Matched { .. })).await {
        Some(SessionEvent::Matched { peer, role, .. }) => {
            assert_eq!(peer, id("bob@uni.edu"));
            assert_eq!(role, Role::Initiator);
        }
        other => panic!("Expected match, got {:?}", other),
    }

    assert!(alice.wait_for(ConnectionState::Connected, WAIT).await);
    assert!(bob.wait_for(ConnectionState::Connected, WAIT).await);

    assert_eq!(LoopbackStats::get(&alice_host.stats().offers_created), 1);
    assert_eq!(LoopbackStats::get(&bob_host.stats().offers_created), 0);
    assert_eq!(LoopbackStats::get(&bob_host.stats().answers_created), 1);

    alice.send_message("hi bob").await.unwrap();
    match wait_event(&mut bob_events, |e| matches!(e, SessionEvent::Message { .. })).await {
        Some(SessionEvent::Message { from, text }) => {
            assert_eq!(from, id("alice@uni.edu"));
            assert_eq!(text, "hi bob");
        }
        other => panic!("Expected message, got {:?}", other),
    }

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(LoopbackStats::get(&alice_host.stats().candidates_rejected), 0);
    assert_eq!(LoopbackStats::get(&bob_host.stats().candidates_rejected), 0);
}

/// Test: Skip keeps media choices and finds a new partner
/// Given alice connected to bob with the video turned off
/// When alice skips and carol joins
/// Then bob's session ends, alice reconnects with carol, and the media is
/// re-acquired with video still off
#[tokio::test]
async fn test_skip_preserves_media_constraints() {
    let lobby = Lobby::new();
    let (alice, alice_host) =
        lobby.participant("alice@uni.edu", LoopbackOptions::default(), fast_config());
    let (bob, _bob_host) =
        lobby.participant("bob@uni.edu", LoopbackOptions::default(), fast_config());
    let (carol, _carol_host) =
        lobby.participant("carol@uni.edu", LoopbackOptions::default(), fast_config());

    alice.connect().await.unwrap();
    bob.connect().await.unwrap();
    assert!(alice.wait_for(ConnectionState::Connected, WAIT).await);

    alice.toggle_video(false);
    assert!(!alice_host.video_enabled());
    assert!(alice_host.audio_enabled());

    alice.skip().await.unwrap();
    assert!(bob.wait_for(ConnectionState::Ended, WAIT).await);
    assert_eq!(alice.state(), ConnectionState::Searching);
    assert_eq!(
        alice_host.stats().last_constraints(),
        Some(MediaConstraints {
            video: false,
            audio: true
        })
    );

    carol.connect().await.unwrap();
    assert!(alice.wait_for(ConnectionState::Connected, WAIT).await);
    assert!(carol.wait_for(ConnectionState::Connected, WAIT).await);
    assert!(!alice_host.video_enabled());
    assert!(!alice.constraints().video);

    let room = lobby.queue.active_room_of(&id("alice@uni.edu")).unwrap();
    assert!(room.has_member(&id("carol@uni.edu")));
    assert_eq!(bob.state(), ConnectionState::Ended);
}

/// Test: Disconnect during negotiation
/// Given alice (initiator, long settle delay) and bob both negotiating
/// When alice disconnects before sending the offer
/// Then bob ends, the room is inactive, alice's pending offer never
/// happens, and a stray answer for the old room is ignored
#[tokio::test]
async fn test_disconnect_mid_negotiation() {
    let lobby = Lobby::new();
    let slow = SessionConfig {
        settle_delay_ms: 300,
        ..Default::default()
    };
    let (alice, alice_host) = lobby.participant("alice@uni.edu", LoopbackOptions::default(), slow);
    let (bob, bob_host) =
        lobby.participant("bob@uni.edu", LoopbackOptions::default(), fast_config());
    let mut bob_events = bob.subscribe();

    alice.connect().await.unwrap();
    bob.connect().await.unwrap();
    assert!(alice.wait_for(ConnectionState::Negotiating, WAIT).await);
    assert!(bob.wait_for(ConnectionState::Negotiating, WAIT).await);

    let room = lobby.queue.active_room_of(&id("bob@uni.edu")).unwrap();

    alice.disconnect().await.unwrap();
    assert_eq!(alice.state(), ConnectionState::Idle);
    assert!(!alice_host.has_media());

    assert!(bob.wait_for(ConnectionState::Ended, WAIT).await);
    assert!(wait_event(&mut bob_events, |e| matches!(e, SessionEvent::Ended { .. }))
        .await
        .is_some());
    assert!(!lobby.queue.room(&room.code).unwrap().active);

    // A late answer addressed to bob in the old room
    lobby
        .hub
        .publish(SignalingEnvelope::new(
            room.code.clone(),
            id("alice@uni.edu"),
            id("bob@uni.edu"),
            SignalKind::Answer,
            serde_json::json!({ "type": "answer", "sdp": "v=0" }),
        ))
        .await
        .unwrap();

    // Outlive the settle delay
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(LoopbackStats::get(&alice_host.stats().offers_created), 0);
    assert_eq!(bob.state(), ConnectionState::Ended);
    assert_eq!(LoopbackStats::get(&bob_host.stats().answers_created), 0);
}

/// Test: A candidate that overtakes the answer is still applied
/// Given alice as initiator and a hand-driven bob
/// When bob sends a candidate before the answer
/// Then alice buffers it and applies it once the answer is set
#[tokio::test]
async fn test_early_candidate_applied_after_answer() {
    let lobby = Lobby::new();
    let (alice, alice_host) =
        lobby.participant("alice@uni.edu", LoopbackOptions::default(), fast_config());
    let bob = id("bob@uni.edu");
    let bob_host = LoopbackHost::new(lobby.network.clone(), LoopbackOptions::default());

    let mut queue_events = lobby.queue.subscribe();
    alice.connect().await.unwrap();
    lobby.queue.enqueue(&bob);

    let room_code = match queue_events.recv().await.unwrap() {
        QueueEvent::Matched {
            room_code,
            initiator,
            ..
        } => {
            assert_eq!(initiator, id("alice@uni.edu"));
            room_code
        }
        other => panic!("Expected match, got {:?}", other),
    };

    let mut relay = SignalingRelay::new(lobby.hub.clone());
    let mut relay_events = relay.subscribe();
    relay
        .open(room_code, bob.clone(), id("alice@uni.edu"))
        .await
        .unwrap();

    let offer = match wait_relay(&mut relay_events, |e| {
        matches!(e, RelayEvent::Signal(envelope) if envelope.kind == SignalKind::Offer)
    })
    .await
    {
        Some(RelayEvent::Signal(envelope)) => {
            serde_json::from_value::<SessionDescription>(envelope.payload).unwrap()
        }
        other => panic!("Expected offer, got {:?}", other),
    };

    let candidate = IceCandidate {
        candidate: "candidate:9 1 udp 2122260223 127.0.0.1 50000 typ host".to_string(),
        sdp_mid: Some("0".to_string()),
        sdp_m_line_index: Some(0),
    };
    relay
        .send(SignalKind::Candidate, serde_json::to_value(&candidate).unwrap())
        .await
        .unwrap();

    // Let the candidate reach alice before the answer exists
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(LoopbackStats::get(&alice_host.stats().candidates_applied), 0);

    let bob_peer = bob_host.new_peer().await.unwrap();
    let answer = bob_peer.create_answer(offer).await.unwrap();
    relay
        .send(SignalKind::Answer, serde_json::to_value(&answer).unwrap())
        .await
        .unwrap();

    assert!(alice.wait_for(ConnectionState::Connected, WAIT).await);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(LoopbackStats::get(&alice_host.stats().candidates_applied), 1);
    assert_eq!(LoopbackStats::get(&alice_host.stats().candidates_rejected), 0);
}

/// Test: Denied media blocks joining
/// Given a host that refuses camera and microphone access
/// When alice connects
/// Then the join fails, alice stays idle, and nobody is waiting
#[tokio::test]
async fn test_media_denied_blocks_join() {
    let lobby = Lobby::new();
    let options = LoopbackOptions {
        deny_media: true,
        ..Default::default()
    };
    let (alice, _host) = lobby.participant("alice@uni.edu", options, fast_config());

    let result = alice.connect().await;
    assert!(matches!(result, Err(SessionError::CapabilityUnavailable(_))));
    assert_eq!(alice.state(), ConnectionState::Idle);
    assert_eq!(lobby.queue.waiting_count(), 0);
}

/// Test: Negotiation failure
/// Given alice whose host rejects offer creation
/// When alice is matched with bob
/// Then alice fails, bob's room ends, and a skip puts alice back in the queue
#[tokio::test]
async fn test_negotiation_rejected_fails() {
    let lobby = Lobby::new();
    let options = LoopbackOptions {
        reject_negotiation: true,
        ..Default::default()
    };
    let (alice, _alice_host) = lobby.participant("alice@uni.edu", options, fast_config());
    let (bob, _bob_host) =
        lobby.participant("bob@uni.edu", LoopbackOptions::default(), fast_config());
    let mut alice_events = alice.subscribe();

    alice.connect().await.unwrap();
    bob.connect().await.unwrap();

    assert!(alice.wait_for(ConnectionState::Failed, WAIT).await);
    assert!(wait_event(&mut alice_events, |e| matches!(e, SessionEvent::Failed { .. }))
        .await
        .is_some());
    assert!(bob.wait_for(ConnectionState::Ended, WAIT).await);
    assert!(lobby.queue.active_rooms().is_empty());

    alice.skip().await.unwrap();
    assert_eq!(alice.state(), ConnectionState::Searching);
    assert!(lobby.queue.is_waiting(&id("alice@uni.edu")));
}

/// Test: Chat requires a connection
/// Given alice searching
/// When alice sends a message
/// Then it is refused with NotConnected
#[tokio::test]
async fn test_send_message_requires_connection() {
    let lobby = Lobby::new();
    let (alice, _host) =
        lobby.participant("alice@uni.edu", LoopbackOptions::default(), fast_config());

    assert!(matches!(
        alice.send_message("anyone?").await,
        Err(SessionError::NotConnected)
    ));

    alice.connect().await.unwrap();
    assert!(matches!(
        alice.send_message("anyone?").await,
        Err(SessionError::NotConnected)
    ));
}

/// Test: Disconnect while searching
/// Given alice waiting in the queue
/// When alice disconnects twice
/// Then alice leaves the pool, releases media and stays idle
#[tokio::test]
async fn test_disconnect_while_searching_is_idempotent() {
    let lobby = Lobby::new();
    let (alice, host) =
        lobby.participant("alice@uni.edu", LoopbackOptions::default(), fast_config());

    alice.connect().await.unwrap();
    assert!(host.has_media());
    assert_eq!(lobby.queue.waiting_count(), 1);

    tokio_test::assert_ok!(alice.disconnect().await);
    tokio_test::assert_ok!(alice.disconnect().await);

    assert_eq!(alice.state(), ConnectionState::Idle);
    assert_eq!(lobby.queue.waiting_count(), 0);
    assert!(!host.has_media());
}

/// Test: Skip racing a match that is already queued
/// Given alice searching, and bob matched with alice before alice's task runs
/// When alice skips right away
/// Then alice ends up searching with no room, and the next partner's room
/// survives alice picking it up
#[tokio::test]
async fn test_skip_discards_buffered_match() {
    for _ in 0..20 {
        let lobby = Lobby::new();
        let (alice, alice_host) =
            lobby.participant("alice@uni.edu", LoopbackOptions::default(), fast_config());
        let alice_id = id("alice@uni.edu");

        alice.connect().await.unwrap();
        lobby.queue.enqueue(&id("bob@uni.edu"));
        let abandoned = lobby.queue.active_room_of(&alice_id).unwrap();
        alice.skip().await.unwrap();

        // Let the buffered match and room-ended events drain
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(alice.state(), ConnectionState::Searching);
        assert!(lobby.queue.is_waiting(&alice_id));
        assert!(lobby.queue.active_room_of(&alice_id).is_none());
        assert!(!lobby.queue.room(&abandoned.code).unwrap().active);

        let peers_before = LoopbackStats::get(&alice_host.stats().peers_created);
        lobby.queue.enqueue(&id("carol@uni.edu"));
        let room = lobby.queue.active_room_of(&id("carol@uni.edu")).unwrap();
        assert!(room.has_member(&alice_id));

        assert!(alice.wait_for(ConnectionState::AwaitingReadiness, WAIT).await);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(lobby.queue.room(&room.code).unwrap().active);
        assert_eq!(
            LoopbackStats::get(&alice_host.stats().peers_created),
            peers_before + 1
        );
    }
}

/// Test: Leftovers from an abandoned room do not touch the new session
/// Given alice skipped bob and is now connected with carol
/// When a late match notice and a late answer for the bob room arrive
/// Then alice stays connected with carol, the carol room stays active, and
/// no peer or offer is created
#[tokio::test]
async fn test_stale_room_leftovers_ignored() {
    let lobby = Lobby::new();
    let matchmaker = ReplayingMatchmaker::new(lobby.queue.clone());
    let (alice, alice_host) = lobby.participant_with(
        "alice@uni.edu",
        matchmaker.clone(),
        LoopbackOptions::default(),
        fast_config(),
    );
    let (bob, _bob_host) =
        lobby.participant("bob@uni.edu", LoopbackOptions::default(), fast_config());
    let (carol, _carol_host) =
        lobby.participant("carol@uni.edu", LoopbackOptions::default(), fast_config());
    let alice_id = id("alice@uni.edu");
    let bob_id = id("bob@uni.edu");

    alice.connect().await.unwrap();
    bob.connect().await.unwrap();
    assert!(alice.wait_for(ConnectionState::Connected, WAIT).await);
    let old_room = lobby.queue.active_room_of(&alice_id).unwrap();

    alice.skip().await.unwrap();
    assert!(bob.wait_for(ConnectionState::Ended, WAIT).await);
    carol.connect().await.unwrap();
    assert!(alice.wait_for(ConnectionState::Connected, WAIT).await);
    assert!(carol.wait_for(ConnectionState::Connected, WAIT).await);
    let new_room = lobby.queue.active_room_of(&alice_id).unwrap();

    let stats = alice_host.stats();
    let offers = LoopbackStats::get(&stats.offers_created);
    let peers = LoopbackStats::get(&stats.peers_created);
    let applied = LoopbackStats::get(&stats.candidates_applied);

    matchmaker.replay(QueueEvent::Matched {
        room_code: old_room.code.clone(),
        members: [alice_id.clone(), bob_id.clone()],
        initiator: alice_id.clone(),
    });
    lobby
        .hub
        .publish(SignalingEnvelope::new(
            old_room.code.clone(),
            bob_id.clone(),
            alice_id.clone(),
            SignalKind::Answer,
            serde_json::json!({ "type": "answer", "sdp": "v=0" }),
        ))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(alice.state(), ConnectionState::Connected);
    assert_eq!(carol.state(), ConnectionState::Connected);
    assert!(lobby.queue.room(&new_room.code).unwrap().active);
    assert_eq!(LoopbackStats::get(&stats.offers_created), offers);
    assert_eq!(LoopbackStats::get(&stats.peers_created), peers);
    assert_eq!(LoopbackStats::get(&stats.candidates_applied), applied);
}
