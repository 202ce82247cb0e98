//! Connection orchestrator
//!
//! One task per local participant. It reacts to queue events, relay events,
//! capability host events and application commands one at a time, owns the
//! [`ConnectionState`] and is the only caller of the capability host.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use super::candidates::PendingCandidates;
use super::capability::{
    CapabilityHost, HostEvent, IceCandidate, MediaConstraints, PeerConnectionState, PeerSession,
    SessionDescription,
};
use super::error::SessionError;
use super::guard::{SessionGuard, SessionToken};
use super::state::ConnectionState;
use crate::config::SessionConfig;
use crate::identity::{Identity, Role};
use crate::matching::{MatchNotice, Matchmaker, QueueEvent, RoomCode};
use crate::signaling::{RelayEvent, SignalKind, SignalTransport, SignalingEnvelope, SignalingRelay};

/// Capacity of the command channel
const COMMAND_CAPACITY: usize = 32;

/// Events published to the surrounding application
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Searching,
    Matched {
        room_code: RoomCode,
        peer: Identity,
        role: Role,
    },
    Connected {
        room_code: RoomCode,
    },
    RemoteStream {
        stream_id: String,
    },
    /// Text received on the data channel
    Message {
        from: Identity,
        text: String,
    },
    /// The counterpart ended the room
    PeerLeft {
        room_code: RoomCode,
    },
    Ended {
        room_code: RoomCode,
    },
    /// Negotiation or transport failure; the user may skip to retry
    Failed {
        reason: String,
    },
}

type Reply = oneshot::Sender<Result<(), SessionError>>;

enum Command {
    Connect { reply: Reply },
    Skip { reply: Reply },
    Disconnect { reply: Reply },
    SendMessage { text: String, reply: Reply },
}

enum Internal {
    /// Settle delay elapsed; the initiator may create its offer
    StartOffer { token: SessionToken },
}

/// Everything that exists only for the lifetime of one room
struct RoomSession {
    token: SessionToken,
    room_code: RoomCode,
    peer: Identity,
    role: Role,
    relay: SignalingRelay,
    connection: Arc<dyn PeerSession>,
    candidates: PendingCandidates,
    offer_sent: bool,
}

/// Application-facing handle to a participant session.
///
/// Dropping every handle stops the session task, which ends any room it holds.
#[derive(Clone)]
pub struct SessionHandle {
    identity: Identity,
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<ConnectionState>,
    events: broadcast::Sender<SessionEvent>,
    guard: SessionGuard,
    host: Arc<dyn CapabilityHost>,
    constraints: Arc<Mutex<MediaConstraints>>,
    matchmaker: Arc<dyn Matchmaker>,
}

impl SessionHandle {
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Acquire local media and join the queue
    pub async fn connect(&self) -> Result<(), SessionError> {
        self.request(|reply| Command::Connect { reply }).await
    }

    /// End the current room and search again with the same media constraints
    pub async fn skip(&self) -> Result<(), SessionError> {
        self.guard.invalidate();
        self.request(|reply| Command::Skip { reply }).await
    }

    /// End the current room (or leave the queue) and return to idle
    pub async fn disconnect(&self) -> Result<(), SessionError> {
        self.guard.invalidate();
        self.request(|reply| Command::Disconnect { reply }).await
    }

    /// Send text over the data channel; only valid while connected
    pub async fn send_message(&self, text: impl Into<String>) -> Result<(), SessionError> {
        let text = text.into();
        self.request(|reply| Command::SendMessage { text, reply })
            .await
    }

    /// Enable or disable local video; remembered for later rooms
    pub fn toggle_video(&self, enabled: bool) {
        self.constraints.lock().video = enabled;
        self.host.toggle_video(enabled);
    }

    /// Enable or disable local audio; remembered for later rooms
    pub fn toggle_audio(&self, enabled: bool) {
        self.constraints.lock().audio = enabled;
        self.host.toggle_audio(enabled);
    }

    pub fn constraints(&self) -> MediaConstraints {
        *self.constraints.lock()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Advisory number of participants waiting for a partner
    pub async fn waiting_count(&self) -> Result<usize, SessionError> {
        Ok(self.matchmaker.count_waiting().await?)
    }

    /// Wait until the state equals `target`; false on timeout or shutdown
    pub async fn wait_for(&self, target: ConnectionState, timeout: Duration) -> bool {
        let mut rx = self.state.clone();
        let reached = tokio::time::timeout(timeout, rx.wait_for(|state| *state == target)).await;
        matches!(reached, Ok(Ok(_)))
    }

    async fn request<F>(&self, make: F) -> Result<(), SessionError>
    where
        F: FnOnce(Reply) -> Command,
    {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| SessionError::Stopped)?;
        rx.await.map_err(|_| SessionError::Stopped)?
    }
}

/// Per-participant state machine driving queue, relay and capability host
pub struct Orchestrator {
    identity: Identity,
    matchmaker: Arc<dyn Matchmaker>,
    transport: Arc<dyn SignalTransport>,
    host: Arc<dyn CapabilityHost>,
    config: SessionConfig,
    constraints: Arc<Mutex<MediaConstraints>>,
    guard: SessionGuard,
    state: watch::Sender<ConnectionState>,
    events: broadcast::Sender<SessionEvent>,
    commands: mpsc::Receiver<Command>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    internal_rx: mpsc::UnboundedReceiver<Internal>,
    lobby_rx: Option<broadcast::Receiver<QueueEvent>>,
    relay_rx: Option<broadcast::Receiver<RelayEvent>>,
    host_rx: Option<broadcast::Receiver<HostEvent>>,
    session: Option<RoomSession>,
    /// Rooms this session ended whose `RoomEnded` has not been seen yet
    ended_rooms: HashSet<RoomCode>,
}

impl Orchestrator {
    /// Start a session task for `identity` and return its handle
    pub fn spawn(
        identity: Identity,
        matchmaker: Arc<dyn Matchmaker>,
        transport: Arc<dyn SignalTransport>,
        host: Arc<dyn CapabilityHost>,
        config: SessionConfig,
    ) -> SessionHandle {
        let (command_tx, commands) = mpsc::channel(COMMAND_CAPACITY);
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (state, state_rx) = watch::channel(ConnectionState::Idle);
        let (events, _) = broadcast::channel(config.event_buffer.max(1));
        let constraints = Arc::new(Mutex::new(config.initial_constraints()));
        let guard = SessionGuard::default();

        let orchestrator = Self {
            identity: identity.clone(),
            lobby_rx: Some(matchmaker.events()),
            matchmaker: matchmaker.clone(),
            transport,
            host: host.clone(),
            config,
            constraints: constraints.clone(),
            guard: guard.clone(),
            state,
            events: events.clone(),
            commands,
            internal_tx,
            internal_rx,
            relay_rx: None,
            host_rx: None,
            session: None,
            ended_rooms: HashSet::new(),
        };

        tokio::spawn(orchestrator.run());

        SessionHandle {
            identity,
            commands: command_tx,
            state: state_rx,
            events,
            guard,
            host,
            constraints,
            matchmaker,
        }
    }

    async fn run(mut self) {
        info!("Session for {} started", self.identity);

        loop {
            tokio::select! {
                cmd = self.commands.recv() => {
                    match cmd {
                        Some(cmd) => self.handle_command(cmd).await,
                        None => break,
                    }
                }

                event = next_event(&mut self.lobby_rx, "queue") => {
                    match event {
                        Some(event) => self.handle_queue_event(event).await,
                        None => {
                            warn!("Queue event stream for {} closed", self.identity);
                            self.lobby_rx = None;
                        }
                    }
                }

                event = next_event(&mut self.relay_rx, "relay") => {
                    match event {
                        Some(event) => self.handle_relay_event(event).await,
                        None => self.relay_rx = None,
                    }
                }

                event = next_event(&mut self.host_rx, "host") => {
                    match event {
                        Some(event) => self.handle_host_event(event).await,
                        None => self.host_rx = None,
                    }
                }

                Some(internal) = self.internal_rx.recv() => {
                    match internal {
                        Internal::StartOffer { token } => self.start_offer(token).await,
                    }
                }
            }
        }

        // All handles dropped
        self.guard.invalidate();
        self.leave_matchmaking().await;
        self.teardown().await;
        self.host.release_media().await;
        self.set_state(ConnectionState::Idle);
        info!("Session for {} stopped", self.identity);
    }

    fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn set_state(&self, next: ConnectionState) {
        let prev = self.state();
        if prev != next {
            debug!("{}: {} -> {}", self.identity, prev, next);
            self.state.send_replace(next);
        }
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Connect { reply } => {
                let result = if self.state().can_connect() {
                    self.enter_queue().await
                } else {
                    debug!("{} already {}", self.identity, self.state());
                    Ok(())
                };
                let _ = reply.send(result);
            }

            Command::Skip { reply } => {
                info!("{} skipping", self.identity);
                self.guard.invalidate();
                let room_code = self.session.as_ref().map(|s| s.room_code.clone());

                self.leave_matchmaking().await;
                self.teardown().await;
                if let Some(room_code) = room_code {
                    self.emit(SessionEvent::Ended { room_code });
                }

                let result = self.enter_queue().await;
                let _ = reply.send(result);
            }

            Command::Disconnect { reply } => {
                info!("{} disconnecting", self.identity);
                self.guard.invalidate();
                let room_code = self.session.as_ref().map(|s| s.room_code.clone());

                self.leave_matchmaking().await;
                self.teardown().await;
                self.host.release_media().await;
                if let Some(room_code) = room_code {
                    self.emit(SessionEvent::Ended { room_code });
                }

                self.set_state(ConnectionState::Idle);
                let _ = reply.send(Ok(()));
            }

            Command::SendMessage { text, reply } => {
                let result = match self.session.as_ref() {
                    Some(session) if self.state().can_send_data() => session
                        .connection
                        .send_data(&text)
                        .await
                        .map_err(|e| SessionError::NegotiationFailed(e.to_string())),
                    _ => Err(SessionError::NotConnected),
                };
                let _ = reply.send(result);
            }
        }
    }

    /// Acquire media with the remembered constraints, then join the queue
    async fn enter_queue(&mut self) -> Result<(), SessionError> {
        let constraints = *self.constraints.lock();

        if let Err(e) = self.host.local_media(constraints).await {
            warn!("Local media unavailable for {}: {}", self.identity, e);
            self.set_state(ConnectionState::Idle);
            return Err(SessionError::CapabilityUnavailable(e.to_string()));
        }

        // Searching before the join so an immediate match finds us ready for it
        self.set_state(ConnectionState::Searching);

        match self.matchmaker.join(&self.identity).await {
            Ok(entry) => {
                debug!("{} waiting as entry {}", self.identity, entry);
                self.emit(SessionEvent::Searching);
                Ok(())
            }
            Err(e) => {
                warn!("{} could not join the queue: {}", self.identity, e);
                self.set_state(ConnectionState::Idle);
                Err(SessionError::Join(e))
            }
        }
    }

    /// End our room (if any) and leave the pool; failures are logged only.
    ///
    /// The ended room is remembered so a match notice for it that is still
    /// buffered is not mistaken for a new match.
    async fn leave_matchmaking(&mut self) {
        match self.matchmaker.end_room(&self.identity).await {
            Ok(Some(room_code)) => {
                debug!(
                    "{} ended room {}",
                    self.identity,
                    room_code.display_suffix()
                );
                self.ended_rooms.insert(room_code);
            }
            Ok(None) => {}
            Err(e) => warn!("Failed to end room for {}: {}", self.identity, e),
        }
    }

    async fn handle_queue_event(&mut self, event: QueueEvent) {
        if !event.involves(&self.identity) {
            return;
        }

        match &event {
            QueueEvent::Matched { room_code, .. } => {
                if self.ended_rooms.contains(room_code) {
                    debug!(
                        "{} ignoring match for abandoned room {}",
                        self.identity,
                        room_code.display_suffix()
                    );
                    return;
                }
                let Some(notice) = event.match_notice_for(&self.identity) else {
                    return;
                };

                if self.state() != ConnectionState::Searching {
                    warn!(
                        "{} matched in {} while {}, ending it",
                        self.identity,
                        room_code.display_suffix(),
                        self.state()
                    );
                    // Only the named room; the current one stays untouched
                    if let Err(e) = self.matchmaker.close_room(&self.identity, room_code).await {
                        warn!("Failed to end room for {}: {}", self.identity, e);
                    }
                    return;
                }

                self.begin_room(notice).await;
            }

            QueueEvent::RoomEnded {
                room_code,
                ended_by,
                ..
            } => {
                self.ended_rooms.remove(room_code);

                let is_current = self
                    .session
                    .as_ref()
                    .is_some_and(|session| &session.room_code == room_code);
                if !is_current || ended_by == &self.identity {
                    return;
                }

                info!(
                    "{} left room {}, ending session for {}",
                    ended_by,
                    room_code.display_suffix(),
                    self.identity
                );
                self.guard.invalidate();
                self.teardown().await;
                self.set_state(ConnectionState::Ended);
                self.emit(SessionEvent::PeerLeft {
                    room_code: room_code.clone(),
                });
                self.emit(SessionEvent::Ended {
                    room_code: room_code.clone(),
                });
            }
        }
    }

    async fn begin_room(&mut self, notice: MatchNotice) {
        info!(
            "{} matched with {} in {} as {}",
            self.identity,
            notice.peer,
            notice.room_code.display_suffix(),
            notice.role
        );

        self.set_state(ConnectionState::Matched);
        self.emit(SessionEvent::Matched {
            room_code: notice.room_code.clone(),
            peer: notice.peer.clone(),
            role: notice.role,
        });

        let token = self.guard.token();

        let connection = match self.host.new_peer().await {
            Ok(connection) => connection,
            Err(e) => {
                self.fail(SessionError::CapabilityUnavailable(e.to_string()))
                    .await;
                return;
            }
        };

        let mut relay = SignalingRelay::new(self.transport.clone());
        self.relay_rx = Some(relay.subscribe());
        self.host_rx = Some(connection.subscribe());

        let opened = relay
            .open(
                notice.room_code.clone(),
                self.identity.clone(),
                notice.peer.clone(),
            )
            .await;

        self.session = Some(RoomSession {
            token: token.clone(),
            room_code: notice.room_code,
            peer: notice.peer,
            role: notice.role,
            relay,
            connection,
            candidates: PendingCandidates::new(),
            offer_sent: false,
        });

        if !token.is_current() {
            debug!("Room setup for {} superseded", self.identity);
            return;
        }

        match opened {
            Ok(()) => self.set_state(ConnectionState::AwaitingReadiness),
            Err(e) => self.fail(SessionError::Signaling(e)).await,
        }
    }

    /// Session for an event from `room_code`, if it is still current
    fn current_session(&self, room_code: &RoomCode) -> Option<&RoomSession> {
        self.session
            .as_ref()
            .filter(|session| &session.room_code == room_code && session.token.is_current())
    }

    async fn handle_relay_event(&mut self, event: RelayEvent) {
        match event {
            RelayEvent::Ready { room_code } => {
                let Some(session) = self.current_session(&room_code) else {
                    return;
                };
                if self.state() != ConnectionState::AwaitingReadiness {
                    return;
                }

                let role = session.role;
                let token = session.token.clone();
                self.set_state(ConnectionState::Negotiating);

                if !role.is_initiator() {
                    debug!("{} waiting for offer", self.identity);
                    return;
                }

                let delay = self.config.settle_delay();
                if delay.is_zero() {
                    self.start_offer(token).await;
                } else {
                    let internal = self.internal_tx.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        let _ = internal.send(Internal::StartOffer { token });
                    });
                }
            }

            RelayEvent::Signal(envelope) => {
                if self.current_session(&envelope.room_code).is_none() {
                    debug!(
                        "Ignoring stale {} from {} for {}",
                        envelope.kind, envelope.sender, self.identity
                    );
                    return;
                }

                match envelope.kind {
                    SignalKind::Offer => self.handle_offer(envelope).await,
                    SignalKind::Answer => self.handle_answer(envelope).await,
                    SignalKind::Candidate => self.handle_remote_candidate(envelope).await,
                    SignalKind::Ready => {}
                }
            }
        }
    }

    async fn start_offer(&mut self, token: SessionToken) {
        if !token.is_current() || self.state() != ConnectionState::Negotiating {
            return;
        }
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if session.offer_sent || !session.role.is_initiator() {
            return;
        }
        session.offer_sent = true;
        let connection = session.connection.clone();

        // The data channel must exist before the offer so it is negotiated with it
        if let Err(e) = connection
            .open_data_channel(&self.config.data_channel_label)
            .await
        {
            self.fail(SessionError::NegotiationFailed(e.to_string()))
                .await;
            return;
        }

        let offer = match connection.create_offer().await {
            Ok(offer) => offer,
            Err(e) => {
                if token.is_current() {
                    self.fail(SessionError::NegotiationFailed(e.to_string()))
                        .await;
                }
                return;
            }
        };

        if !token.is_current() {
            return;
        }

        info!("{} sending offer", self.identity);
        self.send_signal(SignalKind::Offer, &offer).await;
    }

    async fn handle_offer(&mut self, envelope: SignalingEnvelope) {
        let state = self.state();
        let Some(session) = self.session.as_ref() else {
            return;
        };
        if session.role.is_initiator()
            || !matches!(
                state,
                ConnectionState::AwaitingReadiness | ConnectionState::Negotiating
            )
        {
            warn!(
                "{} ignoring offer from {} as {} while {}",
                self.identity, envelope.sender, session.role, state
            );
            return;
        }
        if session.candidates.has_remote_description() {
            debug!("{} ignoring duplicate offer", self.identity);
            return;
        }

        let offer: SessionDescription = match serde_json::from_value(envelope.payload) {
            Ok(offer) => offer,
            Err(e) => {
                warn!("Malformed offer from {}: {}", envelope.sender, e);
                return;
            }
        };

        let token = session.token.clone();
        let connection = session.connection.clone();
        self.set_state(ConnectionState::Negotiating);

        let answer = match connection.create_answer(offer).await {
            Ok(answer) => answer,
            Err(e) => {
                if token.is_current() {
                    self.fail(SessionError::NegotiationFailed(e.to_string()))
                        .await;
                }
                return;
            }
        };

        if !token.is_current() {
            return;
        }

        info!("{} sending answer", self.identity);
        self.send_signal(SignalKind::Answer, &answer).await;
        self.release_candidates(&token).await;
    }

    async fn handle_answer(&mut self, envelope: SignalingEnvelope) {
        let Some(session) = self.session.as_ref() else {
            return;
        };
        if !session.role.is_initiator() || !session.offer_sent {
            warn!(
                "{} ignoring unexpected answer from {}",
                self.identity, envelope.sender
            );
            return;
        }
        if session.candidates.has_remote_description() {
            debug!("{} ignoring duplicate answer", self.identity);
            return;
        }

        let answer: SessionDescription = match serde_json::from_value(envelope.payload) {
            Ok(answer) => answer,
            Err(e) => {
                warn!("Malformed answer from {}: {}", envelope.sender, e);
                return;
            }
        };

        let token = session.token.clone();
        let connection = session.connection.clone();

        if let Err(e) = connection.set_remote_answer(answer).await {
            if token.is_current() {
                self.fail(SessionError::NegotiationFailed(e.to_string()))
                    .await;
            }
            return;
        }

        if !token.is_current() {
            return;
        }

        debug!("{} applied answer", self.identity);
        self.release_candidates(&token).await;
    }

    async fn handle_remote_candidate(&mut self, envelope: SignalingEnvelope) {
        let candidate: IceCandidate = match serde_json::from_value(envelope.payload) {
            Ok(candidate) => candidate,
            Err(e) => {
                warn!("Malformed candidate from {}: {}", envelope.sender, e);
                return;
            }
        };

        let Some(session) = self.session.as_mut() else {
            return;
        };

        match session.candidates.accept(candidate) {
            Some(candidate) => {
                let connection = session.connection.clone();
                apply_candidate(connection.as_ref(), candidate).await;
            }
            None => debug!(
                "Candidate deferred until remote description ({} pending)",
                session.candidates.len()
            ),
        }
    }

    /// Mark the remote description as set and apply buffered candidates
    async fn release_candidates(&mut self, token: &SessionToken) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let pending = session.candidates.remote_description_set();
        let connection = session.connection.clone();

        if !pending.is_empty() {
            debug!("Applying {} deferred candidates", pending.len());
        }
        for candidate in pending {
            if !token.is_current() {
                return;
            }
            apply_candidate(connection.as_ref(), candidate).await;
        }
    }

    async fn send_signal<T: serde::Serialize>(&mut self, kind: SignalKind, body: &T) {
        let payload = match serde_json::to_value(body) {
            Ok(payload) => payload,
            Err(e) => {
                error!("Failed to encode {}: {}", kind, e);
                return;
            }
        };

        let result = match self.session.as_ref() {
            Some(session) => session.relay.send(kind, payload).await,
            None => return,
        };

        if let Err(e) = result {
            match kind {
                SignalKind::Candidate => warn!("Failed to send candidate: {}", e),
                _ => self.fail(SessionError::Signaling(e)).await,
            }
        }
    }

    async fn handle_host_event(&mut self, event: HostEvent) {
        let Some(session) = self.session.as_ref() else {
            return;
        };
        if !session.token.is_current() {
            return;
        }
        let room_code = session.room_code.clone();
        let peer = session.peer.clone();

        match event {
            HostEvent::LocalCandidate(candidate) => {
                self.send_signal(SignalKind::Candidate, &candidate).await;
            }

            HostEvent::RemoteStream { stream_id } => {
                debug!("{} received remote stream {}", self.identity, stream_id);
                self.emit(SessionEvent::RemoteStream { stream_id });
            }

            HostEvent::ConnectionState(state) => {
                debug!("{} peer connection {:?}", self.identity, state);
                match state {
                    PeerConnectionState::Connected => {
                        if self.state() == ConnectionState::Negotiating {
                            info!(
                                "{} connected with {} in {}",
                                self.identity,
                                peer,
                                room_code.display_suffix()
                            );
                            self.set_state(ConnectionState::Connected);
                            self.emit(SessionEvent::Connected { room_code });
                        }
                    }
                    PeerConnectionState::Failed => {
                        self.fail(SessionError::NegotiationFailed(
                            "peer connection failed".to_string(),
                        ))
                        .await;
                    }
                    PeerConnectionState::Disconnected | PeerConnectionState::Closed => {
                        info!("{} lost connection to {}", self.identity, peer);
                        self.guard.invalidate();
                        self.leave_matchmaking().await;
                        self.teardown().await;
                        self.set_state(ConnectionState::Ended);
                        self.emit(SessionEvent::Ended { room_code });
                    }
                    PeerConnectionState::New | PeerConnectionState::Connecting => {}
                }
            }

            HostEvent::DataChannelOpen => {
                debug!("Data channel open for {}", self.identity);
            }

            HostEvent::DataChannelMessage(text) => {
                if self.state().can_send_data() {
                    self.emit(SessionEvent::Message { from: peer, text });
                } else {
                    debug!("Dropping data channel message before connected");
                }
            }
        }
    }

    /// Move to Failed: end the room so the peer is released, then tear down
    async fn fail(&mut self, reason: SessionError) {
        error!("Session for {} failed: {}", self.identity, reason);
        self.guard.invalidate();
        self.leave_matchmaking().await;
        self.teardown().await;
        self.set_state(ConnectionState::Failed);
        self.emit(SessionEvent::Failed {
            reason: reason.to_string(),
        });
    }

    /// Drop the room session: relay subscriptions, peer connection, buffers
    async fn teardown(&mut self) {
        self.relay_rx = None;
        self.host_rx = None;

        if let Some(mut session) = self.session.take() {
            session.relay.dispose().await;
            session.connection.close().await;
            debug!(
                "Tore down room {} for {} ({} candidates discarded)",
                session.room_code.display_suffix(),
                self.identity,
                session.candidates.len()
            );
        }
    }
}

async fn apply_candidate(connection: &dyn PeerSession, candidate: IceCandidate) {
    if let Err(e) = connection.add_remote_candidate(candidate).await {
        warn!("Failed to add remote candidate: {}", e);
    }
}

/// Next item from an optional broadcast receiver; pending forever when absent
async fn next_event<T: Clone>(
    rx: &mut Option<broadcast::Receiver<T>>,
    source: &str,
) -> Option<T> {
    let Some(rx) = rx.as_mut() else {
        return std::future::pending().await;
    };

    loop {
        match rx.recv().await {
            Ok(event) => return Some(event),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("{} events lagged, {} skipped", source, skipped);
            }
            Err(broadcast::error::RecvError::Closed) => return None,
        }
    }
}
