//! Lobby server
//!
//! Exposes a [`MatchingQueue`] and a [`SignalingHub`] over WebSocket. Each
//! connection is bound to one identity by its first `Join`; queue events and
//! envelopes are only forwarded when they concern that identity.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use super::error::NetworkError;
use super::protocol::{ClientMessage, ServerMessage};
use crate::identity::Identity;
use crate::matching::{MatchingQueue, QueueEvent, RoomCode};
use crate::signaling::{SignalingEnvelope, SignalingHub};

/// Shared state behind every lobby connection
#[derive(Clone)]
pub struct LobbyServer {
    queue: Arc<MatchingQueue>,
    hub: Arc<SignalingHub>,
}

impl LobbyServer {
    pub fn new() -> Self {
        Self {
            queue: Arc::new(MatchingQueue::new()),
            hub: Arc::new(SignalingHub::new()),
        }
    }

    pub fn queue(&self) -> &Arc<MatchingQueue> {
        &self.queue
    }

    pub fn hub(&self) -> &Arc<SignalingHub> {
        &self.hub
    }

    /// Bind `addr` and serve until the listener fails
    pub async fn run(&self, addr: SocketAddr, tls: Option<TlsAcceptor>) -> Result<(), NetworkError> {
        let listener = TcpListener::bind(addr).await?;
        self.serve(listener, tls).await
    }

    /// Serve connections from an already bound listener
    pub async fn serve(
        &self,
        listener: TcpListener,
        tls: Option<TlsAcceptor>,
    ) -> Result<(), NetworkError> {
        let addr = listener.local_addr()?;
        info!(
            "Lobby server listening on {} ({})",
            addr,
            if tls.is_some() { "wss" } else { "ws" }
        );

        tokio::spawn(close_ended_rooms(self.queue.subscribe(), self.hub.clone()));

        loop {
            match listener.accept().await {
                Ok((stream, peer_addr)) => {
                    debug!("New lobby connection from {}", peer_addr);
                    let server = self.clone();
                    let tls = tls.clone();

                    tokio::spawn(async move {
                        let result = match tls {
                            Some(acceptor) => match acceptor.accept(stream).await {
                                Ok(stream) => server.accept(stream, peer_addr).await,
                                Err(e) => {
                                    warn!("TLS handshake failed for {}: {}", peer_addr, e);
                                    return;
                                }
                            },
                            None => server.accept(stream, peer_addr).await,
                        };

                        if let Err(e) = result {
                            warn!("Connection error for {}: {}", peer_addr, e);
                        }
                    });
                }
                Err(e) => {
                    error!("Accept error: {}", e);
                }
            }
        }
    }

    async fn accept<S>(&self, stream: S, peer_addr: SocketAddr) -> Result<(), NetworkError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        debug!("WebSocket connection established with {}", peer_addr);
        self.serve_connection(ws_stream).await
    }

    async fn serve_connection<S>(
        &self,
        ws_stream: tokio_tungstenite::WebSocketStream<S>,
    ) -> Result<(), NetworkError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (mut write, mut read) = ws_stream.split();
        let mut conn = Connection {
            identity: None,
            signals: None,
        };
        let mut queue_rx = self.queue.subscribe();

        let result: Result<(), NetworkError> = async {
            loop {
                tokio::select! {
                    msg = read.next() => {
                        match msg {
                            Some(Ok(Message::Text(text))) => {
                                let reply = match serde_json::from_str::<ClientMessage>(&text) {
                                    Ok(msg) => self.process_message(msg, &mut conn),
                                    Err(e) => {
                                        warn!("Invalid message: {}", e);
                                        ServerMessage::error(format!("invalid message: {}", e))
                                    }
                                };
                                write.send(Message::Text(serde_json::to_string(&reply)?)).await?;
                            }
                            Some(Ok(Message::Close(_))) | None => break,
                            Some(Err(e)) => {
                                warn!("WebSocket error: {}", e);
                                break;
                            }
                            _ => {}
                        }
                    }

                    event = queue_rx.recv() => {
                        match event {
                            Ok(event) => {
                                let Some(identity) = conn.identity.as_ref() else {
                                    continue;
                                };
                                if !event.involves(identity) {
                                    continue;
                                }
                                let push = ServerMessage::Queue { event };
                                write.send(Message::Text(serde_json::to_string(&push)?)).await?;
                            }
                            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                                warn!("Queue events lagged, {} skipped", skipped);
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                        }
                    }

                    envelope = next_signal(&mut conn.signals) => {
                        let Some(envelope) = envelope else {
                            conn.signals = None;
                            continue;
                        };
                        if conn.identity.as_ref() != Some(&envelope.recipient) {
                            continue;
                        }
                        let push = ServerMessage::Signal { envelope };
                        write.send(Message::Text(serde_json::to_string(&push)?)).await?;
                    }
                }
            }
            Ok(())
        }
        .await;

        // A dropped connection ends its room and leaves the pool
        if let Some(identity) = conn.identity.take() {
            if let Some(room_code) = self.queue.end_room_of(&identity) {
                info!(
                    "{} disconnected, room {} ended",
                    identity,
                    room_code.display_suffix()
                );
            } else {
                debug!("{} disconnected", identity);
            }
        }

        result
    }

    fn process_message(&self, msg: ClientMessage, conn: &mut Connection) -> ServerMessage {
        match msg {
            ClientMessage::Join { identity } => {
                if let Some(bound) = conn.identity.as_ref() {
                    if bound != &identity {
                        return ServerMessage::error(format!(
                            "connection already bound to {}",
                            bound
                        ));
                    }
                }
                conn.identity = Some(identity.clone());
                let entry_id = self.queue.enqueue(&identity);
                ServerMessage::Joined { entry_id }
            }

            ClientMessage::Leave => {
                if let Some(identity) = conn.identity.as_ref() {
                    self.queue.remove(identity);
                }
                ServerMessage::Ack
            }

            ClientMessage::EndRoom { room_code } => {
                let Some(identity) = conn.identity.as_ref() else {
                    return ServerMessage::Closed { room_code: None };
                };
                let ended = match room_code {
                    Some(code) => self.queue.end_room_code(identity, &code).then_some(code),
                    None => self.queue.end_room_of(identity),
                };
                ServerMessage::Closed { room_code: ended }
            }

            ClientMessage::CountWaiting => ServerMessage::WaitingCount {
                count: self.queue.waiting_count(),
            },

            ClientMessage::Subscribe { room_code } => {
                let Some(identity) = conn.identity.as_ref() else {
                    return ServerMessage::error("join before subscribing");
                };
                if !self.is_member(&room_code, identity) {
                    warn!(
                        "{} tried to subscribe to room {}",
                        identity,
                        room_code.display_suffix()
                    );
                    return ServerMessage::error("not a member of this room");
                }

                let rx = self.hub.attach(&room_code);
                conn.signals = Some((room_code, rx));
                ServerMessage::Ack
            }

            ClientMessage::Unsubscribe { room_code } => {
                if conn
                    .signals
                    .as_ref()
                    .is_some_and(|(code, _)| code == &room_code)
                {
                    conn.signals = None;
                }
                ServerMessage::Ack
            }

            ClientMessage::Signal { envelope } => {
                let Some(identity) = conn.identity.as_ref() else {
                    return ServerMessage::error("join before signaling");
                };
                if &envelope.sender != identity {
                    return ServerMessage::error("sender does not match connection");
                }
                if !self.is_member(&envelope.room_code, identity)
                    || !self.is_member(&envelope.room_code, &envelope.recipient)
                {
                    return ServerMessage::error("not a member of this room");
                }

                self.hub.deliver(envelope);
                ServerMessage::Ack
            }
        }
    }

    fn is_member(&self, room_code: &RoomCode, identity: &Identity) -> bool {
        self.queue
            .room(room_code)
            .is_some_and(|room| room.active && room.has_member(identity))
    }
}

impl Default for LobbyServer {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-connection state
struct Connection {
    identity: Option<Identity>,
    signals: Option<(RoomCode, broadcast::Receiver<SignalingEnvelope>)>,
}

async fn next_signal(
    signals: &mut Option<(RoomCode, broadcast::Receiver<SignalingEnvelope>)>,
) -> Option<SignalingEnvelope> {
    let Some((room_code, rx)) = signals.as_mut() else {
        return std::future::pending().await;
    };

    loop {
        match rx.recv().await {
            Ok(envelope) => return Some(envelope),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(
                    "Signals in {} lagged, {} skipped",
                    room_code.display_suffix(),
                    skipped
                );
            }
            Err(broadcast::error::RecvError::Closed) => return None,
        }
    }
}

/// Drop hub channels of rooms that have ended
async fn close_ended_rooms(mut events: broadcast::Receiver<QueueEvent>, hub: Arc<SignalingHub>) {
    loop {
        match events.recv().await {
            Ok(QueueEvent::RoomEnded { room_code, .. }) => hub.close_room(&room_code),
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("Room cleanup lagged, {} events skipped", skipped);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
