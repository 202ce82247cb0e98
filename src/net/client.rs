//! Lobby client
//!
//! A WebSocket connection to a [`super::LobbyServer`] that implements both
//! [`Matchmaker`] and [`SignalTransport`], so a session can run against a
//! remote lobby exactly as it runs against the in-process queue and hub.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use super::error::NetworkError;
use super::protocol::{ClientMessage, ServerMessage};
use crate::identity::Identity;
use crate::matching::{EntryId, MatchError, Matchmaker, QueueEvent, RoomCode};
use crate::signaling::{SignalTransport, SignalingEnvelope, SignalingError};

/// How long to wait for a reply before giving up
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Capacity of the pushed event channels
const PUSH_CAPACITY: usize = 256;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type PendingReplies = Arc<Mutex<VecDeque<oneshot::Sender<ServerMessage>>>>;

/// Connection to a lobby server
pub struct LobbyClient {
    url: String,
    writer: tokio::sync::Mutex<SplitSink<WsStream, Message>>,
    pending: PendingReplies,
    queue_events: broadcast::Sender<QueueEvent>,
    signals: broadcast::Sender<SignalingEnvelope>,
    connected: Arc<AtomicBool>,
    bound: Mutex<Option<Identity>>,
}

impl LobbyClient {
    /// Connect to `url` (ws:// or wss://)
    pub async fn connect(url: &str) -> Result<Self, NetworkError> {
        let (ws_stream, _) = tokio::time::timeout(REQUEST_TIMEOUT, connect_async(url))
            .await
            .map_err(|_| NetworkError::ConnectionTimeout)??;

        info!("Connected to lobby server: {}", url);

        let (writer, reader) = ws_stream.split();
        let pending: PendingReplies = Arc::new(Mutex::new(VecDeque::new()));
        let (queue_events, _) = broadcast::channel(PUSH_CAPACITY);
        let (signals, _) = broadcast::channel(PUSH_CAPACITY);
        let connected = Arc::new(AtomicBool::new(true));

        tokio::spawn(read_loop(
            reader,
            pending.clone(),
            queue_events.clone(),
            signals.clone(),
            connected.clone(),
        ));

        Ok(Self {
            url: url.to_string(),
            writer: tokio::sync::Mutex::new(writer),
            pending,
            queue_events,
            signals,
            connected,
            bound: Mutex::new(None),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Send a request and wait for its reply
    pub async fn request(&self, msg: ClientMessage) -> Result<ServerMessage, NetworkError> {
        if !self.is_connected() {
            return Err(NetworkError::ConnectionClosed);
        }

        let json = serde_json::to_string(&msg)?;
        let (tx, rx) = oneshot::channel();

        {
            // Queue the reply slot under the writer lock so slots match send order
            let mut writer = self.writer.lock().await;
            self.pending.lock().push_back(tx);
            if let Err(e) = writer.send(Message::Text(json)).await {
                self.pending.lock().pop_back();
                return Err(e.into());
            }
        }

        let reply = tokio::time::timeout(REQUEST_TIMEOUT, rx)
            .await
            .map_err(|_| NetworkError::ConnectionTimeout)?
            .map_err(|_| NetworkError::ConnectionClosed)?;

        match reply {
            ServerMessage::Error { message } => Err(NetworkError::Server(message)),
            reply => Ok(reply),
        }
    }

    /// Close the connection
    pub async fn close(&self) -> Result<(), NetworkError> {
        self.connected.store(false, Ordering::SeqCst);
        self.writer.lock().await.close().await?;
        Ok(())
    }

    /// Ensure requests for `identity` go through a connection bound to it
    fn check_bound(&self, identity: &Identity) -> Result<(), MatchError> {
        match self.bound.lock().as_ref() {
            Some(bound) if bound != identity => Err(MatchError::AlreadyBound(bound.to_string())),
            _ => Ok(()),
        }
    }
}

async fn read_loop(
    mut reader: SplitStream<WsStream>,
    pending: PendingReplies,
    queue_events: broadcast::Sender<QueueEvent>,
    signals: broadcast::Sender<SignalingEnvelope>,
    connected: Arc<AtomicBool>,
) {
    while let Some(msg) = reader.next().await {
        let text = match msg {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                warn!("Lobby connection error: {}", e);
                break;
            }
        };

        let msg = match serde_json::from_str::<ServerMessage>(&text) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("Invalid message from lobby: {}", e);
                continue;
            }
        };

        match msg {
            ServerMessage::Queue { event } => {
                let _ = queue_events.send(event);
            }
            ServerMessage::Signal { envelope } => {
                let _ = signals.send(envelope);
            }
            reply => match pending.lock().pop_front() {
                Some(slot) => {
                    let _ = slot.send(reply);
                }
                None => warn!("Unsolicited reply from lobby: {:?}", reply),
            },
        }
    }

    connected.store(false, Ordering::SeqCst);
    // Dropping the slots fails every outstanding request
    pending.lock().clear();
    debug!("Lobby connection closed");
}

fn join_failed(e: NetworkError) -> MatchError {
    MatchError::JoinFailed(e.to_string())
}

fn transport_failed(e: NetworkError) -> SignalingError {
    match e {
        NetworkError::ConnectionClosed => SignalingError::Closed,
        e => SignalingError::Transport(e.to_string()),
    }
}

#[async_trait]
impl Matchmaker for LobbyClient {
    async fn join(&self, identity: &Identity) -> Result<EntryId, MatchError> {
        self.check_bound(identity)?;

        let reply = self
            .request(ClientMessage::Join {
                identity: identity.clone(),
            })
            .await
            .map_err(join_failed)?;

        match reply {
            ServerMessage::Joined { entry_id } => {
                *self.bound.lock() = Some(identity.clone());
                Ok(entry_id)
            }
            other => Err(MatchError::JoinFailed(format!("unexpected reply {:?}", other))),
        }
    }

    async fn leave(&self, identity: &Identity) -> Result<(), MatchError> {
        self.check_bound(identity)?;
        self.request(ClientMessage::Leave)
            .await
            .map_err(join_failed)?;
        Ok(())
    }

    async fn end_room(&self, identity: &Identity) -> Result<Option<RoomCode>, MatchError> {
        self.check_bound(identity)?;
        match self
            .request(ClientMessage::EndRoom { room_code: None })
            .await
            .map_err(join_failed)?
        {
            ServerMessage::Closed { room_code } => Ok(room_code),
            other => Err(MatchError::JoinFailed(format!("unexpected reply {:?}", other))),
        }
    }

    async fn close_room(
        &self,
        identity: &Identity,
        room_code: &RoomCode,
    ) -> Result<bool, MatchError> {
        self.check_bound(identity)?;
        match self
            .request(ClientMessage::EndRoom {
                room_code: Some(room_code.clone()),
            })
            .await
            .map_err(join_failed)?
        {
            ServerMessage::Closed { room_code } => Ok(room_code.is_some()),
            other => Err(MatchError::JoinFailed(format!("unexpected reply {:?}", other))),
        }
    }

    async fn count_waiting(&self) -> Result<usize, MatchError> {
        match self
            .request(ClientMessage::CountWaiting)
            .await
            .map_err(join_failed)?
        {
            ServerMessage::WaitingCount { count } => Ok(count),
            other => Err(MatchError::JoinFailed(format!("unexpected reply {:?}", other))),
        }
    }

    fn events(&self) -> broadcast::Receiver<QueueEvent> {
        self.queue_events.subscribe()
    }
}

#[async_trait]
impl SignalTransport for LobbyClient {
    async fn publish(&self, envelope: SignalingEnvelope) -> Result<(), SignalingError> {
        self.request(ClientMessage::Signal { envelope })
            .await
            .map_err(transport_failed)?;
        Ok(())
    }

    async fn subscribe(
        &self,
        room_code: &RoomCode,
        _recipient: &Identity,
    ) -> Result<broadcast::Receiver<SignalingEnvelope>, SignalingError> {
        // Receiver first so nothing pushed after the ack is missed
        let rx = self.signals.subscribe();
        self.request(ClientMessage::Subscribe {
            room_code: room_code.clone(),
        })
        .await
        .map_err(transport_failed)?;
        Ok(rx)
    }

    async fn unsubscribe(&self, room_code: &RoomCode, _recipient: &Identity) {
        let result = self
            .request(ClientMessage::Unsubscribe {
                room_code: room_code.clone(),
            })
            .await;
        if let Err(e) = result {
            debug!("Unsubscribe from {} failed: {}", room_code.display_suffix(), e);
        }
    }
}
