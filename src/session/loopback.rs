//! In-process capability host
//!
//! Peer sessions created from the same [`LoopbackNetwork`] connect to each
//! other through offer/answer exchange. There is no media; descriptions carry
//! the peer id so an answer can be linked back to its offer. A description
//! from a peer outside the network is treated as reachable, which lets a probe
//! negotiate against another process. Used by the CLI and by tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use tokio::sync::broadcast;
use tracing::{debug, trace};
use uuid::Uuid;

use super::capability::{
    CapabilityError, CapabilityHost, HostEvent, IceCandidate, LocalMedia, MediaConstraints,
    PeerConnectionState, PeerSession, SdpType, SessionDescription,
};

/// Capacity of each peer's event channel
const PEER_EVENT_CAPACITY: usize = 64;

/// Behaviour switches for a [`LoopbackHost`]
#[derive(Debug, Clone)]
pub struct LoopbackOptions {
    /// Refuse `local_media` as if the user denied the permission prompt
    pub deny_media: bool,
    /// Reject offer and answer creation
    pub reject_negotiation: bool,
    /// Local candidates gathered per description
    pub candidates_per_side: usize,
}

impl Default for LoopbackOptions {
    fn default() -> Self {
        Self {
            deny_media: false,
            reject_negotiation: false,
            candidates_per_side: 2,
        }
    }
}

/// Counters observed by tests and the demo
#[derive(Debug, Default)]
pub struct LoopbackStats {
    pub offers_created: AtomicUsize,
    pub answers_created: AtomicUsize,
    pub candidates_applied: AtomicUsize,
    pub candidates_rejected: AtomicUsize,
    pub peers_created: AtomicUsize,
    pub peers_closed: AtomicUsize,
    pub media_acquired: AtomicUsize,
    last_constraints: Mutex<Option<MediaConstraints>>,
}

impl LoopbackStats {
    /// Constraints passed to the most recent `local_media` call
    pub fn last_constraints(&self) -> Option<MediaConstraints> {
        *self.last_constraints.lock()
    }

    pub fn get(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

/// Registry through which loopback peers find each other
#[derive(Default)]
pub struct LoopbackNetwork {
    peers: RwLock<HashMap<String, Weak<LoopbackPeer>>>,
}

impl LoopbackNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn register(&self, peer: &Arc<LoopbackPeer>) {
        let mut peers = self.peers.write();
        peers.retain(|_, weak| weak.strong_count() > 0);
        peers.insert(peer.id.clone(), Arc::downgrade(peer));
    }

    fn find(&self, id: &str) -> Option<Arc<LoopbackPeer>> {
        self.peers.read().get(id).and_then(Weak::upgrade)
    }

    fn forget(&self, id: &str) {
        self.peers.write().remove(id);
    }

    /// Number of live peers
    pub fn peer_count(&self) -> usize {
        self.peers
            .read()
            .values()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }
}

/// Capability host backed by a [`LoopbackNetwork`]
pub struct LoopbackHost {
    network: Arc<LoopbackNetwork>,
    options: LoopbackOptions,
    stats: Arc<LoopbackStats>,
    media: Mutex<Option<LocalMedia>>,
    video: AtomicBool,
    audio: AtomicBool,
}

impl LoopbackHost {
    pub fn new(network: Arc<LoopbackNetwork>, options: LoopbackOptions) -> Self {
        Self {
            network,
            options,
            stats: Arc::new(LoopbackStats::default()),
            media: Mutex::new(None),
            video: AtomicBool::new(true),
            audio: AtomicBool::new(true),
        }
    }

    pub fn stats(&self) -> Arc<LoopbackStats> {
        self.stats.clone()
    }

    pub fn video_enabled(&self) -> bool {
        self.video.load(Ordering::SeqCst)
    }

    pub fn audio_enabled(&self) -> bool {
        self.audio.load(Ordering::SeqCst)
    }

    /// Whether local media is currently held
    pub fn has_media(&self) -> bool {
        self.media.lock().is_some()
    }
}

#[async_trait]
impl CapabilityHost for LoopbackHost {
    async fn local_media(
        &self,
        constraints: MediaConstraints,
    ) -> Result<LocalMedia, CapabilityError> {
        *self.stats.last_constraints.lock() = Some(constraints);

        if self.options.deny_media {
            return Err(CapabilityError::PermissionDenied(
                "camera and microphone access denied".to_string(),
            ));
        }

        self.video.store(constraints.video, Ordering::SeqCst);
        self.audio.store(constraints.audio, Ordering::SeqCst);

        let media = LocalMedia {
            stream_id: format!("local-{}", Uuid::new_v4().simple()),
            constraints,
        };
        *self.media.lock() = Some(media.clone());
        self.stats.media_acquired.fetch_add(1, Ordering::SeqCst);

        debug!(
            "Acquired local media {} (video={}, audio={})",
            media.stream_id, constraints.video, constraints.audio
        );
        Ok(media)
    }

    async fn release_media(&self) {
        if let Some(media) = self.media.lock().take() {
            debug!("Released local media {}", media.stream_id);
        }
    }

    async fn new_peer(&self) -> Result<Arc<dyn PeerSession>, CapabilityError> {
        let (events, _) = broadcast::channel(PEER_EVENT_CAPACITY);
        let peer = Arc::new(LoopbackPeer {
            id: Uuid::new_v4().simple().to_string(),
            network: self.network.clone(),
            options: self.options.clone(),
            stats: self.stats.clone(),
            events,
            link: Mutex::new(LinkState::default()),
        });

        self.network.register(&peer);
        self.stats.peers_created.fetch_add(1, Ordering::SeqCst);
        trace!("Created loopback peer {}", peer.id);

        Ok(peer)
    }

    fn toggle_video(&self, enabled: bool) {
        self.video.store(enabled, Ordering::SeqCst);
    }

    fn toggle_audio(&self, enabled: bool) {
        self.audio.store(enabled, Ordering::SeqCst);
    }
}

#[derive(Debug, Default)]
struct LinkState {
    local_description: bool,
    remote_description: bool,
    data_channel: Option<String>,
    linked: Option<String>,
    connected: bool,
    closed: bool,
}

/// One loopback peer connection
pub struct LoopbackPeer {
    id: String,
    network: Arc<LoopbackNetwork>,
    options: LoopbackOptions,
    stats: Arc<LoopbackStats>,
    events: broadcast::Sender<HostEvent>,
    link: Mutex<LinkState>,
}

impl LoopbackPeer {
    fn emit(&self, event: HostEvent) {
        let _ = self.events.send(event);
    }

    fn description(&self, kind: SdpType) -> SessionDescription {
        SessionDescription {
            kind,
            sdp: format!(
                "v=0\r\no=loopback {} 0 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n",
                self.id
            ),
        }
    }

    fn gather_candidates(&self) {
        let mut rng = rand::thread_rng();
        for index in 0..self.options.candidates_per_side {
            let port: u16 = rng.gen_range(49152..65535);
            self.emit(HostEvent::LocalCandidate(IceCandidate {
                candidate: format!(
                    "candidate:{} 1 udp 2122260223 127.0.0.1 {} typ host",
                    index + 1,
                    port
                ),
                sdp_mid: Some("0".to_string()),
                sdp_m_line_index: Some(0),
            }));
        }
    }

    fn ensure_open(&self) -> Result<(), CapabilityError> {
        if self.link.lock().closed {
            return Err(CapabilityError::Closed);
        }
        Ok(())
    }

    fn announce_connected(&self, remote_id: &str, data_channel: bool) {
        self.emit(HostEvent::ConnectionState(PeerConnectionState::Connecting));
        self.emit(HostEvent::ConnectionState(PeerConnectionState::Connected));
        self.emit(HostEvent::RemoteStream {
            stream_id: format!("remote-{}", remote_id),
        });
        if data_channel {
            self.emit(HostEvent::DataChannelOpen);
        }
    }
}

/// Peer id carried in a loopback description's origin line
fn origin_of(description: &SessionDescription) -> Option<&str> {
    description
        .sdp
        .lines()
        .find_map(|line| line.strip_prefix("o=loopback "))
        .and_then(|rest| rest.split_whitespace().next())
}

#[async_trait]
impl PeerSession for LoopbackPeer {
    fn subscribe(&self) -> broadcast::Receiver<HostEvent> {
        self.events.subscribe()
    }

    async fn create_offer(&self) -> Result<SessionDescription, CapabilityError> {
        self.ensure_open()?;
        if self.options.reject_negotiation {
            return Err(CapabilityError::Rejected("offer creation refused".to_string()));
        }

        self.link.lock().local_description = true;
        self.stats.offers_created.fetch_add(1, Ordering::SeqCst);

        let offer = self.description(SdpType::Offer);
        self.gather_candidates();
        Ok(offer)
    }

    async fn create_answer(
        &self,
        offer: SessionDescription,
    ) -> Result<SessionDescription, CapabilityError> {
        self.ensure_open()?;
        if self.options.reject_negotiation {
            return Err(CapabilityError::Rejected("answer creation refused".to_string()));
        }
        if offer.kind != SdpType::Offer {
            return Err(CapabilityError::Rejected("expected an offer".to_string()));
        }
        let offerer = origin_of(&offer)
            .ok_or_else(|| CapabilityError::Rejected("unknown offer origin".to_string()))?
            .to_string();

        let in_process = self.network.find(&offerer).is_some();
        {
            let mut link = self.link.lock();
            link.remote_description = true;
            link.local_description = true;
            link.linked = Some(offerer.clone());
            link.connected = !in_process;
        }
        self.stats.answers_created.fetch_add(1, Ordering::SeqCst);

        let answer = self.description(SdpType::Answer);
        self.gather_candidates();

        // An offer from another process has no local counterpart to wait for
        if !in_process {
            debug!("Offer from remote peer {}, assuming reachable", offerer);
            self.announce_connected(&offerer, false);
        }
        Ok(answer)
    }

    async fn set_remote_answer(&self, answer: SessionDescription) -> Result<(), CapabilityError> {
        self.ensure_open()?;
        if answer.kind != SdpType::Answer {
            return Err(CapabilityError::Rejected("expected an answer".to_string()));
        }
        let answerer_id = origin_of(&answer)
            .ok_or_else(|| CapabilityError::Rejected("unknown answer origin".to_string()))?
            .to_string();

        let data_channel = {
            let mut link = self.link.lock();
            if !link.local_description {
                return Err(CapabilityError::Rejected(
                    "answer without local offer".to_string(),
                ));
            }
            link.remote_description = true;
            link.linked = Some(answerer_id.clone());
            link.connected = true;
            link.data_channel.clone()
        };

        match self.network.find(&answerer_id) {
            Some(answerer) => {
                {
                    let mut link = answerer.link.lock();
                    link.connected = true;
                    link.data_channel = data_channel.clone();
                }
                answerer.announce_connected(&self.id, data_channel.is_some());
            }
            None => debug!("Answer from remote peer {}, assuming reachable", answerer_id),
        }
        self.announce_connected(&answerer_id, data_channel.is_some());

        Ok(())
    }

    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<(), CapabilityError> {
        self.ensure_open()?;
        if !self.link.lock().remote_description {
            self.stats.candidates_rejected.fetch_add(1, Ordering::SeqCst);
            return Err(CapabilityError::Rejected(
                "candidate before remote description".to_string(),
            ));
        }

        trace!("Peer {} applied {}", self.id, candidate.candidate);
        self.stats.candidates_applied.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn open_data_channel(&self, label: &str) -> Result<(), CapabilityError> {
        self.ensure_open()?;
        self.link.lock().data_channel = Some(label.to_string());
        Ok(())
    }

    async fn send_data(&self, text: &str) -> Result<(), CapabilityError> {
        let remote = {
            let link = self.link.lock();
            if link.closed || !link.connected || link.data_channel.is_none() {
                return Err(CapabilityError::Closed);
            }
            link.linked.clone()
        };

        let remote = remote
            .and_then(|id| self.network.find(&id))
            .ok_or_else(|| CapabilityError::Rejected("peer not reachable in-process".to_string()))?;
        remote.emit(HostEvent::DataChannelMessage(text.to_string()));
        Ok(())
    }

    async fn close(&self) {
        let linked = {
            let mut link = self.link.lock();
            if link.closed {
                return;
            }
            link.closed = true;
            link.connected = false;
            link.linked.take()
        };

        self.network.forget(&self.id);
        self.stats.peers_closed.fetch_add(1, Ordering::SeqCst);
        self.emit(HostEvent::ConnectionState(PeerConnectionState::Closed));

        if let Some(remote) = linked.and_then(|id| self.network.find(&id)) {
            let was_connected = {
                let mut link = remote.link.lock();
                let was_connected = link.connected && !link.closed;
                link.connected = false;
                was_connected
            };
            if was_connected {
                remote.emit(HostEvent::ConnectionState(PeerConnectionState::Disconnected));
            }
        }

        trace!("Closed loopback peer {}", self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_offer_answer_connects_both_sides() {
        let network = LoopbackNetwork::new();
        let host_a = LoopbackHost::new(network.clone(), LoopbackOptions::default());
        let host_b = LoopbackHost::new(network.clone(), LoopbackOptions::default());

        let a = host_a.new_peer().await.unwrap();
        let b = host_b.new_peer().await.unwrap();
        let mut events_b = b.subscribe();

        a.open_data_channel("chat").await.unwrap();
        let offer = a.create_offer().await.unwrap();
        let answer = b.create_answer(offer).await.unwrap();
        a.set_remote_answer(answer).await.unwrap();

        let mut connected = false;
        while let Ok(event) = events_b.try_recv() {
            if event == HostEvent::ConnectionState(PeerConnectionState::Connected) {
                connected = true;
            }
        }
        assert!(connected);

        a.send_data("hello").await.unwrap();
        let mut received = None;
        while let Ok(event) = events_b.try_recv() {
            if let HostEvent::DataChannelMessage(text) = event {
                received = Some(text);
            }
        }
        assert_eq!(received.as_deref(), Some("hello"));
    }

    #[tokio::test]
    async fn test_candidate_before_remote_description_rejected() {
        let network = LoopbackNetwork::new();
        let host = LoopbackHost::new(network, LoopbackOptions::default());
        let peer = host.new_peer().await.unwrap();

        let candidate = IceCandidate {
            candidate: "candidate:1 1 udp 1 127.0.0.1 5000 typ host".to_string(),
            sdp_mid: None,
            sdp_m_line_index: None,
        };
        assert!(peer.add_remote_candidate(candidate).await.is_err());
        assert_eq!(LoopbackStats::get(&host.stats().candidates_rejected), 1);
    }

    #[tokio::test]
    async fn test_close_disconnects_remote() {
        let network = LoopbackNetwork::new();
        let host = LoopbackHost::new(network.clone(), LoopbackOptions::default());

        let a = host.new_peer().await.unwrap();
        let b = host.new_peer().await.unwrap();
        let answer = b.create_answer(a.create_offer().await.unwrap()).await.unwrap();
        a.set_remote_answer(answer).await.unwrap();

        let mut events_b = b.subscribe();
        a.close().await;

        assert_eq!(
            events_b.try_recv().unwrap(),
            HostEvent::ConnectionState(PeerConnectionState::Disconnected)
        );
        assert_eq!(network.peer_count(), 1);
    }

    #[tokio::test]
    async fn test_denied_media() {
        let host = LoopbackHost::new(
            LoopbackNetwork::new(),
            LoopbackOptions {
                deny_media: true,
                ..Default::default()
            },
        );
        let result = host.local_media(MediaConstraints::default()).await;
        assert!(matches!(result, Err(CapabilityError::PermissionDenied(_))));
        assert!(!host.has_media());
    }
}
