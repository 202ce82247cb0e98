//! Capability host interface
//!
//! The browser-side primitives (media capture, peer connection, data channel)
//! are supplied from outside. The orchestrator only calls them; callbacks are
//! replaced by a broadcast stream of [`HostEvent`]s per peer session.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;

/// Local media selection, remembered across skips
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaConstraints {
    pub video: bool,
    pub audio: bool,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            video: true,
            audio: true,
        }
    }
}

/// Handle to captured local media
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalMedia {
    pub stream_id: String,
    pub constraints: MediaConstraints,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

/// Session description exchanged through the relay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpType,
    pub sdp: String,
}

/// Trickle ICE candidate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    pub sdp_mid: Option<String>,
    pub sdp_m_line_index: Option<u16>,
}

/// Peer connection state as reported by the host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Events emitted by a peer session
#[derive(Debug, Clone, PartialEq)]
pub enum HostEvent {
    /// A locally discovered candidate, to be sent to the peer immediately
    LocalCandidate(IceCandidate),
    RemoteStream { stream_id: String },
    ConnectionState(PeerConnectionState),
    DataChannelOpen,
    DataChannelMessage(String),
}

/// Errors reported by the capability host
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CapabilityError {
    /// Camera or microphone access refused
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// The host rejected a description, candidate or channel operation
    #[error("Rejected: {0}")]
    Rejected(String),

    #[error("Peer connection closed")]
    Closed,
}

/// Media capture and peer connection factory
#[async_trait]
pub trait CapabilityHost: Send + Sync {
    /// Acquire local media with the given constraints
    async fn local_media(&self, constraints: MediaConstraints)
        -> Result<LocalMedia, CapabilityError>;

    /// Stop local tracks
    async fn release_media(&self);

    /// Create a fresh peer connection with local media attached
    async fn new_peer(&self) -> Result<Arc<dyn PeerSession>, CapabilityError>;

    /// Enable or disable the local video track; idempotent
    fn toggle_video(&self, enabled: bool);

    /// Enable or disable the local audio track; idempotent
    fn toggle_audio(&self, enabled: bool);
}

/// One peer connection
#[async_trait]
pub trait PeerSession: Send + Sync {
    /// Subscribe to candidates, streams, state changes and data channel traffic
    fn subscribe(&self) -> broadcast::Receiver<HostEvent>;

    /// Create an offer and apply it as the local description
    async fn create_offer(&self) -> Result<SessionDescription, CapabilityError>;

    /// Apply `offer` as remote description, create an answer and apply it locally
    async fn create_answer(
        &self,
        offer: SessionDescription,
    ) -> Result<SessionDescription, CapabilityError>;

    async fn set_remote_answer(&self, answer: SessionDescription) -> Result<(), CapabilityError>;

    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<(), CapabilityError>;

    async fn open_data_channel(&self, label: &str) -> Result<(), CapabilityError>;

    async fn send_data(&self, text: &str) -> Result<(), CapabilityError>;

    /// Close data channel and connection, detach local and remote media
    async fn close(&self);
}
