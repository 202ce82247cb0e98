//! pairup - Anonymous one-to-one matchmaking with peer-to-peer session setup
//!
//! Participants wait in a queue, are paired into two-member rooms, and then
//! negotiate a direct audio/video/data session through a per-room signaling
//! relay. Media and the peer connection itself are supplied by a
//! [`session::CapabilityHost`].

pub mod config;
pub mod identity;
pub mod matching;
pub mod net;
pub mod session;
pub mod signaling;

pub use config::Config;
pub use identity::{Identity, Role};
pub use matching::{MatchingQueue, Matchmaker, QueueEvent, Room, RoomCode};
pub use net::{LobbyClient, LobbyServer};
pub use session::{ConnectionState, Orchestrator, SessionEvent, SessionHandle};
pub use signaling::{SignalingHub, SignalingRelay};
