//! Participant sessions
//!
//! A session drives one participant through search, match, signaling and
//! peer negotiation, and exposes the result as a [`ConnectionState`] plus a
//! stream of [`SessionEvent`]s.

mod candidates;
mod capability;
mod error;
mod guard;
mod loopback;
mod orchestrator;
mod state;

pub use candidates::PendingCandidates;
pub use capability::{
    CapabilityError, CapabilityHost, HostEvent, IceCandidate, LocalMedia, MediaConstraints,
    PeerConnectionState, PeerSession, SdpType, SessionDescription,
};
pub use error::SessionError;
pub use guard::{SessionGuard, SessionToken};
pub use loopback::{LoopbackHost, LoopbackNetwork, LoopbackOptions, LoopbackPeer, LoopbackStats};
pub use orchestrator::{Orchestrator, SessionEvent, SessionHandle};
pub use state::ConnectionState;
