//! Lobby networking
//!
//! WebSocket server exposing the matching queue and signaling hub, and the
//! matching client used by remote participants.

mod client;
mod error;
mod protocol;
mod server;
mod tls;

pub use client::LobbyClient;
pub use error::NetworkError;
pub use protocol::{ClientMessage, ServerMessage};
pub use server::LobbyServer;
pub use tls::{create_tls_acceptor, load_certs, load_key};
