//! Network error types

use thiserror::Error;

/// Errors that can occur in the lobby server and client
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Connection timeout")]
    ConnectionTimeout,

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Address parse error: {0}")]
    AddrParse(#[from] std::net::AddrParseError),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The server refused a request
    #[error("Server error: {0}")]
    Server(String),
}

impl From<serde_json::Error> for NetworkError {
    fn from(e: serde_json::Error) -> Self {
        NetworkError::Protocol(e.to_string())
    }
}

impl From<rustls::Error> for NetworkError {
    fn from(e: rustls::Error) -> Self {
        NetworkError::Tls(e.to_string())
    }
}
