//! Server-side WebSocket (RFC 6455) over TCP.
//!
//! Accepts plain TCP connections, drives the HTTP/1.1 upgrade handshake
//! under a deadline, and hands fully upgraded [`WebSocketConnection`]s to
//! the application through a queue:
//!
//! raw socket → [`Connection`] (buffering, deadlines) → [`HttpConnection`]
//! (request parsing, accept token, 101 response) → [`WebSocketConnection`]
//! (framing, reassembly) → [`Server`] queue → application send/receive loop.
//!
//! The server is strictly server-role: inbound frames must be masked,
//! outbound frames never are. TLS and extension negotiation are out of
//! scope.

mod connection;
mod http;
mod server;
mod websocket;

pub use connection::Connection;
pub use http::{HttpConnection, HttpRequestHeader, HttpResponseHeader};
pub use server::{Server, ServerConfig};
pub use websocket::{Outcome, WebSocketConnection};

// Re-export the message model so applications need only this crate.
pub use weir_protocol::Message;

/// Errors produced by connection-level operations.
///
/// The taxonomy matters at the WebSocket boundary: transport-level
/// failures (`Io`, `Eof`) surface as [`Outcome::Closed`], everything else
/// as [`Outcome::Failed`].
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unexpected end of stream")]
    Eof,

    #[error("operation timed out")]
    Timeout,

    #[error("malformed HTTP header: {0}")]
    Format(String),

    #[error("protocol violation: {0}")]
    Protocol(&'static str),
}

impl ConnectionError {
    /// True for failures of the transport itself rather than of the data
    /// it carried.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Io(_) | Self::Eof)
    }
}

impl From<weir_protocol::WireError> for ConnectionError {
    fn from(_: weir_protocol::WireError) -> Self {
        Self::Protocol("invalid integer width")
    }
}

/// Errors produced by the accept loop.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("server already running")]
    AlreadyRunning,
}
