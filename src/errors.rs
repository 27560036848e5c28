use std::net::SocketAddr;

use thiserror::Error;
use tokio_tungstenite::tungstenite;

use crate::server::ConnectionId;

/// Errors raised by the event websocket fixture.
///
/// Setup errors (`Bind`, `LocalAddr`, `UrlParse`, `SchemeRewrite`) are
/// returned from `EventWebsocketServer::start`. The remaining variants
/// happen inside background tasks and are recorded by the `TestReporter`.
#[derive(Debug, Error)]
pub enum FixtureError {
    #[error("Failed to bind listener on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to read listener address: {0}")]
    LocalAddr(#[source] std::io::Error),

    #[error("Invalid server URL: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("Cannot rewrite scheme of {url} to {scheme}")]
    SchemeRewrite { url: String, scheme: &'static str },

    #[error("WebSocket upgrade failed for {peer}: {source}")]
    Upgrade {
        peer: SocketAddr,
        #[source]
        source: tungstenite::Error,
    },

    #[error("WebSocket read failed on {id}: {source}")]
    Read {
        id: ConnectionId,
        #[source]
        source: tungstenite::Error,
    },

    #[error("Unexpected close code {code} on {id}")]
    UnexpectedClose { id: ConnectionId, code: u16 },

    #[error("Failed to write close message to {id}: {source}")]
    WriteClose {
        id: ConnectionId,
        #[source]
        source: tungstenite::Error,
    },

    #[error("Connection task panicked: {0}")]
    ConnectionTask(#[source] tokio::task::JoinError),
}
