use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Mutex;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::error::ProtocolError;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, info};

use super::registry::{BoxedSink, Connection, ConnectionId, ConnectionRegistry};
use crate::errors::FixtureError;
use crate::reporter::TestReporter;

/// Lifecycle of a single connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Handshaking,
    Open,
    Closed,
}

impl ConnectionState {
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        matches!(
            (self, next),
            (ConnectionState::Handshaking, ConnectionState::Open)
                | (ConnectionState::Handshaking, ConnectionState::Closed)
                | (ConnectionState::Open, ConnectionState::Closed)
        )
    }

    fn advance(&mut self, next: ConnectionState, id: ConnectionId) {
        debug_assert!(self.can_transition_to(next), "{:?} -> {:?}", self, next);
        debug!("{}: {:?} -> {:?}", id, self, next);
        *self = next;
    }
}

/// What the read loop does with one item from the stream.
#[derive(Debug)]
pub(crate) enum ReadOutcome {
    Payload(String),
    Control,
    Closed(CloseCode),
    Fatal(FixtureError),
}

/// State shared by every connection task of one server.
#[derive(Clone)]
pub(crate) struct ConnectionContext {
    pub(crate) registry: ConnectionRegistry,
    pub(crate) reporter: TestReporter,
    pub(crate) connected_tx: mpsc::Sender<()>,
    pub(crate) received_tx: mpsc::Sender<String>,
}

impl ConnectionContext {
    /// Raises the connected signal unless one is already pending.
    pub(crate) fn notify_connected(&self) {
        match self.connected_tx.try_send(()) {
            Ok(()) => {}
            Err(TrySendError::Full(())) => debug!("Connected notification already pending"),
            Err(TrySendError::Closed(())) => debug!("Connected receiver dropped"),
        }
    }

    /// Queues a payload for the test, dropping it when the queue is full.
    pub(crate) fn record(&self, id: ConnectionId, payload: String) {
        match self.received_tx.try_send(payload) {
            Ok(()) => {}
            Err(TrySendError::Full(payload)) => {
                debug!("Received queue full, dropping {} bytes from {}", payload.len(), id)
            }
            Err(TrySendError::Closed(_)) => debug!("Received receiver dropped"),
        }
    }
}

/// Upgrades `stream` and reads from it until the client goes away.
pub(crate) async fn serve(stream: TcpStream, peer: SocketAddr, ctx: ConnectionContext) {
    let id = ConnectionId::next();
    let mut state = ConnectionState::Handshaking;

    let ws = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) if is_abandoned_handshake(&e) => {
            debug!("{} went away before sending a request: {}", peer, e);
            state.advance(ConnectionState::Closed, id);
            return;
        }
        Err(source) => {
            ctx.reporter.fatal(&FixtureError::Upgrade { peer, source });
            state.advance(ConnectionState::Closed, id);
            return;
        }
    };

    let (sink, mut read) = ws.split();
    let sink: BoxedSink = Box::new(sink);
    let sink = Arc::new(Mutex::new(sink));
    ctx.registry.add(Connection::new(id, sink.clone())).await;
    state.advance(ConnectionState::Open, id);
    info!("Client {} connected as {}", peer, id);
    ctx.notify_connected();

    loop {
        match classify(id, read.next().await) {
            ReadOutcome::Payload(payload) => ctx.record(id, payload),
            ReadOutcome::Control => {}
            ReadOutcome::Closed(code) => {
                ctx.registry.remove(id).await;
                info!("{} closed with code {}", id, u16::from(code));
                // Flushes the close reply queued by the protocol layer.
                if let Err(e) = sink.lock().await.close().await {
                    debug!("Closing sink of {}: {}", id, e);
                }
                break;
            }
            ReadOutcome::Fatal(err) => {
                ctx.registry.remove(id).await;
                ctx.reporter.fatal(&err);
                break;
            }
        }
    }

    state.advance(ConnectionState::Closed, id);
}

/// Maps one read result onto the read loop's next step.
///
/// Normal and abnormal closures end the loop quietly. A peer that vanishes
/// without a closing handshake counts as abnormal closure. Every other close
/// code and every other error is fatal.
pub(crate) fn classify(id: ConnectionId, item: Option<Result<Message, WsError>>) -> ReadOutcome {
    match item {
        None => ReadOutcome::Closed(CloseCode::Abnormal),
        Some(Ok(Message::Text(text))) => ReadOutcome::Payload(text),
        Some(Ok(Message::Binary(data))) => {
            ReadOutcome::Payload(String::from_utf8_lossy(&data).into_owned())
        }
        Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) | Some(Ok(Message::Frame(_))) => {
            ReadOutcome::Control
        }
        Some(Ok(Message::Close(frame))) => {
            // A close frame without a body reports "no status received".
            let code = frame.map(|f| f.code).unwrap_or(CloseCode::Status);
            if is_recognised_close(code) {
                ReadOutcome::Closed(code)
            } else {
                ReadOutcome::Fatal(FixtureError::UnexpectedClose {
                    id,
                    code: code.into(),
                })
            }
        }
        Some(Err(e)) if is_abnormal_closure(&e) => ReadOutcome::Closed(CloseCode::Abnormal),
        Some(Err(source)) => ReadOutcome::Fatal(FixtureError::Read { id, source }),
    }
}

/// A peer that connects and hangs up without a request never reached the
/// upgrade, so there is nothing to fail.
fn is_abandoned_handshake(err: &WsError) -> bool {
    match err {
        WsError::Protocol(ProtocolError::HandshakeIncomplete) => true,
        WsError::ConnectionClosed | WsError::AlreadyClosed => true,
        WsError::Io(io) => matches!(
            io.kind(),
            ErrorKind::UnexpectedEof | ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted
        ),
        _ => false,
    }
}

fn is_recognised_close(code: CloseCode) -> bool {
    matches!(code, CloseCode::Normal | CloseCode::Abnormal)
}

fn is_abnormal_closure(err: &WsError) -> bool {
    match err {
        WsError::ConnectionClosed | WsError::AlreadyClosed => true,
        WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => true,
        WsError::Io(io) => matches!(
            io.kind(),
            ErrorKind::UnexpectedEof
                | ErrorKind::ConnectionReset
                | ErrorKind::ConnectionAborted
                | ErrorKind::BrokenPipe
        ),
        _ => false,
    }
}
