use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::{Sink, SinkExt};
use tokio::sync::{Mutex, RwLock};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Message};
use tokio_tungstenite::tungstenite::Error as WsError;
use tracing::debug;

use crate::errors::FixtureError;
use crate::reporter::TestReporter;

static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Write half of a connection.
pub(crate) type BoxedSink = Box<dyn Sink<Message, Error = WsError> + Send + Unpin>;

/// Identity of one upgraded connection, unique for the process lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub(crate) fn next() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::SeqCst))
    }

    #[cfg(test)]
    pub(crate) fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn_{}", self.0)
    }
}

pub(crate) struct Connection {
    id: ConnectionId,
    sink: Arc<Mutex<BoxedSink>>,
}

impl Connection {
    pub(crate) fn new(id: ConnectionId, sink: Arc<Mutex<BoxedSink>>) -> Self {
        Self { id, sink }
    }
}

/// Live connections, shared between the accept loop, every read loop and the
/// server handle.
#[derive(Clone, Default)]
pub(crate) struct ConnectionRegistry {
    connections: Arc<RwLock<Vec<Connection>>>,
}

impl ConnectionRegistry {
    pub(crate) async fn add(&self, connection: Connection) {
        let mut connections = self.connections.write().await;
        debug!("Registering {} ({} already open)", connection.id, connections.len());
        connections.push(connection);
    }

    /// Filters `id` out of the registry. Returns whether it was present.
    pub(crate) async fn remove(&self, id: ConnectionId) -> bool {
        let mut connections = self.connections.write().await;
        let before = connections.len();
        connections.retain(|c| c.id != id);
        before != connections.len()
    }

    pub(crate) async fn len(&self) -> usize {
        self.connections.read().await.len()
    }

    pub(crate) async fn clear(&self) {
        self.connections.write().await.clear();
    }

    /// Sends a normal-closure frame to every registered connection.
    ///
    /// Entries stay in place; each one leaves the registry when its read loop
    /// sees the client's close reply. Write failures go to `reporter` and do
    /// not stop the iteration. Returns the number of frames written.
    pub(crate) async fn broadcast_close(&self, reporter: &TestReporter) -> usize {
        let connections = self.connections.read().await;
        let mut sent = 0;

        for connection in connections.iter() {
            let frame = CloseFrame {
                code: CloseCode::Normal,
                reason: "".into(),
            };
            let result = connection
                .sink
                .lock()
                .await
                .send(Message::Close(Some(frame)))
                .await;

            match result {
                Ok(()) => {
                    debug!("Sent close frame to {}", connection.id);
                    sent += 1;
                }
                Err(source) => reporter.error(&FixtureError::WriteClose {
                    id: connection.id,
                    source,
                }),
            }
        }

        sent
    }
}
