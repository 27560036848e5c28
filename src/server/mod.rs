//! In-process WebSocket server standing in for an event-streaming backend.
//!
//! Clients connect to [`EventWebsocketServer::url`]. Every text payload they
//! send lands on [`EventWebsocketServer::received`] and every completed
//! handshake raises [`EventWebsocketServer::connected`].
//! [`EventWebsocketServer::write_close_message`] disconnects all clients while
//! the listener keeps accepting, so one server can serve several
//! connect/disconnect cycles in a single test.

mod connection;
mod registry;

#[cfg(test)]
mod tests;

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::timeout;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::FixtureConfig;
use crate::errors::FixtureError;
use crate::reporter::{Failure, TestReporter};
use connection::ConnectionContext;
use registry::ConnectionRegistry;

pub use connection::ConnectionState;
pub use registry::ConnectionId;

pub struct EventWebsocketServer {
    /// Base URL with the `ws` scheme.
    pub url: Url,
    /// One pending notification at most; extra connects while it is unread
    /// are dropped.
    pub connected: mpsc::Receiver<()>,
    /// Client payloads in arrival order; overflow is dropped.
    pub received: mpsc::Receiver<String>,
    local_addr: SocketAddr,
    registry: ConnectionRegistry,
    reporter: TestReporter,
}

/// The connected signal holds a single pending notification.
const CONNECTED_SIGNAL_SLOTS: usize = 1;

/// Shutdown callback returned next to the server.
///
/// Dropping it without calling [`Shutdown::close`] or
/// [`Shutdown::close_quietly`] stops the server and panics if any failure was
/// recorded, like `close` does.
pub struct Shutdown {
    shutdown_tx: Option<broadcast::Sender<()>>,
    accept_task: Option<JoinHandle<()>>,
    reporter: TestReporter,
}

impl EventWebsocketServer {
    /// Starts a server configured from the `EVENT_WS_*` environment
    /// variables, by default on an ephemeral localhost port.
    pub async fn new() -> Result<(Self, Shutdown), FixtureError> {
        Self::start(FixtureConfig::from_env()).await
    }

    pub async fn start(config: FixtureConfig) -> Result<(Self, Shutdown), FixtureError> {
        let listener = TcpListener::bind(config.bind_addr)
            .await
            .map_err(|source| FixtureError::Bind {
                addr: config.bind_addr,
                source,
            })?;
        let local_addr = listener.local_addr().map_err(FixtureError::LocalAddr)?;
        let url = websocket_url(local_addr)?;

        let (connected_tx, connected) = mpsc::channel(CONNECTED_SIGNAL_SLOTS);
        let (received_tx, received) = mpsc::channel(config.received_capacity.max(1));
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let registry = ConnectionRegistry::default();
        let reporter = TestReporter::new();
        let ctx = ConnectionContext {
            registry: registry.clone(),
            reporter: reporter.clone(),
            connected_tx,
            received_tx,
        };

        let accept_task = tokio::spawn(accept_loop(listener, ctx, shutdown_rx));
        info!("EventWebsocketServer listening on {}", url);

        let server = Self {
            url,
            connected,
            received,
            local_addr,
            registry,
            reporter: reporter.clone(),
        };
        let shutdown = Shutdown {
            shutdown_tx: Some(shutdown_tx),
            accept_task: Some(accept_task),
            reporter,
        };
        Ok((server, shutdown))
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Tells connected clients to disconnect.
    ///
    /// Emulates the backend going away without closing the listener, so
    /// clients can reconnect to the same address afterwards. Returns the
    /// number of close frames written; write failures are recorded as
    /// non-fatal.
    pub async fn write_close_message(&self) -> usize {
        let sent = self.registry.broadcast_close(&self.reporter).await;
        debug!("Broadcast close frame to {} connection(s)", sent);
        sent
    }

    /// Number of connections currently in the registry.
    pub async fn connection_count(&self) -> usize {
        self.registry.len().await
    }

    /// Failures recorded so far by the server's tasks.
    pub fn failures(&self) -> Vec<Failure> {
        self.reporter.failures()
    }

    /// Waits up to `within` for the connected signal.
    pub async fn wait_connected(&mut self, within: Duration) -> bool {
        matches!(timeout(within, self.connected.recv()).await, Ok(Some(())))
    }

    /// Waits up to `within` for the next client payload.
    pub async fn next_received(&mut self, within: Duration) -> Option<String> {
        timeout(within, self.received.recv()).await.ok().flatten()
    }
}

impl Shutdown {
    /// Stops the server and fails the test if any failure was recorded.
    pub async fn close(self) {
        let reporter = self.reporter.clone();
        self.close_quietly().await;
        reporter.assert_clean();
    }

    /// Stops the server and hands back recorded failures.
    pub async fn close_quietly(mut self) -> Vec<Failure> {
        self.signal();

        if let Some(accept_task) = self.accept_task.take() {
            if let Err(e) = accept_task.await {
                warn!("EventWebsocketServer accept task ended abnormally: {}", e);
            }
        }
        self.reporter.failures()
    }

    /// Signals the accept loop once. Returns false if already signalled.
    fn signal(&mut self) -> bool {
        match self.shutdown_tx.take() {
            Some(shutdown_tx) => {
                // An error only means the accept loop already stopped.
                let _ = shutdown_tx.send(());
                true
            }
            None => false,
        }
    }
}

impl Drop for Shutdown {
    fn drop(&mut self) {
        if self.signal() {
            debug!("EventWebsocketServer shutdown handle dropped without close");
            self.reporter.assert_clean();
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    ctx: ConnectionContext,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let mut tasks = JoinSet::new();

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!("Accepted TCP connection from {}", peer);
                    tasks.spawn(connection::serve(stream, peer, ctx.clone()));
                }
                Err(e) => warn!("Failed to accept connection: {}", e),
            },
            Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                report_task_exit(joined, &ctx.reporter);
            }
            // Fires on an explicit signal and when the sender is dropped.
            _ = shutdown_rx.recv() => break,
        }
    }

    drop(listener);
    tasks.shutdown().await;
    ctx.registry.clear().await;
    info!("EventWebsocketServer stopped");
}

/// Records a connection task that panicked instead of returning.
pub(crate) fn report_task_exit(joined: Result<(), JoinError>, reporter: &TestReporter) {
    match joined {
        Ok(()) => {}
        Err(e) if e.is_panic() => reporter.fatal(&FixtureError::ConnectionTask(e)),
        Err(e) => debug!("Connection task cancelled: {}", e),
    }
}

/// Builds the `ws://` base URL for a bound address.
fn websocket_url(addr: SocketAddr) -> Result<Url, FixtureError> {
    let mut url = Url::parse(&format!("http://{}/", addr))?;
    url.set_scheme("ws")
        .map_err(|()| FixtureError::SchemeRewrite {
            url: url.to_string(),
            scheme: "ws",
        })?;
    Ok(url)
}
