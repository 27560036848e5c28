use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout, Instant};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::server::EventWebsocketServer;
use crate::telemetry::init_test_logging;
use crate::Shutdown;

pub type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub const WAIT: Duration = Duration::from_secs(5);

pub async fn start_server() -> (EventWebsocketServer, Shutdown) {
    init_test_logging();
    EventWebsocketServer::new()
        .await
        .expect("Failed to start event websocket server")
}

pub async fn connect(server: &EventWebsocketServer) -> Client {
    let (client, _) = connect_async(server.url.as_str())
        .await
        .expect("Client failed to connect");
    client
}

pub async fn send_text(client: &mut Client, text: &str) {
    client
        .send(Message::Text(text.to_string()))
        .await
        .expect("Client failed to send text");
}

pub async fn close_with(client: &mut Client, code: CloseCode) {
    client
        .close(Some(CloseFrame {
            code,
            reason: "".into(),
        }))
        .await
        .expect("Client failed to send close frame");
}

/// Reads until the server finishes the closing handshake.
pub async fn read_until_closed(client: &mut Client) -> Vec<Message> {
    let mut seen = Vec::new();
    let _ = timeout(WAIT, async {
        while let Some(Ok(message)) = client.next().await {
            seen.push(message);
        }
    })
    .await;
    seen
}

/// Polls the registry until it holds `expected` connections.
pub async fn wait_for_count(server: &EventWebsocketServer, expected: usize) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if server.connection_count().await == expected {
            return true;
        }
        sleep(Duration::from_millis(10)).await;
    }
    false
}
