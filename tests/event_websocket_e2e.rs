use std::time::Duration;

use event_ws_fixture::telemetry::init_test_logging;
use event_ws_fixture::{EventWebsocketServer, FixtureConfig};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout, Instant};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::Message;

const WAIT: Duration = Duration::from_secs(5);

async fn wait_for_count(server: &EventWebsocketServer, expected: usize) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if server.connection_count().await == expected {
            return true;
        }
        sleep(Duration::from_millis(10)).await;
    }
    false
}

#[tokio::test]
async fn test_url_uses_websocket_scheme() {
    init_test_logging();
    let (server, shutdown) = EventWebsocketServer::new()
        .await
        .expect("Server should start");

    assert_eq!(server.url().scheme(), "ws");
    assert_eq!(server.url().host_str(), Some("127.0.0.1"));
    assert_ne!(server.local_addr().port(), 0);
    assert_eq!(server.url().port(), Some(server.local_addr().port()));

    shutdown.close().await;
}

#[tokio::test]
async fn test_reconnect_cycles_on_one_server() {
    init_test_logging();
    let (mut server, shutdown) = EventWebsocketServer::new()
        .await
        .expect("Server should start");

    for cycle in 0..3 {
        let (mut client, _) = connect_async(server.url().as_str())
            .await
            .expect("Client should connect");
        assert!(
            server.wait_connected(WAIT).await,
            "Cycle {} should signal a connection",
            cycle
        );

        client
            .send(Message::Text(format!("cycle-{}", cycle)))
            .await
            .expect("Client should send");
        assert_eq!(
            server.next_received(WAIT).await,
            Some(format!("cycle-{}", cycle))
        );

        assert_eq!(server.write_close_message().await, 1);

        let close = timeout(WAIT, client.next())
            .await
            .expect("Close frame should arrive");
        match close {
            Some(Ok(Message::Close(Some(frame)))) => assert_eq!(frame.code, CloseCode::Normal),
            other => panic!("Expected a normal close frame, got {:?}", other),
        }
        // Drive the client until the closing handshake completes.
        let _ = timeout(WAIT, async { while let Some(Ok(_)) = client.next().await {} }).await;

        assert!(wait_for_count(&server, 0).await, "Cycle {} should deregister", cycle);
    }

    assert!(server.failures().is_empty());
    shutdown.close().await;
}

#[tokio::test]
async fn test_custom_received_capacity() {
    init_test_logging();
    let config = FixtureConfig::default().with_received_capacity(2);
    let (mut server, shutdown) = EventWebsocketServer::start(config)
        .await
        .expect("Server should start");

    let (mut client, _) = connect_async(server.url().as_str())
        .await
        .expect("Client should connect");
    for text in ["a", "b", "c"] {
        client
            .send(Message::Text(text.to_string()))
            .await
            .expect("Client should send");
    }
    client
        .close(None)
        .await
        .expect("Client should close");

    // A close without a status code is not a recognised closure.
    let deadline = Instant::now() + WAIT;
    while server.failures().is_empty() && Instant::now() < deadline {
        sleep(Duration::from_millis(10)).await;
    }

    assert_eq!(server.received.try_recv().ok().as_deref(), Some("a"));
    assert_eq!(server.received.try_recv().ok().as_deref(), Some("b"));
    assert!(server.received.try_recv().is_err());

    let failures = shutdown.close_quietly().await;
    assert_eq!(failures.len(), 1);
    assert!(failures[0].message.contains("1005"));
}

#[tokio::test]
async fn test_shutdown_closes_listener() {
    init_test_logging();
    let (server, shutdown) = EventWebsocketServer::new()
        .await
        .expect("Server should start");
    let addr = server.local_addr();

    let (_client, _) = connect_async(server.url().as_str())
        .await
        .expect("Client should connect");
    assert!(wait_for_count(&server, 1).await);

    assert!(shutdown.close_quietly().await.is_empty());

    assert_eq!(server.connection_count().await, 0);
    assert!(TcpStream::connect(addr).await.is_err());
}
