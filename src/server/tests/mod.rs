// Tests for the event websocket server, driven by real tungstenite clients

mod support;
