//! Event websocket test fixture
//!
//! A mock WebSocket server for tests that talk to an event-streaming backend.
//! It records what clients send, signals new connections and can disconnect
//! every client on demand without giving up its port.

pub mod config;
pub mod errors;
pub mod reporter;
pub mod server;
pub mod telemetry;

pub use config::FixtureConfig;
pub use errors::FixtureError;
pub use reporter::{Failure, FailureKind, TestReporter};
pub use server::{ConnectionId, ConnectionState, EventWebsocketServer, Shutdown};
