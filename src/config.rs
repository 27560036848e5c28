use std::net::{Ipv4Addr, SocketAddr};

/// Payloads buffered before new ones are dropped.
pub const DEFAULT_RECEIVED_CAPACITY: usize = 100;

/// Configuration for an event websocket server instance
#[derive(Debug, Clone, PartialEq)]
pub struct FixtureConfig {
    pub bind_addr: SocketAddr,    // Port 0 picks an ephemeral port
    pub received_capacity: usize, // Bounded queue of client payloads
}

impl Default for FixtureConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, 0)),
            received_capacity: DEFAULT_RECEIVED_CAPACITY,
        }
    }
}

impl FixtureConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> FixtureConfig {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds a configuration from `lookup`, keeping the default for every
    /// variable that is missing or invalid.
    pub fn from_lookup<F>(lookup: F) -> FixtureConfig
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = FixtureConfig::default();

        if let Some(raw) = lookup("EVENT_WS_BIND_ADDR") {
            match raw.trim().parse::<SocketAddr>() {
                Ok(addr) => config.bind_addr = addr,
                Err(e) => {
                    tracing::warn!(
                        "Failed to parse EVENT_WS_BIND_ADDR '{}': {}, using default: {}",
                        raw,
                        e,
                        config.bind_addr
                    );
                }
            }
        }

        if let Some(raw) = lookup("EVENT_WS_RECEIVED_CAPACITY") {
            config.received_capacity =
                parse_capacity("EVENT_WS_RECEIVED_CAPACITY", &raw, config.received_capacity);
        }

        config
    }

    pub fn with_bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    pub fn with_received_capacity(mut self, capacity: usize) -> Self {
        self.received_capacity = capacity.max(1);
        self
    }
}

fn parse_capacity(name: &str, raw: &str, default: usize) -> usize {
    match raw.trim().parse::<usize>() {
        Ok(value) if value >= 1 => value,
        Ok(value) => {
            tracing::warn!(
                "Invalid {} value: {} (must be at least 1), using default: {}",
                name,
                value,
                default
            );
            default
        }
        Err(e) => {
            tracing::warn!(
                "Failed to parse {} '{}': {}, using default: {}",
                name,
                raw,
                e,
                default
            );
            default
        }
    }
}
