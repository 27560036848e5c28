//! Test logging setup.

use once_cell::sync::OnceCell;
use tracing_subscriber::{fmt, EnvFilter};

static INITIALIZED: OnceCell<()> = OnceCell::new();

/// Installs a `tracing` subscriber for tests.
///
/// Safe to call from every test. The filter comes from `TEST_LOG`, then
/// `RUST_LOG`, then falls back to `"warn"`. Output goes through the test
/// writer so cargo captures it per test.
pub fn init_test_logging() {
    INITIALIZED.get_or_init(|| {
        let filter = std::env::var("TEST_LOG")
            .or_else(|_| std::env::var("RUST_LOG"))
            .map(EnvFilter::new)
            .unwrap_or_else(|_| EnvFilter::new("warn"));

        fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .without_time()
            .try_init()
            .ok();
    });
}
