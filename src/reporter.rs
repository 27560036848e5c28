use std::fmt;
use std::sync::{Arc, Mutex as StdMutex};

use tracing::{error, warn};

use crate::errors::FixtureError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The reporting task stopped on this failure.
    Fatal,
    /// Reported and carried on.
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    pub kind: FailureKind,
    pub message: String,
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            FailureKind::Fatal => write!(f, "[fatal] {}", self.message),
            FailureKind::Error => write!(f, "[error] {}", self.message),
        }
    }
}

/// Collects failures raised by the fixture's background tasks.
///
/// A spawned task cannot abort the test that owns it, so handshake and read
/// errors are recorded here and surfaced on the test thread when the server
/// is shut down. Clones share the same failure log.
#[derive(Clone, Default)]
pub struct TestReporter {
    failures: Arc<StdMutex<Vec<Failure>>>,
}

impl TestReporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a failure after which the caller must stop.
    pub fn fatal(&self, err: &FixtureError) {
        error!("EventWebsocketServer fatal: {}", err);
        self.record(FailureKind::Fatal, err);
    }

    /// Records a failure the caller continues past.
    pub fn error(&self, err: &FixtureError) {
        warn!("EventWebsocketServer error: {}", err);
        self.record(FailureKind::Error, err);
    }

    pub fn failures(&self) -> Vec<Failure> {
        self.lock().clone()
    }

    pub fn has_fatal(&self) -> bool {
        self.lock().iter().any(|f| f.kind == FailureKind::Fatal)
    }

    pub fn is_clean(&self) -> bool {
        self.lock().is_empty()
    }

    /// Panics with every recorded failure, unless the log is empty or the
    /// current thread is already unwinding.
    pub fn assert_clean(&self) {
        let failures = self.failures();
        if failures.is_empty() || std::thread::panicking() {
            return;
        }

        let listing = failures
            .iter()
            .map(|f| format!("  {}", f))
            .collect::<Vec<_>>()
            .join("\n");
        panic!(
            "EventWebsocketServer recorded {} failure(s):\n{}",
            failures.len(),
            listing
        );
    }

    fn record(&self, kind: FailureKind, err: &FixtureError) {
        self.lock().push(Failure {
            kind,
            message: err.to_string(),
        });
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Failure>> {
        // A panicking test thread must not hide failures from its siblings.
        self.failures.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
