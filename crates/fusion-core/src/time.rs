//! Injectable clock. The activation loop, the asset notifier's 2-second
//! NFS-visibility delay, and provider request timeouts all go through a
//! `Clock` rather than calling `Instant::now()`/`SystemTime::now()`
//! directly, so recovery and scheduling tests can drive time without
//! real sleeps.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Abstracts "what time is it" and "wait until then" so production code can
/// use the real clock and tests can use a deterministic one.
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> Instant;
}

/// Wall-clock implementation backed by `std::time::Instant`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// A clock whose value only advances when told to. Used by tests of the
/// notifier's minimum-delay rule and of provider-timeout abandonment.
#[derive(Clone)]
pub struct MockClock {
    inner: Arc<Mutex<Instant>>,
}

impl MockClock {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Instant::now())),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut guard = self.inner.lock().expect("mock clock mutex poisoned");
        *guard += by;
    }
}

impl Default for MockClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MockClock {
    fn now(&self) -> Instant {
        *self.inner.lock().expect("mock clock mutex poisoned")
    }
}
