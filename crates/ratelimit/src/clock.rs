//! Time sources for bucket refill.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Elapsed time since an arbitrary, fixed epoch.
pub trait Clock: Send + Sync {
    fn now(&self) -> Duration;
}

/// The runtime's monotonic clock. Follows tokio's paused time in tests.
pub struct MonotonicClock {
    epoch: tokio::time::Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            epoch: tokio::time::Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> Duration {
        self.epoch.elapsed()
    }
}

/// A clock that only moves when told to.
#[derive(Default)]
pub struct ManualClock {
    millis: AtomicU64,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, by: Duration) {
        self.millis.fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        Duration::from_millis(self.millis.load(Ordering::SeqCst))
    }
}
