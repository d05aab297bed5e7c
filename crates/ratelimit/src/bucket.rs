//! Bucket configuration, state and the refill arithmetic.

use serde::{Deserialize, Serialize};
use std::time::Duration;

// Absorbs float error in refill sums like (1/60) * 60.
const EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BucketConfig {
    pub capacity: u32,
    pub refill_per_sec: f64,
}

impl BucketConfig {
    pub fn new(capacity: u32, refill_per_sec: f64) -> Self {
        Self {
            capacity,
            refill_per_sec,
        }
    }

    /// `limit` admissions per `window`, refilled continuously.
    pub fn per_window(limit: u32, window: Duration) -> Self {
        let secs = window.as_secs_f64().max(f64::MIN_POSITIVE);
        Self::new(limit, f64::from(limit) / secs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Admission {
    Admitted { remaining: f64 },
    Denied { retry_after: Duration },
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Admission::Admitted { .. })
    }
}

/// Per-key bucket state.
///
/// `window_start` is the clock reading of the last refill, in
/// milliseconds since the clock's epoch.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RateLimitState {
    pub tokens_remaining: f64,
    pub window_start: u64,
    pub capacity: u32,
    pub refill_rate: f64,
}

impl RateLimitState {
    pub fn full(config: &BucketConfig, now: Duration) -> Self {
        Self {
            tokens_remaining: f64::from(config.capacity),
            window_start: now.as_millis() as u64,
            capacity: config.capacity,
            refill_rate: config.refill_per_sec,
        }
    }

    /// Add the tokens earned since the last refill.
    fn refill(&mut self, config: &BucketConfig, now: Duration) {
        let now_ms = now.as_millis() as u64;
        let elapsed_secs = now_ms.saturating_sub(self.window_start) as f64 / 1000.0;
        self.capacity = config.capacity;
        self.refill_rate = config.refill_per_sec;
        self.tokens_remaining =
            (self.tokens_remaining + elapsed_secs * config.refill_per_sec).min(f64::from(config.capacity));
        self.window_start = self.window_start.max(now_ms);
    }

    /// Refill, then take `cost` tokens if available.
    pub fn try_take(&mut self, config: &BucketConfig, now: Duration, cost: f64) -> Admission {
        self.refill(config, now);

        if cost > f64::from(config.capacity) {
            return Admission::Denied {
                retry_after: secs_to_duration(f64::from(config.capacity), config.refill_per_sec),
            };
        }

        if self.tokens_remaining + EPSILON >= cost {
            self.tokens_remaining = (self.tokens_remaining - cost).max(0.0);
            Admission::Admitted {
                remaining: self.tokens_remaining,
            }
        } else {
            let deficit = cost - self.tokens_remaining;
            Admission::Denied {
                retry_after: secs_to_duration(deficit, config.refill_per_sec),
            }
        }
    }

    pub fn time_until_full(&self, config: &BucketConfig, now: Duration) -> Duration {
        let mut projected = *self;
        projected.refill(config, now);
        let missing = f64::from(config.capacity) - projected.tokens_remaining;
        if missing <= EPSILON {
            Duration::ZERO
        } else {
            secs_to_duration(missing, config.refill_per_sec)
        }
    }
}

fn secs_to_duration(tokens: f64, rate: f64) -> Duration {
    if rate <= 0.0 {
        return Duration::MAX;
    }
    Duration::from_secs_f64(tokens / rate)
}
