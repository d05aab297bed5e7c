//! Token-bucket rate limiting.
//!
//! Each limited resource (the completion endpoint, optionally each tool)
//! has a bucket keyed by name. Buckets refill lazily from elapsed time on
//! every admission check, so no background timer is needed. Bucket state
//! lives in a [`BucketStore`]; the in-process store is a locked map, and a
//! shared external store can be plugged in through the same trait.

pub mod bucket;
pub mod clock;
pub mod store;

pub use bucket::{Admission, BucketConfig, RateLimitState};
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use store::{BucketStore, InMemoryBucketStore};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Clone, Error)]
pub enum RateLimitError {
    #[error("Rate limit exceeded for '{key}', retry after {}ms", .retry_after.as_millis())]
    Exceeded { key: String, retry_after: Duration },

    #[error("Rate limit store failure: {0}")]
    Store(String),
}

/// What to do when admission is denied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenialPolicy {
    /// Return `RateLimitError::Exceeded` immediately.
    FailFast,
    /// Sleep until a token is available, giving up once the total wait
    /// would pass `max_wait`.
    Wait { max_wait: Duration },
}

/// A keyed token-bucket limiter shared by every conversation.
pub struct RateLimiter {
    default_bucket: BucketConfig,
    buckets: HashMap<String, BucketConfig>,
    store: Arc<dyn BucketStore>,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    /// A limiter applying `default_bucket` to every key, backed by an
    /// in-process store and the runtime's monotonic clock.
    pub fn new(default_bucket: BucketConfig) -> Self {
        Self {
            default_bucket,
            buckets: HashMap::new(),
            store: Arc::new(InMemoryBucketStore::new()),
            clock: Arc::new(MonotonicClock::new()),
        }
    }

    /// Use a dedicated bucket configuration for `key`.
    pub fn with_bucket(mut self, key: impl Into<String>, config: BucketConfig) -> Self {
        self.buckets.insert(key.into(), config);
        self
    }

    pub fn with_store(mut self, store: Arc<dyn BucketStore>) -> Self {
        self.store = store;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config_for(&self, key: &str) -> BucketConfig {
        self.buckets.get(key).copied().unwrap_or(self.default_bucket)
    }

    /// One admission check. Never blocks beyond the store update.
    pub async fn try_acquire(&self, key: &str, cost: u32) -> Result<Admission, RateLimitError> {
        let config = self.config_for(key);
        let now = self.clock.now();
        let cost = f64::from(cost);
        let admission = self
            .store
            .update(key, &|current: Option<RateLimitState>| {
                let mut state = current.unwrap_or_else(|| RateLimitState::full(&config, now));
                let admission = state.try_take(&config, now, cost);
                (state, admission)
            })
            .await?;

        match &admission {
            Admission::Admitted { remaining } => {
                debug!(key, remaining = *remaining, "Rate limit admitted");
            }
            Admission::Denied { retry_after } => {
                debug!(key, retry_after_ms = retry_after.as_millis() as u64, "Rate limit denied");
            }
        }
        Ok(admission)
    }

    /// Admission under a caller-chosen denial policy.
    pub async fn acquire(&self, key: &str, cost: u32, policy: DenialPolicy) -> Result<(), RateLimitError> {
        let mut waited = Duration::ZERO;
        loop {
            match self.try_acquire(key, cost).await? {
                Admission::Admitted { .. } => return Ok(()),
                Admission::Denied { retry_after } => match policy {
                    DenialPolicy::FailFast => {
                        return Err(RateLimitError::Exceeded {
                            key: key.to_string(),
                            retry_after,
                        });
                    }
                    DenialPolicy::Wait { max_wait } => {
                        if waited + retry_after > max_wait {
                            warn!(
                                key,
                                waited_ms = waited.as_millis() as u64,
                                retry_after_ms = retry_after.as_millis() as u64,
                                "Rate limit wait deadline would be exceeded"
                            );
                            return Err(RateLimitError::Exceeded {
                                key: key.to_string(),
                                retry_after,
                            });
                        }
                        tokio::time::sleep(retry_after).await;
                        waited += retry_after;
                    }
                },
            }
        }
    }

    /// Time until the bucket for `key` is full again.
    pub async fn reset_time(&self, key: &str) -> Result<Duration, RateLimitError> {
        let config = self.config_for(key);
        let now = self.clock.now();
        let state = self.store.get(key).await?;
        Ok(state.map_or(Duration::ZERO, |s| s.time_until_full(&config, now)))
    }
}
