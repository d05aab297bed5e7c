//! Bucket state storage.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

use crate::RateLimitError;
use crate::bucket::{Admission, RateLimitState};

/// The closure a store applies atomically to one key's state.
pub type BucketUpdate<'a> =
    &'a (dyn Fn(Option<RateLimitState>) -> (RateLimitState, Admission) + Send + Sync);

/// Where bucket state lives.
///
/// `update` must be an atomic compare-and-update: the closure sees the
/// current state and its result replaces it with no interleaving writer.
/// A shared store may run the closure more than once when its
/// compare-and-swap loses a race, so the closure is pure.
#[async_trait]
pub trait BucketStore: Send + Sync {
    async fn update(&self, key: &str, apply: BucketUpdate<'_>) -> Result<Admission, RateLimitError>;

    async fn get(&self, key: &str) -> Result<Option<RateLimitState>, RateLimitError>;
}

/// In-process store: one lock over all buckets.
#[derive(Default)]
pub struct InMemoryBucketStore {
    buckets: Mutex<HashMap<String, RateLimitState>>,
}

impl InMemoryBucketStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.buckets.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl BucketStore for InMemoryBucketStore {
    async fn update(&self, key: &str, apply: BucketUpdate<'_>) -> Result<Admission, RateLimitError> {
        let mut buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());
        let (state, admission) = apply(buckets.get(key).copied());
        buckets.insert(key.to_string(), state);
        Ok(admission)
    }

    async fn get(&self, key: &str) -> Result<Option<RateLimitState>, RateLimitError> {
        let buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());
        Ok(buckets.get(key).copied())
    }
}
