//! Process-local fixed-window counter table.
//!
//! Buckets live in an `scc::HashMap`; each `hit` runs under the per-entry lock
//! so concurrent requests sharing a key never lose an increment. Limits are
//! local to this process: several gateway instances each enforce their own.
use async_trait::async_trait;
use scc::{HashMap, hash_map::Entry};

use crate::ports::rate_limit_store::{RateLimitStore, RateLimitStoreResult, WindowState};

/// One key's counter. Created lazily on first hit, evicted by the sweep once
/// its window has elapsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitBucket {
    pub count: u64,
    pub window_start_ms: u64,
    pub window_ms: u64,
    pub max: u64,
}

impl RateLimitBucket {
    fn fresh(now_ms: u64, window_ms: u64, max: u64) -> Self {
        Self {
            count: 1,
            window_start_ms: now_ms,
            window_ms,
            max,
        }
    }

    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms >= self.window_start_ms.saturating_add(self.window_ms)
    }

    fn state(&self) -> WindowState {
        WindowState {
            count: self.count,
            window_start_ms: self.window_start_ms,
        }
    }
}

#[derive(Default)]
pub struct MemoryRateLimitStore {
    buckets: HashMap<String, RateLimitBucket>,
}

impl MemoryRateLimitStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot a bucket (diagnostics and tests).
    pub async fn bucket(&self, key: &str) -> Option<RateLimitBucket> {
        self.buckets
            .get_async(key)
            .await
            .map(|entry| *entry.get())
    }
}

#[async_trait]
impl RateLimitStore for MemoryRateLimitStore {
    async fn hit(
        &self,
        key: &str,
        window_ms: u64,
        max: u64,
        now_ms: u64,
    ) -> RateLimitStoreResult<WindowState> {
        match self.buckets.entry_async(key.to_string()).await {
            Entry::Occupied(mut occupied) => {
                let bucket = occupied.get_mut();
                if bucket.is_expired(now_ms) {
                    *bucket = RateLimitBucket::fresh(now_ms, window_ms, max);
                } else {
                    bucket.count = bucket.count.saturating_add(1);
                }
                Ok(bucket.state())
            }
            Entry::Vacant(vacant) => {
                let bucket = RateLimitBucket::fresh(now_ms, window_ms, max);
                vacant.insert_entry(bucket);
                Ok(bucket.state())
            }
        }
    }

    async fn sweep(&self, now_ms: u64) -> usize {
        let before = self.buckets.len();
        self.buckets
            .retain_async(|_, bucket| !bucket.is_expired(now_ms))
            .await;
        before.saturating_sub(self.buckets.len())
    }

    fn len(&self) -> usize {
        self.buckets.len()
    }
}
