use async_trait::async_trait;
use thiserror::Error;

/// Error type for rate-limit counter stores
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum RateLimitStoreError {
    /// The store could not be reached or refused the operation
    #[error("Rate limit store unavailable: {0}")]
    Unavailable(String),
}

/// Result type alias for rate-limit store operations
pub type RateLimitStoreResult<T> = Result<T, RateLimitStoreError>;

/// Counter state of one key after a hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowState {
    /// Requests counted in the current window, including this one
    pub count: u64,
    /// Epoch milliseconds at which the current window opened
    pub window_start_ms: u64,
}

/// RateLimitStore defines the port (interface) for fixed-window counters.
///
/// `hit` must be atomic per key: if the key is absent or its window has
/// elapsed, a fresh window is opened with `count = 1`; otherwise the count is
/// incremented. The in-memory adapter is process-local; a shared store
/// (atomic counters with expiry) can be swapped in behind this trait to get
/// limits that hold across gateway instances.
#[async_trait]
pub trait RateLimitStore: Send + Sync + 'static {
    /// Count one request for `key` at `now_ms` in a window of `window_ms`
    async fn hit(
        &self,
        key: &str,
        window_ms: u64,
        max: u64,
        now_ms: u64,
    ) -> RateLimitStoreResult<WindowState>;

    /// Evict every bucket whose window has elapsed at `now_ms`; returns the
    /// number of evicted buckets
    async fn sweep(&self, now_ms: u64) -> usize;

    /// Number of live buckets
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
