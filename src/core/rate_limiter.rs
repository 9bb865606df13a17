//! Fixed-window rate limiting.
//!
//! [`RateLimiter`] counts requests per key in fixed windows through a
//! [`RateLimitStore`] and turns the resulting count into a
//! [`RateLimitDecision`]. Three policies exist, one per
//! [`RateLimitClass`]: the default limiter sees every proxied request, the
//! auth and webhook limiters additionally guard the routes tagged with them.
//!
//! The limiter fails open: a store error admits the request without
//! rate-limit headers. The permission authority fails closed; the two
//! policies differ on purpose.
use std::{
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use http::{HeaderMap, HeaderName, HeaderValue, header::RETRY_AFTER};
use serde_json::Value;
use tokio::task::JoinHandle;

use crate::{
    config::{RateLimitClass, RateLimitPolicyConfig, RateLimitsConfig},
    metrics,
    ports::rate_limit_store::RateLimitStore,
    utils::graceful_shutdown::ShutdownToken,
};

pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// JSON body fields that identify the caller on login-type endpoints, in
/// lookup order.
const LOGIN_IDENTIFIER_FIELDS: [&str; 3] = ["email", "phone", "identifier"];

/// Outcome of one `admit` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitDecision {
    Allowed {
        limit: u64,
        remaining: u64,
        /// Window end, epoch seconds.
        reset_at_secs: u64,
    },
    Denied {
        limit: u64,
        reset_at_secs: u64,
        retry_after_secs: u64,
    },
    /// The store failed; the request is admitted and carries no headers.
    Unavailable,
}

impl RateLimitDecision {
    pub fn is_denied(&self) -> bool {
        matches!(self, RateLimitDecision::Denied { .. })
    }

    /// Write `X-RateLimit-*` (and `Retry-After` on denial) into `headers`.
    pub fn apply_headers(&self, headers: &mut HeaderMap) {
        match *self {
            RateLimitDecision::Allowed {
                limit,
                remaining,
                reset_at_secs,
            } => {
                headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(limit));
                headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(remaining));
                headers.insert(X_RATELIMIT_RESET, HeaderValue::from(reset_at_secs));
            }
            RateLimitDecision::Denied {
                limit,
                reset_at_secs,
                retry_after_secs,
            } => {
                headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(limit));
                headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(0u64));
                headers.insert(X_RATELIMIT_RESET, HeaderValue::from(reset_at_secs));
                headers.insert(RETRY_AFTER, HeaderValue::from(retry_after_secs));
            }
            RateLimitDecision::Unavailable => {}
        }
    }
}

pub struct RateLimiter {
    store: Arc<dyn RateLimitStore>,
    policies: RateLimitsConfig,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn RateLimitStore>, policies: RateLimitsConfig) -> Self {
        Self { store, policies }
    }

    pub fn policy(&self, class: RateLimitClass) -> RateLimitPolicyConfig {
        match class {
            RateLimitClass::Default => self.policies.default,
            RateLimitClass::Auth => self.policies.auth,
            RateLimitClass::Webhook => self.policies.webhook,
        }
    }

    /// Count one request for `subject` under the policy of `class`. Keys are
    /// namespaced per class so limiters never share buckets.
    pub async fn admit_class(&self, class: RateLimitClass, subject: &str) -> RateLimitDecision {
        let key = format!("{}:{}", class.as_str(), subject);
        let decision = self.admit(&key, self.policy(class)).await;
        match decision {
            RateLimitDecision::Denied { .. } => {
                metrics::increment_rate_limit_denied(class.as_str());
                tracing::warn!(limiter = class.as_str(), key = %key, "Rate limit exceeded");
            }
            RateLimitDecision::Unavailable => {
                metrics::increment_rate_limit_store_error(class.as_str());
            }
            RateLimitDecision::Allowed { .. } => {}
        }
        decision
    }

    pub async fn admit(&self, key: &str, policy: RateLimitPolicyConfig) -> RateLimitDecision {
        self.admit_at(key, policy, now_ms()).await
    }

    /// `admit` against an explicit clock reading, epoch milliseconds.
    pub async fn admit_at(
        &self,
        key: &str,
        policy: RateLimitPolicyConfig,
        now_ms: u64,
    ) -> RateLimitDecision {
        let state = match self
            .store
            .hit(key, policy.window_ms, policy.max, now_ms)
            .await
        {
            Ok(state) => state,
            Err(e) => {
                tracing::error!(key = %key, error = %e, "Rate limit store failed, admitting request");
                return RateLimitDecision::Unavailable;
            }
        };

        let reset_at_ms = state.window_start_ms.saturating_add(policy.window_ms);
        let reset_at_secs = reset_at_ms.div_ceil(1000);

        if state.count > policy.max {
            let retry_after_secs = reset_at_ms.saturating_sub(now_ms).div_ceil(1000).max(1);
            RateLimitDecision::Denied {
                limit: policy.max,
                reset_at_secs,
                retry_after_secs,
            }
        } else {
            RateLimitDecision::Allowed {
                limit: policy.max,
                remaining: policy.max.saturating_sub(state.count),
                reset_at_secs,
            }
        }
    }

    /// Evict elapsed buckets; returns how many were removed.
    pub async fn sweep(&self) -> usize {
        self.sweep_at(now_ms()).await
    }

    pub async fn sweep_at(&self, now_ms: u64) -> usize {
        let evicted = self.store.sweep(now_ms).await;
        let live = self.store.len();
        metrics::set_rate_limit_buckets(live);
        if evicted > 0 {
            tracing::debug!(evicted, live, "Swept expired rate limit buckets");
        }
        evicted
    }

    pub fn active_buckets(&self) -> usize {
        self.store.len()
    }

    /// Run the periodic sweep until `shutdown` fires.
    pub fn spawn_sweeper(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown: ShutdownToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.sweep().await;
                    }
                    reason = shutdown.wait_for_shutdown() => {
                        tracing::info!("Rate limit sweeper stopping: {:?}", reason);
                        break;
                    }
                }
            }
        })
    }
}

/// Pull the login identifier out of a JSON request body. Non-JSON bodies,
/// non-object payloads and empty or non-string values yield `None`.
pub fn login_identifier(body: &[u8]) -> Option<String> {
    let value: Value = serde_json::from_slice(body).ok()?;
    let object = value.as_object()?;
    LOGIN_IDENTIFIER_FIELDS.iter().find_map(|field| {
        object
            .get(*field)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(str::to_ascii_lowercase)
    })
}

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
