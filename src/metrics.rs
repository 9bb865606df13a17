//! Metrics helpers for the gateway.
//!
//! Thin wrappers over the `metrics` crate macros plus an RAII timer. The
//! binary installs a Prometheus recorder at startup and `GET /metrics`
//! renders its handle; without a recorder every call here is a no-op.
//!
//! Provided metrics (labels vary by family):
//! * `gateway_requests_total` (counter: route, method, status)
//! * `gateway_request_duration_seconds` (histogram: route, method)
//! * `gateway_upstream_requests_total` (counter: service, status)
//! * `gateway_upstream_request_duration_seconds` (histogram: service)
//! * `gateway_rate_limit_denied_total` (counter: limiter)
//! * `gateway_rate_limit_store_errors_total` (counter: limiter)
//! * `gateway_rate_limit_buckets` (gauge)
//! * `gateway_auth_failures_total` (counter: code)
//! * `gateway_permission_checks_total` (counter: outcome)
use std::time::{Duration, Instant};

use eyre::{Result, WrapErr};
use metrics::{
    Unit, counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram,
};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::Lazy;
use tokio::task::JoinHandle;

use crate::utils::graceful_shutdown::ShutdownToken;

pub const GATEWAY_REQUESTS_TOTAL: &str = "gateway_requests_total";
pub const GATEWAY_REQUEST_DURATION_SECONDS: &str = "gateway_request_duration_seconds";
pub const GATEWAY_UPSTREAM_REQUESTS_TOTAL: &str = "gateway_upstream_requests_total";
pub const GATEWAY_UPSTREAM_REQUEST_DURATION_SECONDS: &str =
    "gateway_upstream_request_duration_seconds";
pub const GATEWAY_RATE_LIMIT_DENIED_TOTAL: &str = "gateway_rate_limit_denied_total";
pub const GATEWAY_RATE_LIMIT_STORE_ERRORS_TOTAL: &str = "gateway_rate_limit_store_errors_total";
pub const GATEWAY_RATE_LIMIT_BUCKETS: &str = "gateway_rate_limit_buckets";
pub const GATEWAY_AUTH_FAILURES_TOTAL: &str = "gateway_auth_failures_total";
pub const GATEWAY_PERMISSION_CHECKS_TOTAL: &str = "gateway_permission_checks_total";

static DESCRIBED: Lazy<()> = Lazy::new(|| {
    describe_counter!(
        GATEWAY_REQUESTS_TOTAL,
        Unit::Count,
        "Total number of HTTP requests processed by the gateway."
    );
    describe_histogram!(
        GATEWAY_REQUEST_DURATION_SECONDS,
        Unit::Seconds,
        "Latency of HTTP requests processed by the gateway."
    );
    describe_counter!(
        GATEWAY_UPSTREAM_REQUESTS_TOTAL,
        Unit::Count,
        "Total number of requests forwarded to backend services."
    );
    describe_histogram!(
        GATEWAY_UPSTREAM_REQUEST_DURATION_SECONDS,
        Unit::Seconds,
        "Latency of requests forwarded to backend services."
    );
    describe_counter!(
        GATEWAY_RATE_LIMIT_DENIED_TOTAL,
        Unit::Count,
        "Requests rejected with 429, by limiter."
    );
    describe_counter!(
        GATEWAY_RATE_LIMIT_STORE_ERRORS_TOTAL,
        Unit::Count,
        "Limiter store failures (request admitted)."
    );
    describe_gauge!(
        GATEWAY_RATE_LIMIT_BUCKETS,
        "Live rate-limit buckets after the last sweep."
    );
    describe_counter!(
        GATEWAY_AUTH_FAILURES_TOTAL,
        Unit::Count,
        "Authentication and authorization rejections, by error code."
    );
    describe_counter!(
        GATEWAY_PERMISSION_CHECKS_TOTAL,
        Unit::Count,
        "Calls to the permission authority, by outcome."
    );
});

/// Register metric descriptions (idempotent).
pub fn init_metrics() {
    Lazy::force(&DESCRIBED);
}

/// Install the global Prometheus recorder and return the handle used to
/// render `GET /metrics`. Fails if another recorder is already installed.
pub fn install_prometheus_recorder() -> Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .wrap_err("Failed to install Prometheus metrics recorder")?;
    init_metrics();
    Ok(handle)
}

/// Periodically drain histogram buffers held by the recorder. Without it,
/// histogram samples accumulate between scrapes.
pub fn spawn_upkeep(
    handle: PrometheusHandle,
    interval: Duration,
    mut shutdown: ShutdownToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => handle.run_upkeep(),
                reason = shutdown.wait_for_shutdown() => {
                    tracing::debug!("Metrics upkeep stopping: {:?}", reason);
                    break;
                }
            }
        }
    })
}

pub fn increment_request_total(route: &str, method: &str, status: u16) {
    counter!(
        GATEWAY_REQUESTS_TOTAL,
        "route" => route.to_string(),
        "method" => method.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

pub fn record_request_duration(route: &str, method: &str, duration: Duration) {
    histogram!(
        GATEWAY_REQUEST_DURATION_SECONDS,
        "route" => route.to_string(),
        "method" => method.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Count a forwarded request. `status` is 0 when the backend never answered.
pub fn increment_upstream_request_total(service: &str, status: u16) {
    counter!(
        GATEWAY_UPSTREAM_REQUESTS_TOTAL,
        "service" => service.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

pub fn record_upstream_request_duration(service: &str, duration: Duration) {
    histogram!(
        GATEWAY_UPSTREAM_REQUEST_DURATION_SECONDS,
        "service" => service.to_string()
    )
    .record(duration.as_secs_f64());
}

pub fn increment_rate_limit_denied(limiter: &str) {
    counter!(GATEWAY_RATE_LIMIT_DENIED_TOTAL, "limiter" => limiter.to_string()).increment(1);
}

pub fn increment_rate_limit_store_error(limiter: &str) {
    counter!(GATEWAY_RATE_LIMIT_STORE_ERRORS_TOTAL, "limiter" => limiter.to_string())
        .increment(1);
}

pub fn set_rate_limit_buckets(count: usize) {
    gauge!(GATEWAY_RATE_LIMIT_BUCKETS).set(count as f64);
}

pub fn increment_auth_failure(code: &str) {
    counter!(GATEWAY_AUTH_FAILURES_TOTAL, "code" => code.to_string()).increment(1);
}

/// `outcome` is one of `allowed`, `denied` or `error`.
pub fn increment_permission_check(outcome: &str) {
    counter!(GATEWAY_PERMISSION_CHECKS_TOTAL, "outcome" => outcome.to_string()).increment(1);
}

/// RAII helper measuring an upstream call; records on drop so early returns
/// and errors are still timed.
pub struct UpstreamTimer {
    start: Instant,
    service: String,
}

impl UpstreamTimer {
    pub fn new(service: &str) -> Self {
        Self {
            start: Instant::now(),
            service: service.to_string(),
        }
    }
}

impl Drop for UpstreamTimer {
    fn drop(&mut self) {
        record_upstream_request_duration(&self.service, self.start.elapsed());
    }
}
