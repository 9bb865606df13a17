//! Realty Gateway - the edge gateway of the realty marketplace.
//!
//! Every client request enters through this crate. It establishes who the
//! caller is from a bearer credential, applies the route's access policy,
//! throttles abusive traffic and forwards the request to the backend service
//! that owns the path, with the verified identity attached as trusted headers.
//!
//! # Features
//! - Declarative route table (method + path pattern → service, rewrite, access
//!   policy, limiter class) with deterministic precedence
//! - Administrative namespace resolved by domain segment
//! - HS256 bearer credential verification with issuer / audience checks
//! - Access policies: public, optional, required, role, remote permission and
//!   shared internal credential
//! - Fixed-window rate limiting (default, login and webhook classes) with
//!   `X-RateLimit-*` headers and periodic bucket sweeping
//! - Streaming reverse proxy with hop-by-hop stripping and `X-Forwarded-*`
//! - Uniform JSON error envelope carrying the request trace id
//! - Prometheus metrics & structured tracing via `tracing`
//! - Graceful shutdown with a bounded drain window
//!
//! # Quick Example
//! ```no_run
//! use std::{sync::Arc, time::Duration};
//!
//! use realty_gateway::{
//!     HttpClientAdapter, HttpHandler, MemoryRateLimitStore, PermissionClient, RateLimiter,
//!     build_router,
//! };
//!
//! # #[tokio::main] async fn main() -> eyre::Result<()> {
//! let cfg = Arc::new(realty_gateway::config::load_config("config.toml").await?);
//! let limiter = Arc::new(RateLimiter::new(
//!     Arc::new(MemoryRateLimitStore::new()),
//!     cfg.rate_limits.clone(),
//! ));
//! let handler = Arc::new(HttpHandler::new(
//!     cfg.clone(),
//!     Arc::new(HttpClientAdapter::new(Duration::from_secs(30))?),
//!     Arc::new(PermissionClient::new(&cfg.authority)?),
//!     limiter,
//! ));
//! handler.mark_ready();
//! let app = build_router(handler);
//! # let _ = app;
//! # Ok(()) }
//! ```
//!
//! # Architecture
//! The crate separates **ports** (traits) from **adapters** (implementations) while keeping
//! the request semantics (dispatch, identity, policy, limiting, forwarding) inside `core`.
//!
//! # Error Handling
//! Startup and configuration return `eyre::Result<T>` with `WrapErr` context. Request-path
//! failures are closed `thiserror` enums that render the JSON error envelope.
//!
//! # Concurrency & Data Structures
//! Rate-limit buckets live in an `scc::HashMap`; each key is updated under its own entry
//! lock, so concurrent requests never lose an increment.
pub mod config;
pub mod metrics;
pub mod ports;
pub mod tracing_setup;
pub mod utils;

pub mod adapters;
pub mod core;

// Re-export the specific types needed by the binary crate
pub use crate::{
    adapters::{
        HttpClientAdapter, HttpHandler, MemoryRateLimitStore, PermissionClient, build_router,
    },
    core::{Dispatcher, GatewayError, RateLimiter},
    ports::http_client::HttpClient,
    utils::GracefulShutdown,
};
