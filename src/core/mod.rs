pub mod auth;
pub mod dispatcher;
pub mod error;
pub mod identity;
pub mod proxy;
pub mod rate_limiter;

pub use auth::{AuthError, AuthGuard};
pub use dispatcher::{Dispatcher, Resolution};
pub use error::GatewayError;
pub use identity::{Identity, IdentityVerifier};
pub use proxy::ProxyContext;
pub use rate_limiter::{RateLimitDecision, RateLimiter};
