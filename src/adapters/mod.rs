pub mod http_client;
pub mod http_handler;
pub mod memory_rate_limit_store;
pub mod middleware;
pub mod permission_client;

/// Re-export commonly used types from adapters
pub use http_client::HttpClientAdapter;
pub use http_handler::{HttpHandler, build_router};
pub use memory_rate_limit_store::MemoryRateLimitStore;
pub use middleware::*;
pub use permission_client::PermissionClient;
