pub mod http_client;
pub mod permission_authority;
pub mod rate_limit_store;
