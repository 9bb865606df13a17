use async_trait::async_trait;
use axum::body::Body as AxumBody;
use hyper::{Request, Response};
use thiserror::Error;

/// Custom error type for upstream HTTP calls
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum HttpClientError {
    /// Error when the connection to the backend fails
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// Error when the backend does not answer in time
    #[error("Timeout error after {0} seconds")]
    Timeout(u64),

    /// Error when the outgoing request cannot be built
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

/// Result type alias for HTTP client operations
pub type HttpClientResult<T> = Result<T, HttpClientError>;

/// HttpClient defines the port (interface) for forwarding requests to backend
/// services.
///
/// Any response the backend produces, including 4xx and 5xx, is `Ok`; only
/// transport failures are errors.
#[async_trait]
pub trait HttpClient: Send + Sync + 'static {
    /// Send an already-rewritten request (absolute URI) to a backend
    async fn send_request(&self, req: Request<AxumBody>) -> HttpClientResult<Response<AxumBody>>;
}
