//! Router-level middleware.
//!
//! [`request_id_middleware`] establishes the trace id for every inbound
//! request (reusing a sane client-supplied `X-Request-ID`, generating a UUID
//! otherwise), runs the rest of the stack inside the request span and echoes
//! the id on the response.
use std::time::Instant;

use axum::{
    extract::Request,
    http::{HeaderMap, HeaderValue},
    middleware::Next,
    response::Response,
};
use tracing::Instrument;

use crate::{core::proxy::X_REQUEST_ID, tracing_setup::create_request_span};

/// Longest inbound request id that is reused as-is.
pub const MAX_REQUEST_ID_LEN: usize = 128;

/// Trace id of the current request, stored in request extensions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceId(pub String);

impl TraceId {
    pub fn generate() -> Self {
        TraceId(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// The inbound `X-Request-ID` when it is non-empty, at most
/// [`MAX_REQUEST_ID_LEN`] bytes and visible ASCII only.
pub fn inbound_trace_id(headers: &HeaderMap) -> Option<TraceId> {
    let value = headers.get(X_REQUEST_ID)?.to_str().ok()?.trim();
    let acceptable = !value.is_empty()
        && value.len() <= MAX_REQUEST_ID_LEN
        && value.bytes().all(|b| b.is_ascii_graphic());
    acceptable.then(|| TraceId(value.to_string()))
}

pub async fn request_id_middleware(mut req: Request, next: Next) -> Response {
    let trace_id = inbound_trace_id(req.headers()).unwrap_or_else(TraceId::generate);
    let start = Instant::now();

    let span = create_request_span(req.method().as_str(), req.uri().path(), trace_id.as_str());
    if let Ok(value) = HeaderValue::from_str(trace_id.as_str()) {
        req.headers_mut().insert(X_REQUEST_ID, value);
    }
    req.extensions_mut().insert(trace_id.clone());

    let mut response = next.run(req).instrument(span.clone()).await;

    let elapsed = start.elapsed();
    span.record("http.status_code", response.status().as_u16());
    span.record("duration_ms", elapsed.as_millis() as u64);
    span.in_scope(|| {
        tracing::info!(status = response.status().as_u16(), ?elapsed, "Request completed");
    });

    if let Ok(value) = HeaderValue::from_str(trace_id.as_str()) {
        response.headers_mut().insert(X_REQUEST_ID, value);
    }
    response
}
