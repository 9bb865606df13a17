//! Gateway-originated failures and the uniform JSON error envelope.
//!
//! Every response the gateway produces on its own behalf (as opposed to a
//! relayed backend response) goes through [`GatewayError::into_response_with`]
//! so clients always see `{ "error": { "code", "message", "traceId" } }`.
use axum::{
    Json,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

use crate::core::auth::AuthError;

/// Closed taxonomy of failures handled at the edge.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum GatewayError {
    #[error("no credential presented")]
    NoCredential,
    #[error("credential expired")]
    TokenExpired,
    #[error("credential invalid")]
    TokenInvalid,
    #[error("account blocked")]
    AccountBlocked,
    #[error("role not permitted")]
    InsufficientRole,
    #[error("permission denied")]
    InsufficientPermission,
    #[error("internal credential missing or invalid")]
    InternalCredentialRequired,
    #[error("rate limit exceeded, retry after {retry_after_secs}s")]
    RateLimitExceeded { retry_after_secs: u64 },
    #[error("no route for {method} {path}")]
    RouteNotFound { method: String, path: String },
    #[error("upstream service '{service}' unavailable")]
    UpstreamUnavailable { service: String },
    #[error("request body exceeds {limit} bytes")]
    PayloadTooLarge { limit: usize },
    #[error("request body could not be read")]
    BadRequest,
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::NoCredential
            | GatewayError::TokenExpired
            | GatewayError::TokenInvalid
            | GatewayError::AccountBlocked
            | GatewayError::InternalCredentialRequired => StatusCode::UNAUTHORIZED,
            GatewayError::InsufficientRole | GatewayError::InsufficientPermission => {
                StatusCode::FORBIDDEN
            }
            GatewayError::RateLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::RouteNotFound { .. } => StatusCode::NOT_FOUND,
            GatewayError::UpstreamUnavailable { .. } => StatusCode::BAD_GATEWAY,
            GatewayError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            GatewayError::BadRequest => StatusCode::BAD_REQUEST,
        }
    }

    /// Stable machine-readable code placed in the envelope.
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::NoCredential | GatewayError::TokenInvalid => "TOKEN_INVALID",
            GatewayError::TokenExpired => "TOKEN_EXPIRED",
            GatewayError::AccountBlocked => "ACCOUNT_BLOCKED",
            GatewayError::InsufficientRole | GatewayError::InsufficientPermission => {
                "INSUFFICIENT_PERMISSIONS"
            }
            GatewayError::InternalCredentialRequired => "UNAUTHORIZED",
            GatewayError::RateLimitExceeded { .. } => "RATE_LIMIT_EXCEEDED",
            GatewayError::RouteNotFound { .. } => "NOT_FOUND",
            GatewayError::UpstreamUnavailable { .. } => "SERVICE_UNAVAILABLE",
            GatewayError::PayloadTooLarge { .. } => "PAYLOAD_TOO_LARGE",
            GatewayError::BadRequest => "BAD_REQUEST",
        }
    }

    /// Client-facing message. Never carries upstream addresses or internals.
    pub fn public_message(&self) -> &'static str {
        match self {
            GatewayError::NoCredential => "Authentication required",
            GatewayError::TokenExpired => "Access token has expired",
            GatewayError::TokenInvalid => "Invalid access token",
            GatewayError::AccountBlocked => "Account is blocked",
            GatewayError::InsufficientRole | GatewayError::InsufficientPermission => {
                "Insufficient permissions"
            }
            GatewayError::InternalCredentialRequired => "Internal credential required",
            GatewayError::RateLimitExceeded { .. } => "Too many requests, please try again later",
            GatewayError::RouteNotFound { .. } => "Route not found",
            GatewayError::UpstreamUnavailable { .. } => "Service temporarily unavailable",
            GatewayError::PayloadTooLarge { .. } => "Request body too large",
            GatewayError::BadRequest => "Malformed request body",
        }
    }

    /// Render the error envelope for this failure, tagged with the trace id.
    pub fn into_response_with(self, trace_id: &str) -> Response {
        let status = self.status();
        let retry_after = match &self {
            GatewayError::RateLimitExceeded { retry_after_secs } => Some(*retry_after_secs),
            _ => None,
        };

        let envelope = ErrorEnvelope {
            error: ErrorBody {
                code: self.code(),
                message: self.public_message(),
                trace_id,
            },
        };

        let mut response = (status, Json(envelope)).into_response();
        if let Some(secs) = retry_after {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        if let Ok(value) = HeaderValue::from_str(trace_id) {
            response.headers_mut().insert("x-request-id", value);
        }
        response
    }
}

impl From<AuthError> for GatewayError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::NoCredential => GatewayError::NoCredential,
            AuthError::Expired => GatewayError::TokenExpired,
            AuthError::Invalid => GatewayError::TokenInvalid,
            AuthError::AccountBlocked => GatewayError::AccountBlocked,
            AuthError::InsufficientRole => GatewayError::InsufficientRole,
            AuthError::InsufficientPermission => GatewayError::InsufficientPermission,
            AuthError::InternalCredentialRequired => GatewayError::InternalCredentialRequired,
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorEnvelope<'a> {
    error: ErrorBody<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ErrorBody<'a> {
    code: &'static str,
    message: &'static str,
    trace_id: &'a str,
}

#[cfg(test)]
mod tests {
    use http_body_util::BodyExt;

    use super::*;

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_envelope_shape() {
        let response = GatewayError::TokenExpired.into_response_with("trace-1");
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(response.headers().get("x-request-id").unwrap(), "trace-1");

        let json = body_json(response).await;
        assert_eq!(json["error"]["code"], "TOKEN_EXPIRED");
        assert_eq!(json["error"]["traceId"], "trace-1");
        assert!(json["error"]["message"].is_string());
    }

    #[tokio::test]
    async fn test_rate_limit_sets_retry_after() {
        let response =
            GatewayError::RateLimitExceeded { retry_after_secs: 7 }.into_response_with("t");
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers().get(header::RETRY_AFTER).unwrap(), "7");
    }

    #[tokio::test]
    async fn test_upstream_message_hides_service_details() {
        let err = GatewayError::UpstreamUnavailable {
            service: "property".to_string(),
        };
        let response = err.into_response_with("t");
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let json = body_json(response).await;
        assert_eq!(json["error"]["code"], "SERVICE_UNAVAILABLE");
        assert!(!json["error"]["message"].as_str().unwrap().contains("property"));
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(GatewayError::NoCredential.code(), "TOKEN_INVALID");
        assert_eq!(
            GatewayError::InsufficientRole.status(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            GatewayError::RouteNotFound {
                method: "GET".into(),
                path: "/x".into()
            }
            .status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            GatewayError::AccountBlocked.status(),
            StatusCode::UNAUTHORIZED
        );
    }
}
