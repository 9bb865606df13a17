//! The request pipeline and the axum router around it.
//!
//! Per request: operational endpoints short-circuit first; everything else
//! goes through the default rate limiter, dispatch, the route class limiter
//! (auth or webhook), the auth guard and finally the upstream forward.
//! Gateway-originated failures use the JSON error envelope; backend
//! responses, including their own errors, are relayed untouched apart from
//! hop-by-hop headers.
use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Instant,
};

use axum::{
    Json, Router,
    body::{Body as AxumBody, to_bytes},
    extract::{ConnectInfo, Request, State},
    http::{HeaderName, HeaderValue, StatusCode, header},
    middleware,
    response::{IntoResponse, Response},
};
use http_body_util::LengthLimitError;
use metrics_exporter_prometheus::PrometheusHandle;
use serde_json::json;
use tower_http::trace::TraceLayer;

use crate::{
    adapters::middleware::{TraceId, inbound_trace_id, request_id_middleware},
    config::{GatewayConfig, RateLimitClass},
    core::{
        auth::AuthGuard,
        dispatcher::{Dispatcher, Resolution},
        error::GatewayError,
        identity::Identity,
        proxy::{ProxyContext, X_REQUEST_ID},
        rate_limiter::{RateLimitDecision, RateLimiter, login_identifier},
    },
    metrics,
    ports::{http_client::HttpClient, permission_authority::PermissionAuthority},
    utils::client_ip::client_ip,
};

/// Largest request body buffered to derive the auth limiter key.
pub const AUTH_BODY_LIMIT: usize = 64 * 1024;

const SERVICE_NAME: &str = env!("CARGO_PKG_NAME");

/// Route label for requests that matched no rule.
const UNMATCHED_ROUTE: &str = "unmatched";

pub struct HttpHandler {
    config: Arc<GatewayConfig>,
    dispatcher: Dispatcher,
    guard: AuthGuard,
    limiter: Arc<RateLimiter>,
    http_client: Arc<dyn HttpClient>,
    internal_token_header: Option<HeaderName>,
    metrics_handle: Option<PrometheusHandle>,
    ready: AtomicBool,
    shutting_down: Arc<AtomicBool>,
}

impl HttpHandler {
    pub fn new(
        config: Arc<GatewayConfig>,
        http_client: Arc<dyn HttpClient>,
        authority: Arc<dyn PermissionAuthority>,
        limiter: Arc<RateLimiter>,
    ) -> Self {
        Self {
            dispatcher: Dispatcher::from_config(&config),
            guard: AuthGuard::new(&config, authority),
            internal_token_header: HeaderName::try_from(config.internal.token_header.as_str())
                .ok(),
            config,
            limiter,
            http_client,
            metrics_handle: None,
            ready: AtomicBool::new(false),
            shutting_down: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_metrics_handle(mut self, handle: PrometheusHandle) -> Self {
        self.metrics_handle = Some(handle);
        self
    }

    /// Share the process shutdown flag so `/ready` reports 503 while draining.
    pub fn with_shutdown_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.shutting_down = flag;
        self
    }

    pub fn mark_ready(&self) {
        self.ready.store(true, Ordering::Release);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire) && !self.shutting_down.load(Ordering::Acquire)
    }

    pub fn route_count(&self) -> usize {
        self.dispatcher.route_count()
    }

    /// Main request handler that routes requests appropriately
    pub async fn handle_request(&self, req: Request, client_addr: Option<SocketAddr>) -> Response {
        match req.uri().path() {
            "/health" => self.handle_health(),
            "/ready" => self.handle_ready(),
            "/metrics" => self.handle_metrics(),
            _ => self.handle_proxy_request(req, client_addr).await,
        }
    }

    fn handle_health(&self) -> Response {
        Json(json!({
            "status": "ok",
            "service": SERVICE_NAME,
            "version": env!("CARGO_PKG_VERSION"),
            "timestamp": chrono::Utc::now().to_rfc3339(),
        }))
        .into_response()
    }

    fn handle_ready(&self) -> Response {
        if self.is_ready() {
            Json(json!({
                "status": "ready",
                "services": self.config.services.len(),
            }))
            .into_response()
        } else {
            let status = if self.shutting_down.load(Ordering::Acquire) {
                "shutting_down"
            } else {
                "starting"
            };
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "status": status })),
            )
                .into_response()
        }
    }

    fn handle_metrics(&self) -> Response {
        let body = self
            .metrics_handle
            .as_ref()
            .map(PrometheusHandle::render)
            .unwrap_or_default();
        (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response()
    }

    async fn handle_proxy_request(&self, req: Request, client_addr: Option<SocketAddr>) -> Response {
        let trace_id = req
            .extensions()
            .get::<TraceId>()
            .cloned()
            .or_else(|| inbound_trace_id(req.headers()))
            .unwrap_or_else(TraceId::generate);
        let method = req.method().clone();
        let start = Instant::now();

        let (route, response) = self.run_pipeline(req, client_addr, &trace_id).await;

        metrics::increment_request_total(&route, method.as_str(), response.status().as_u16());
        metrics::record_request_duration(&route, method.as_str(), start.elapsed());
        response
    }

    /// Returns the matched route label alongside the response.
    async fn run_pipeline(
        &self,
        req: Request,
        client_addr: Option<SocketAddr>,
        trace_id: &TraceId,
    ) -> (String, Response) {
        let trace = trace_id.as_str();
        let ip = client_ip(req.headers(), client_addr);

        let default_decision = self.limiter.admit_class(RateLimitClass::Default, &ip).await;
        if let RateLimitDecision::Denied {
            retry_after_secs, ..
        } = default_decision
        {
            let response = GatewayError::RateLimitExceeded { retry_after_secs }
                .into_response_with(trace);
            return (UNMATCHED_ROUTE.to_string(), with_limits(response, default_decision));
        }

        let Some(resolution) = self.dispatcher.resolve(req.method(), req.uri().path()) else {
            tracing::debug!(method = %req.method(), path = %req.uri().path(), "No route");
            let response = GatewayError::RouteNotFound {
                method: req.method().to_string(),
                path: req.uri().path().to_string(),
            }
            .into_response_with(trace);
            return (UNMATCHED_ROUTE.to_string(), with_limits(response, default_decision));
        };
        let route = resolution.pattern.clone();

        let (req, decision) = match self
            .apply_class_limit(req, &resolution, &ip, default_decision)
            .await
        {
            Ok(admitted) => admitted,
            Err(err) => {
                return (route, err.into_response_with(trace));
            }
        };
        if let RateLimitDecision::Denied {
            retry_after_secs, ..
        } = decision
        {
            let response = GatewayError::RateLimitExceeded { retry_after_secs }
                .into_response_with(trace);
            return (route, with_limits(response, decision));
        }

        let identity = match self.guard.guard(&resolution.auth, req.headers()).await {
            Ok(identity) => identity,
            Err(err) => {
                let err = GatewayError::from(err);
                metrics::increment_auth_failure(err.code());
                tracing::warn!(
                    route = %route,
                    requirement = resolution.auth.label(),
                    code = err.code(),
                    "Request rejected: {}",
                    err
                );
                return (route, with_limits(err.into_response_with(trace), decision));
            }
        };

        let response = self
            .forward(req, client_addr, trace, identity, &resolution)
            .await;
        (route, with_limits(response, decision))
    }

    /// Run the class limiter for auth and webhook routes. Default-class routes
    /// reuse the decision already taken.
    async fn apply_class_limit(
        &self,
        req: Request,
        resolution: &Resolution,
        ip: &str,
        default_decision: RateLimitDecision,
    ) -> Result<(Request, RateLimitDecision), GatewayError> {
        match resolution.rate_limit {
            RateLimitClass::Default => Ok((req, default_decision)),
            RateLimitClass::Webhook => {
                let decision = self.limiter.admit_class(RateLimitClass::Webhook, ip).await;
                Ok((req, decision))
            }
            RateLimitClass::Auth => {
                let (req, identifier) = buffer_login_identifier(req).await?;
                let key = identifier.unwrap_or_else(|| ip.to_string());
                let decision = self.limiter.admit_class(RateLimitClass::Auth, &key).await;
                Ok((req, decision))
            }
        }
    }

    async fn forward(
        &self,
        mut req: Request,
        client_addr: Option<SocketAddr>,
        trace: &str,
        identity: Option<Identity>,
        resolution: &Resolution,
    ) -> Response {
        let unavailable = || {
            GatewayError::UpstreamUnavailable {
                service: resolution.service.clone(),
            }
            .into_response_with(trace)
        };

        let Some(service) = self.config.services.get(&resolution.service) else {
            tracing::error!(service = %resolution.service, "Route references an undeclared service");
            return unavailable();
        };

        let context = ProxyContext::new(trace, identity, resolution, &service.base_url);
        if let Err(e) =
            context.prepare_request(&mut req, client_addr, self.internal_token_header.as_ref())
        {
            tracing::error!(service = %context.service, error = %e, "Failed to build upstream request");
            return unavailable();
        }

        let _timer = metrics::UpstreamTimer::new(&context.service);
        match self.http_client.send_request(req).await {
            Ok(mut response) => {
                metrics::increment_upstream_request_total(
                    &context.service,
                    response.status().as_u16(),
                );
                if let Ok(value) = HeaderValue::from_str(trace) {
                    response.headers_mut().insert(X_REQUEST_ID, value);
                }
                response
            }
            Err(e) => {
                metrics::increment_upstream_request_total(&context.service, 0);
                tracing::error!(
                    service = %context.service,
                    path = %context.rewritten_path,
                    error = %e,
                    "Upstream request failed"
                );
                unavailable()
            }
        }
    }
}

fn with_limits(mut response: Response, decision: RateLimitDecision) -> Response {
    decision.apply_headers(response.headers_mut());
    response
}

/// Buffer a small body to read the login identifier, then re-attach it.
/// Bodies declared larger than [`AUTH_BODY_LIMIT`] are left streaming and
/// yield no identifier.
async fn buffer_login_identifier(req: Request) -> Result<(Request, Option<String>), GatewayError> {
    let declared_len = req
        .headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<usize>().ok());
    if declared_len.is_some_and(|len| len > AUTH_BODY_LIMIT) {
        return Ok((req, None));
    }

    let (parts, body) = req.into_parts();
    let bytes = to_bytes(body, AUTH_BODY_LIMIT).await.map_err(|e| {
        let inner = e.into_inner();
        if inner.is::<LengthLimitError>() {
            GatewayError::PayloadTooLarge {
                limit: AUTH_BODY_LIMIT,
            }
        } else {
            tracing::warn!(error = %inner, "Failed to read login request body");
            GatewayError::BadRequest
        }
    })?;
    let identifier = login_identifier(&bytes);
    Ok((Request::from_parts(parts, AxumBody::from(bytes)), identifier))
}

async fn proxy_entry(State(handler): State<Arc<HttpHandler>>, req: Request) -> Response {
    let client_addr = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    handler.handle_request(req, client_addr).await
}

/// Axum router serving every path through [`HttpHandler`].
pub fn build_router(handler: Arc<HttpHandler>) -> Router {
    Router::new()
        .fallback(proxy_entry)
        .with_state(handler)
        .layer(middleware::from_fn(request_id_middleware))
        .layer(TraceLayer::new_for_http())
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use axum::http::Request as HttpRequest;
    use http_body_util::BodyExt;
    use tower::ServiceExt; // for oneshot

    use super::*;
    use crate::{
        adapters::memory_rate_limit_store::MemoryRateLimitStore,
        config::{AuthRequirement, RouteMethod, RouteRule},
        core::identity::test_support::{self, token},
        ports::http_client::{HttpClientError, HttpClientResult},
    };

    /// Records forwarded requests and answers 200, or fails when `down`.
    #[derive(Default)]
    struct RecordingClient {
        seen: Mutex<Vec<(String, axum::http::HeaderMap, Vec<u8>)>>,
        down: bool,
    }

    #[async_trait]
    impl HttpClient for RecordingClient {
        async fn send_request(&self, req: Request) -> HttpClientResult<Response> {
            if self.down {
                return Err(HttpClientError::ConnectionError("refused".to_string()));
            }
            let (parts, body) = req.into_parts();
            let body = body.collect().await.unwrap().to_bytes().to_vec();
            self.seen
                .lock()
                .unwrap()
                .push((parts.uri.to_string(), parts.headers, body));
            Ok(Response::new(AxumBody::from("upstream")))
        }
    }

    struct Allow(bool);

    #[async_trait]
    impl PermissionAuthority for Allow {
        async fn check(&self, _: &str, _: &str) -> bool {
            self.0
        }
    }

    fn config() -> GatewayConfig {
        let mut config = GatewayConfig::builder()
            .internal_token("svc-secret")
            .service("property", "http://property.test:4002")
            .service("org", "http://org.test:4004")
            .route(
                RouteRule::new(RouteMethod::Any, "/v1/properties/*", "property")
                    .rewrite("/v1/properties", "/api/properties")
                    .auth(AuthRequirement::Optional),
            )
            .route(
                RouteRule::new(RouteMethod::Post, "/v1/auth/login", "org")
                    .rate_limit(RateLimitClass::Auth),
            )
            .route(
                RouteRule::new(RouteMethod::Any, "/v1/leads/*", "org").auth(
                    AuthRequirement::Permission {
                        permissions: vec!["leads:read".into()],
                    },
                ),
            )
            .route(RouteRule::new(RouteMethod::Any, "/internal/v1/*", "org"))
            .rate_limit(RateLimitClass::Auth, 60_000, 2)
            .build();
        config.auth = test_support::auth_config();
        config
    }

    fn handler_with(
        config: GatewayConfig,
        client: Arc<RecordingClient>,
        allow: bool,
    ) -> Arc<HttpHandler> {
        let limiter = Arc::new(RateLimiter::new(
            Arc::new(MemoryRateLimitStore::new()),
            config.rate_limits.clone(),
        ));
        Arc::new(HttpHandler::new(
            Arc::new(config),
            client,
            Arc::new(Allow(allow)),
            limiter,
        ))
    }

    async fn json_body(response: Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn get(uri: &str) -> Request {
        HttpRequest::builder().uri(uri).body(AxumBody::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_health_and_readiness() {
        let handler = handler_with(config(), Arc::default(), true);
        let app = build_router(handler.clone());

        let response = app.clone().oneshot(get("/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["service"], "realty-gateway");

        let response = app.clone().oneshot(get("/ready")).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(json_body(response).await["status"], "starting");

        handler.mark_ready();
        let response = app.oneshot(get("/ready")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["status"], "ready");
        assert_eq!(body["services"], 2);
    }

    #[tokio::test]
    async fn test_ready_reports_shutdown() {
        let flag = Arc::new(AtomicBool::new(false));
        let limiter = Arc::new(RateLimiter::new(
            Arc::new(MemoryRateLimitStore::new()),
            Default::default(),
        ));
        let handler = HttpHandler::new(
            Arc::new(config()),
            Arc::new(RecordingClient::default()),
            Arc::new(Allow(true)),
            limiter,
        )
        .with_shutdown_flag(flag.clone());
        handler.mark_ready();
        assert!(handler.is_ready());

        flag.store(true, Ordering::Release);
        assert!(!handler.is_ready());
        let response = handler.handle_request(get("/ready"), None).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_operational_endpoints_carry_no_rate_limit_headers() {
        let app = build_router(handler_with(config(), Arc::default(), true));
        let response = app.oneshot(get("/metrics")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get("x-ratelimit-limit").is_none());
    }

    #[tokio::test]
    async fn test_forward_rewrites_and_attaches_limits() {
        let client = Arc::new(RecordingClient::default());
        let app = build_router(handler_with(config(), client.clone(), true));

        let response = app
            .oneshot(
                HttpRequest::builder()
                    .uri("/v1/properties/p-1?view=full")
                    .header("authorization", format!("Bearer {}", token("user-5", "agent")))
                    .header("x-user-id", "spoofed")
                    .header("x-request-id", "trace-abc")
                    .body(AxumBody::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers().get("x-request-id").unwrap(), "trace-abc");
        assert_eq!(response.headers().get("x-ratelimit-limit").unwrap(), "1000");
        assert_eq!(
            response.headers().get("x-ratelimit-remaining").unwrap(),
            "999"
        );
        assert!(response.headers().get("x-ratelimit-reset").is_some());

        let seen = client.seen.lock().unwrap();
        let (uri, headers, _) = &seen[0];
        assert_eq!(uri, "http://property.test:4002/api/properties/p-1?view=full");
        assert_eq!(headers.get("x-user-id").unwrap(), "user-5");
        assert_eq!(headers.get("x-user-role").unwrap(), "agent");
        assert_eq!(headers.get("x-request-id").unwrap(), "trace-abc");
        assert!(headers.get("authorization").is_none());
    }

    #[tokio::test]
    async fn test_unknown_route_is_404_envelope() {
        let client = Arc::new(RecordingClient::default());
        let app = build_router(handler_with(config(), client.clone(), true));
        let response = app
            .oneshot(
                HttpRequest::builder()
                    .uri("/v9/nothing")
                    .header("x-request-id", "t-404")
                    .body(AxumBody::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = json_body(response).await;
        assert_eq!(body["error"]["code"], "NOT_FOUND");
        assert_eq!(body["error"]["traceId"], "t-404");
        assert!(client.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_permission_denied_is_403_and_not_forwarded() {
        let client = Arc::new(RecordingClient::default());
        let app = build_router(handler_with(config(), client.clone(), false));
        let response = app
            .oneshot(
                HttpRequest::builder()
                    .uri("/v1/leads/1")
                    .header("authorization", format!("Bearer {}", token("user-1", "agent")))
                    .body(AxumBody::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(
            json_body(response).await["error"]["code"],
            "INSUFFICIENT_PERMISSIONS"
        );
        assert!(client.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_internal_namespace_requires_service_token() {
        let client = Arc::new(RecordingClient::default());
        let app = build_router(handler_with(config(), client.clone(), true));

        let response = app.clone().oneshot(get("/internal/v1/jobs")).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(json_body(response).await["error"]["code"], "UNAUTHORIZED");

        let response = app
            .oneshot(
                HttpRequest::builder()
                    .uri("/internal/v1/jobs")
                    .header("x-internal-token", "svc-secret")
                    .body(AxumBody::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let seen = client.seen.lock().unwrap();
        assert!(seen[0].1.get("x-internal-token").is_none());
    }

    #[tokio::test]
    async fn test_auth_limiter_keys_on_login_identifier() {
        let client = Arc::new(RecordingClient::default());
        let app = build_router(handler_with(config(), client.clone(), true));
        let login = |email: &str| {
            HttpRequest::builder()
                .method("POST")
                .uri("/v1/auth/login")
                .header("content-type", "application/json")
                .body(AxumBody::from(format!(
                    r#"{{"email":"{email}","password":"pw"}}"#
                )))
                .unwrap()
        };

        for _ in 0..2 {
            let response = app.clone().oneshot(login("a@example.com")).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            assert_eq!(response.headers().get("x-ratelimit-limit").unwrap(), "2");
        }
        let response = app.clone().oneshot(login("a@example.com")).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(response.headers().get("retry-after").is_some());
        assert_eq!(
            json_body(response).await["error"]["code"],
            "RATE_LIMIT_EXCEEDED"
        );

        // A different identifier has its own bucket.
        let response = app.oneshot(login("b@example.com")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        // The buffered body still reaches the backend.
        let seen = client.seen.lock().unwrap();
        assert_eq!(seen[0].2, br#"{"email":"a@example.com","password":"pw"}"#.to_vec());
    }

    #[tokio::test]
    async fn test_empty_bearer_is_rejected_and_not_forwarded() {
        let client = Arc::new(RecordingClient::default());
        let app = build_router(handler_with(config(), client.clone(), true));
        let response = app
            .clone()
            .oneshot(
                HttpRequest::builder()
                    .uri("/v1/leads/1")
                    .header("authorization", "Bearer ")
                    .body(AxumBody::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(json_body(response).await["error"]["code"], "TOKEN_INVALID");
        assert!(client.seen.lock().unwrap().is_empty());

        // Optional routes still pass, anonymously.
        let response = app
            .oneshot(
                HttpRequest::builder()
                    .uri("/v1/properties/p-1")
                    .header("authorization", "Bearer ")
                    .body(AxumBody::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let seen = client.seen.lock().unwrap();
        assert!(seen[0].1.get("x-user-id").is_none());
    }

    #[tokio::test]
    async fn test_dot_segments_are_404_and_not_forwarded() {
        let client = Arc::new(RecordingClient::default());
        let app = build_router(handler_with(config(), client.clone(), true));
        for uri in [
            "/v1/properties/../internal/v1/jobs",
            "/v1/properties/%2e%2e/leads/1",
            "/v1/properties/p-1/%2E%2E%2Fsecret",
        ] {
            let response = app.clone().oneshot(get(uri)).await.unwrap();
            assert_eq!(response.status(), StatusCode::NOT_FOUND, "{uri}");
            assert_eq!(json_body(response).await["error"]["code"], "NOT_FOUND");
        }
        assert!(client.seen.lock().unwrap().is_empty());
    }

    fn chunked_login(chunks: Vec<Result<Vec<u8>, std::io::Error>>) -> Request {
        HttpRequest::builder()
            .method("POST")
            .uri("/v1/auth/login")
            .header("content-type", "application/json")
            .body(AxumBody::from_stream(futures_util::stream::iter(chunks)))
            .unwrap()
    }

    #[tokio::test]
    async fn test_oversized_chunked_login_body_is_413() {
        let client = Arc::new(RecordingClient::default());
        let app = build_router(handler_with(config(), client.clone(), true));
        let chunks = (0..5).map(|_| Ok(vec![b' '; 16 * 1024])).collect();

        let response = app.oneshot(chunked_login(chunks)).await.unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(
            json_body(response).await["error"]["code"],
            "PAYLOAD_TOO_LARGE"
        );
        assert!(client.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_broken_login_body_is_400() {
        let client = Arc::new(RecordingClient::default());
        let app = build_router(handler_with(config(), client.clone(), true));
        let chunks = vec![
            Ok(br#"{"email":"#.to_vec()),
            Err(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "client went away",
            )),
        ];

        let response = app.oneshot(chunked_login(chunks)).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["error"]["code"], "BAD_REQUEST");
        assert!(client.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_upstream_failure_is_502_with_trace_id() {
        let client = Arc::new(RecordingClient {
            down: true,
            ..Default::default()
        });
        let app = build_router(handler_with(config(), client, true));
        let response = app
            .oneshot(
                HttpRequest::builder()
                    .uri("/v1/properties")
                    .header("x-request-id", "trace-502")
                    .body(AxumBody::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let body = json_body(response).await;
        assert_eq!(body["error"]["code"], "SERVICE_UNAVAILABLE");
        assert_eq!(body["error"]["traceId"], "trace-502");
    }

    #[tokio::test]
    async fn test_default_limiter_denies_before_dispatch() {
        let mut config = config();
        config.rate_limits.default.max = 1;
        let client = Arc::new(RecordingClient::default());
        let app = build_router(handler_with(config, client.clone(), true));

        let first = app.clone().oneshot(get("/v1/properties")).await.unwrap();
        assert_eq!(first.status(), StatusCode::OK);
        assert_eq!(first.headers().get("x-ratelimit-remaining").unwrap(), "0");

        let second = app.oneshot(get("/v9/unknown")).await.unwrap();
        assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(second.headers().get("x-ratelimit-remaining").unwrap(), "0");
        assert_eq!(client.seen.lock().unwrap().len(), 1);
    }
}
