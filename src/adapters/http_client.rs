use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body as AxumBody;
use eyre::Result;
use hyper::{Request, Response, Version, header, header::HeaderValue};
use hyper_rustls::HttpsConnector;
use hyper_util::{
    client::legacy::{Client, connect::HttpConnector},
    rt::TokioExecutor,
};
use rustls_native_certs::load_native_certs;
use tokio::time::timeout;
use tracing::Instrument;

use crate::{
    core::proxy::strip_hop_by_hop,
    ports::http_client::{HttpClient, HttpClientError, HttpClientResult},
    tracing_setup::create_backend_span,
};

/// Upstream client built on hyper with rustls (HTTP/1.1 over plain TCP or TLS).
///
/// Bodies are streamed in both directions. The configured timeout bounds the
/// wait for response headers; there are no retries.
pub struct HttpClientAdapter {
    client: Client<HttpsConnector<HttpConnector>, AxumBody>,
    timeout: Duration,
}

impl HttpClientAdapter {
    pub fn new(request_timeout: Duration) -> Result<Self> {
        // Install default crypto provider for rustls if not already set
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

        let mut http_connector = HttpConnector::new();
        http_connector.enforce_http(false);
        http_connector.set_connect_timeout(Some(request_timeout));

        let mut root_cert_store = rustls::RootCertStore::empty();
        let native_certs = load_native_certs();
        for cert in native_certs.certs {
            if root_cert_store.add(cert).is_err() {
                tracing::warn!("Failed to add native certificate to rustls RootCertStore");
            }
        }
        if !native_certs.errors.is_empty() {
            tracing::warn!(
                "Some native certificates failed to load: {:?}",
                native_certs.errors
            );
        }
        tracing::debug!("Loaded {} native root certificates", root_cert_store.len());

        let tls_config = rustls::ClientConfig::builder()
            .with_root_certificates(root_cert_store)
            .with_no_client_auth();

        let https_connector = hyper_rustls::HttpsConnectorBuilder::new()
            .with_tls_config(tls_config)
            .https_or_http()
            .enable_http1()
            .wrap_connector(http_connector);

        let client = Client::builder(TokioExecutor::new()).build::<_, AxumBody>(https_connector);

        Ok(Self {
            client,
            timeout: request_timeout,
        })
    }

    fn set_host_header(req: &mut Request<AxumBody>) -> HttpClientResult<()> {
        let Some(host) = req.uri().host() else {
            return Err(HttpClientError::InvalidRequest(format!(
                "Outgoing URI has no host: {}",
                req.uri()
            )));
        };
        let value = match req.uri().port_u16() {
            Some(port) => HeaderValue::from_str(&format!("{host}:{port}")),
            None => HeaderValue::from_str(host),
        }
        .map_err(|e| HttpClientError::InvalidRequest(e.to_string()))?;
        req.headers_mut().insert(header::HOST, value);
        Ok(())
    }
}

#[async_trait]
impl HttpClient for HttpClientAdapter {
    async fn send_request(
        &self,
        mut req: Request<AxumBody>,
    ) -> HttpClientResult<Response<AxumBody>> {
        Self::set_host_header(&mut req)?;

        let backend_identifier = format!(
            "{}://{}",
            req.uri().scheme_str().unwrap_or("http"),
            req.uri()
                .authority()
                .map_or_else(|| "unknown".to_string(), |a| a.to_string())
        );
        let span = create_backend_span(
            &backend_identifier,
            req.method().as_str(),
            req.uri().path(),
        );

        let (mut parts, body) = req.into_parts();
        parts.version = Version::HTTP_11;
        let method = parts.method.clone();
        let uri = parts.uri.clone();
        let outgoing = Request::from_parts(parts, body);

        let client = self.client.clone();
        let timeout_secs = self.timeout.as_secs();

        async move {
            tracing::debug!("Forwarding {} {}", method, uri);
            match timeout(self.timeout, client.request(outgoing)).await {
                Ok(Ok(response)) => {
                    tracing::Span::current()
                        .record("http.status_code", response.status().as_u16());
                    let (mut parts, body) = response.into_parts();
                    strip_hop_by_hop(&mut parts.headers);
                    Ok(Response::from_parts(parts, AxumBody::new(body)))
                }
                Ok(Err(e)) => {
                    tracing::error!(
                        "Error making request to backend {}: {}",
                        backend_identifier,
                        e
                    );
                    Err(HttpClientError::ConnectionError(format!(
                        "Request to {method} {uri} failed: {e}"
                    )))
                }
                Err(_) => {
                    tracing::error!(
                        "Backend {} did not respond within {}s",
                        backend_identifier,
                        timeout_secs
                    );
                    Err(HttpClientError::Timeout(timeout_secs))
                }
            }
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use http_body_util::BodyExt;
    use tokio::{io::AsyncWriteExt, net::TcpListener};

    use super::*;

    fn client(timeout: Duration) -> HttpClientAdapter {
        HttpClientAdapter::new(timeout).unwrap()
    }

    #[tokio::test]
    async fn test_relative_uri_is_rejected() {
        let req = Request::builder()
            .uri("/no-host")
            .body(AxumBody::empty())
            .unwrap();
        let result = client(Duration::from_secs(1)).send_request(req).await;
        assert!(matches!(result, Err(HttpClientError::InvalidRequest(_))));
    }

    #[tokio::test]
    async fn test_closed_port_is_connection_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let req = Request::builder()
            .uri(format!("http://{addr}/x"))
            .body(AxumBody::empty())
            .unwrap();
        let result = client(Duration::from_secs(2)).send_request(req).await;
        assert!(matches!(result, Err(HttpClientError::ConnectionError(_))));
    }

    #[tokio::test]
    async fn test_silent_backend_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            // Accept and hold the connection open without answering.
            let (_socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(10)).await;
        });

        let req = Request::builder()
            .uri(format!("http://{addr}/slow"))
            .body(AxumBody::empty())
            .unwrap();
        let result = client(Duration::from_millis(200)).send_request(req).await;
        assert!(matches!(result, Err(HttpClientError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_response_is_relayed_without_hop_headers() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = tokio::io::AsyncReadExt::read(&mut socket, &mut buf).await;
            socket
                .write_all(
                    b"HTTP/1.1 409 Conflict\r\ncontent-length: 5\r\nkeep-alive: timeout=5\r\nx-backend: yes\r\n\r\nclash",
                )
                .await
                .unwrap();
        });

        let req = Request::builder()
            .uri(format!("http://{addr}/thing"))
            .body(AxumBody::empty())
            .unwrap();
        let response = client(Duration::from_secs(2)).send_request(req).await.unwrap();
        assert_eq!(response.status(), 409);
        assert_eq!(response.headers().get("x-backend").unwrap(), "yes");
        assert!(response.headers().get("keep-alive").is_none());
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"clash");
    }
}
