//! Per-request proxy context and header hygiene.
//!
//! A [`ProxyContext`] is built once the request has passed rate limiting,
//! dispatch and the auth guard. [`ProxyContext::prepare_request`] turns the
//! inbound request into the upstream one: target URI, stripped hop-by-hop and
//! client-supplied identity headers, and the gateway's own trust-boundary
//! headers.
use std::net::SocketAddr;

use http::{
    HeaderMap, HeaderName, HeaderValue, Request, Uri,
    header::{AUTHORIZATION, HOST},
};

use crate::core::{dispatcher::Resolution, identity::Identity};

pub const X_REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");
pub const X_USER_ID: HeaderName = HeaderName::from_static("x-user-id");
pub const X_USER_ROLE: HeaderName = HeaderName::from_static("x-user-role");
pub const X_ORG_ID: HeaderName = HeaderName::from_static("x-org-id");
pub const X_USER_EMAIL: HeaderName = HeaderName::from_static("x-user-email");
pub const X_SESSION_ID: HeaderName = HeaderName::from_static("x-session-id");
pub const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
pub const X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");
pub const X_FORWARDED_HOST: HeaderName = HeaderName::from_static("x-forwarded-host");

/// Headers meaningful only for a single transport hop.
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authenticate",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Identity headers only the gateway may set.
const TRUSTED_IDENTITY: [&str; 5] = [
    "x-user-id",
    "x-user-role",
    "x-org-id",
    "x-user-email",
    "x-session-id",
];

#[derive(Debug, Clone)]
pub struct ProxyContext {
    pub trace_id: String,
    pub identity: Option<Identity>,
    pub service: String,
    /// Base URL of the resolved service, e.g. `http://property:4002`.
    pub target_base: String,
    pub rewritten_path: String,
}

impl ProxyContext {
    pub fn new(
        trace_id: impl Into<String>,
        identity: Option<Identity>,
        resolution: &Resolution,
        target_base: impl Into<String>,
    ) -> Self {
        Self {
            trace_id: trace_id.into(),
            identity,
            service: resolution.service.clone(),
            target_base: target_base.into(),
            rewritten_path: resolution.rewritten_path.clone(),
        }
    }

    /// Upstream URI: target base + rewritten path + original query string.
    pub fn upstream_uri(&self, query: Option<&str>) -> Result<Uri, http::Error> {
        let base = self.target_base.trim_end_matches('/');
        let uri = match query {
            Some(query) if !query.is_empty() => {
                format!("{base}{}?{query}", self.rewritten_path)
            }
            _ => format!("{base}{}", self.rewritten_path),
        };
        Ok(Uri::try_from(uri)?)
    }

    /// Rewrite `req` in place for forwarding.
    pub fn prepare_request<B>(
        &self,
        req: &mut Request<B>,
        peer: Option<SocketAddr>,
        internal_token_header: Option<&HeaderName>,
    ) -> Result<(), http::Error> {
        let query = req.uri().query().map(str::to_string);
        let original_host = req
            .headers()
            .get(HOST)
            .cloned()
            .or_else(|| {
                req.uri()
                    .authority()
                    .and_then(|authority| HeaderValue::from_str(authority.as_str()).ok())
            });
        let scheme = req.uri().scheme_str().unwrap_or("http").to_string();

        *req.uri_mut() = self.upstream_uri(query.as_deref())?;

        let headers = req.headers_mut();
        strip_hop_by_hop(headers);
        for name in TRUSTED_IDENTITY {
            headers.remove(name);
        }
        headers.remove(AUTHORIZATION);
        if let Some(name) = internal_token_header {
            headers.remove(name);
        }
        // The upstream client derives Host from the new URI.
        headers.remove(HOST);

        append_forwarded_for(headers, peer);
        if let Ok(proto) = HeaderValue::from_str(&scheme) {
            headers.insert(X_FORWARDED_PROTO, proto);
        }
        if let Some(host) = original_host {
            headers.insert(X_FORWARDED_HOST, host);
        }

        self.inject_identity(headers);
        Ok(())
    }

    fn inject_identity(&self, headers: &mut HeaderMap) {
        insert_str(headers, X_REQUEST_ID, &self.trace_id);

        let Some(identity) = &self.identity else {
            return;
        };
        insert_str(headers, X_USER_ID, &identity.id);
        insert_str(headers, X_USER_ROLE, &identity.role);
        if let Some(org_id) = &identity.org_id {
            insert_str(headers, X_ORG_ID, org_id);
        }
        if let Some(email) = &identity.email {
            insert_str(headers, X_USER_EMAIL, email);
        }
        if let Some(session_id) = &identity.session_id {
            insert_str(headers, X_SESSION_ID, session_id);
        }
    }
}

fn insert_str(headers: &mut HeaderMap, name: HeaderName, value: &str) {
    match HeaderValue::from_str(value) {
        Ok(value) => {
            headers.insert(name, value);
        }
        Err(_) => tracing::warn!(header = %name, "Dropping header with non-visible characters"),
    }
}

fn append_forwarded_for(headers: &mut HeaderMap, peer: Option<SocketAddr>) {
    let Some(peer) = peer else {
        return;
    };
    let peer_ip = peer.ip().to_string();
    let value = match headers.get(&X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
        Some(existing) if !existing.trim().is_empty() => format!("{existing}, {peer_ip}"),
        _ => peer_ip,
    };
    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.insert(X_FORWARDED_FOR, value);
    }
}

/// Remove hop-by-hop headers, including any named by `Connection`.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(http::header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|name| HeaderName::try_from(name.trim()).ok())
        .collect();
    for name in listed {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}
