//! Caller address used as the rate-limit key for IP-keyed limiters.
//!
//! The first `X-Forwarded-For` entry is client-controlled unless something in
//! front rewrites it. The gateway assumes it runs behind a trusted edge proxy
//! (load balancer or ingress) that overwrites `X-Forwarded-For` and
//! `X-Real-IP` with the address it saw. Exposed directly, a caller can pick
//! its own limiter key by sending a fresh header per request.
use std::net::SocketAddr;

use http::HeaderMap;

/// Key used when neither headers nor the socket identify the caller.
pub const UNKNOWN_CLIENT: &str = "unknown";

/// Resolve the client address: first `X-Forwarded-For` entry, then
/// `X-Real-IP`, then the peer socket address.
pub fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|ip| !ip.is_empty());
    if let Some(ip) = forwarded {
        return ip.to_string();
    }

    let real_ip = headers
        .get("x-real-ip")
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|ip| !ip.is_empty());
    if let Some(ip) = real_ip {
        return ip.to_string();
    }

    peer.map(|addr| addr.ip().to_string())
        .unwrap_or_else(|| UNKNOWN_CLIENT.to_string())
}

#[cfg(test)]
mod tests {
    use http::HeaderValue;

    use super::*;

    fn peer() -> Option<SocketAddr> {
        Some("192.0.2.10:40000".parse().unwrap())
    }

    #[test]
    fn test_first_forwarded_entry_wins() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static(" 203.0.113.5 , 10.0.0.1"),
        );
        headers.insert("x-real-ip", HeaderValue::from_static("198.51.100.1"));
        assert_eq!(client_ip(&headers, peer()), "203.0.113.5");
    }

    #[test]
    fn test_real_ip_then_peer_then_unknown() {
        let mut headers = HeaderMap::new();
        headers.insert("x-real-ip", HeaderValue::from_static("198.51.100.1"));
        assert_eq!(client_ip(&headers, peer()), "198.51.100.1");

        assert_eq!(client_ip(&HeaderMap::new(), peer()), "192.0.2.10");
        assert_eq!(client_ip(&HeaderMap::new(), None), UNKNOWN_CLIENT);
    }

    #[test]
    fn test_empty_forwarded_header_is_ignored() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static(""));
        assert_eq!(client_ip(&headers, peer()), "192.0.2.10");
    }
}
