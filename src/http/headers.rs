//! Header manipulation for forwarded traffic.
//!
//! # Responsibilities
//! - Strip hop-by-hop headers in both directions
//! - Add X-Forwarded-For, X-Forwarded-Proto, X-Forwarded-Host
//!
//! # Design Decisions
//! - The client address is appended to any existing X-Forwarded-For chain
//! - Headers named in `Connection` are treated as hop-by-hop too
//! - The client's Host header is passed through unchanged

use std::net::SocketAddr;

use axum::http::header::{self, HeaderMap, HeaderName, HeaderValue};
use axum::http::uri::Authority;

pub const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
pub const X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");
pub const X_FORWARDED_HOST: HeaderName = HeaderName::from_static("x-forwarded-host");

const HOP_BY_HOP: [HeaderName; 8] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

/// Remove hop-by-hop headers, including any listed in `Connection`.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in listed.iter().chain(HOP_BY_HOP.iter()) {
        headers.remove(name);
    }
}

/// Record the original client on a request bound for an upstream.
///
/// `authority` is the request target's authority. HTTP/2 clients send it in
/// place of a `Host` header, so it backs `X-Forwarded-Host` when `Host` is absent.
pub fn apply_forwarding_headers(
    headers: &mut HeaderMap,
    client_addr: SocketAddr,
    authority: Option<&Authority>,
) {
    let client_ip = client_addr.ip().to_string();
    let forwarded_for = match headers
        .get(&X_FORWARDED_FOR)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
    {
        Some(existing) => format!("{existing}, {client_ip}"),
        None => client_ip,
    };
    if let Ok(value) = HeaderValue::from_str(&forwarded_for) {
        headers.insert(X_FORWARDED_FOR, value);
    }

    if !headers.contains_key(&X_FORWARDED_PROTO) {
        headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));
    }

    if !headers.contains_key(&X_FORWARDED_HOST) {
        let host = headers.get(header::HOST).cloned().or_else(|| {
            authority.and_then(|a| HeaderValue::from_str(a.as_str()).ok())
        });
        if let Some(host) = host {
            headers.insert(X_FORWARDED_HOST, host);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> SocketAddr {
        "192.0.2.7:51234".parse().unwrap()
    }

    #[test]
    fn strips_standard_and_listed_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive, x-internal"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert("x-internal", HeaderValue::from_static("1"));
        headers.insert(header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"));

        strip_hop_by_hop(&mut headers);

        assert_eq!(headers.len(), 1);
        assert!(headers.contains_key(header::CONTENT_TYPE));
    }

    #[test]
    fn sets_forwarding_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, HeaderValue::from_static("example.com"));

        apply_forwarding_headers(&mut headers, client(), None);

        assert_eq!(headers[&X_FORWARDED_FOR], "192.0.2.7");
        assert_eq!(headers[&X_FORWARDED_PROTO], "http");
        assert_eq!(headers[&X_FORWARDED_HOST], "example.com");
        assert_eq!(headers[header::HOST], "example.com");
    }

    #[test]
    fn appends_to_existing_chain() {
        let mut headers = HeaderMap::new();
        headers.insert(X_FORWARDED_FOR, HeaderValue::from_static("203.0.113.1"));
        headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("https"));

        apply_forwarding_headers(&mut headers, client(), None);

        assert_eq!(headers[&X_FORWARDED_FOR], "203.0.113.1, 192.0.2.7");
        assert_eq!(headers[&X_FORWARDED_PROTO], "https");
    }

    #[test]
    fn host_wins_over_authority() {
        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, HeaderValue::from_static("example.com"));
        let authority: Authority = "internal.example:8443".parse().unwrap();

        apply_forwarding_headers(&mut headers, client(), Some(&authority));

        assert_eq!(headers[&X_FORWARDED_HOST], "example.com");
    }

    #[test]
    fn authority_backs_forwarded_host_without_host_header() {
        let mut headers = HeaderMap::new();
        let authority: Authority = "example.org:8443".parse().unwrap();

        apply_forwarding_headers(&mut headers, client(), Some(&authority));

        assert_eq!(headers[&X_FORWARDED_HOST], "example.org:8443");
        assert!(!headers.contains_key(header::HOST));
    }
}
