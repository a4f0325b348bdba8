//! Header sanitization for upstream dispatch and response relay.

use axum::http::header::{self, HeaderMap, HeaderName, HeaderValue};
use std::net::IpAddr;

use crate::error::GatewayError;

/// Inbound headers never forwarded upstream.
pub const DROPPED_REQUEST_HEADERS: [&str; 5] = ["cookie", "host", "origin", "referer", "content-length"];

/// Identity headers the backend trusts only when set by the gateway itself.
pub const DEFAULT_IDENTITY_HEADERS: [&str; 2] = ["X-eduPersonPrincipalName", "X-Shib-Session-ID"];

/// Connection-scoped headers that must not cross the proxy.
const HOP_BY_HOP: [&str; 7] = [
    "connection",
    "keep-alive",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Deny-list / ignore-list filter applied before upstream dispatch.
#[derive(Debug, Clone)]
pub struct HeaderSanitizer {
    /// Lowercased identity header names; presence aborts the request.
    forbidden: Vec<String>,
}

impl Default for HeaderSanitizer {
    fn default() -> Self {
        Self::new(std::iter::empty::<String>())
    }
}

impl HeaderSanitizer {
    /// Build a sanitizer forbidding the default identity headers plus `extra`.
    pub fn new<I, S>(extra: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut forbidden: Vec<String> = DEFAULT_IDENTITY_HEADERS
            .iter()
            .map(|h| h.to_ascii_lowercase())
            .collect();

        for name in extra {
            let name = name.as_ref().trim().to_ascii_lowercase();
            if !name.is_empty() && !forbidden.contains(&name) {
                forbidden.push(name);
            }
        }

        Self { forbidden }
    }

    /// Return the first inbound header that matches the ignore-list.
    pub fn find_injected<'a>(&self, inbound: &'a HeaderMap) -> Option<&'a HeaderName> {
        inbound
            .keys()
            .find(|name| self.forbidden.iter().any(|f| f == name.as_str()))
    }

    /// Produce the outbound header set for the upstream request.
    ///
    /// Fails with [`GatewayError::Injection`] when the client sent an
    /// ignore-listed identity header; nothing may be forwarded in that case.
    pub fn sanitize(&self, inbound: &HeaderMap, client_ip: &str) -> Result<HeaderMap, GatewayError> {
        if let Some(name) = self.find_injected(inbound) {
            return Err(GatewayError::Injection(name.to_string()));
        }

        let mut outbound = HeaderMap::with_capacity(inbound.len() + 3);
        for (name, value) in inbound {
            let lower = name.as_str();
            if DROPPED_REQUEST_HEADERS.contains(&lower) || HOP_BY_HOP.contains(&lower) {
                continue;
            }
            outbound.append(name.clone(), value.clone());
        }

        let forwarded = HeaderValue::from_str(&format!("for={}", forwarded_node(client_ip)))
            .map_err(|_| GatewayError::Parse(format!("unusable client address: {:?}", client_ip)))?;
        let forwarded_for = HeaderValue::from_str(client_ip)
            .map_err(|_| GatewayError::Parse(format!("unusable client address: {:?}", client_ip)))?;

        outbound.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/xml"));
        outbound.insert(header::FORWARDED, forwarded);
        outbound.insert(HeaderName::from_static("x-forwarded-for"), forwarded_for);

        Ok(outbound)
    }
}

/// RFC 7239 node for the `for=` parameter.
///
/// IPv6 addresses are bracketed and quoted; other non-token values become a
/// quoted-string.
fn forwarded_node(client_ip: &str) -> String {
    match client_ip.parse::<IpAddr>() {
        Ok(IpAddr::V6(ip)) => format!("\"[{}]\"", ip),
        Ok(IpAddr::V4(ip)) => ip.to_string(),
        Err(_) if !client_ip.is_empty() && client_ip.chars().all(is_tchar) => client_ip.to_string(),
        Err(_) => format!("\"{}\"", client_ip.replace('\\', "\\\\").replace('"', "\\\"")),
    }
}

fn is_tchar(c: char) -> bool {
    c.is_ascii_alphanumeric() || "!#$%&'*+-.^_`|~".contains(c)
}

/// Rewrite upstream response headers for relay back to the browser.
///
/// Everything is copied except `set-cookie` and hop-by-hop headers; the
/// content type is forced to XML and the diagnostic marker is added.
pub fn relay_response_headers(upstream: &HeaderMap, marker: &HeaderName, marker_value: &HeaderValue) -> HeaderMap {
    let mut relayed = HeaderMap::with_capacity(upstream.len() + 2);
    for (name, value) in upstream {
        if name == header::SET_COOKIE || HOP_BY_HOP.contains(&name.as_str()) {
            continue;
        }
        relayed.append(name.clone(), value.clone());
    }

    relayed.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/xml"));
    relayed.insert(marker.clone(), marker_value.clone());
    relayed
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inbound() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::COOKIE, HeaderValue::from_static("JSESSIONID=1"));
        headers.insert(header::HOST, HeaderValue::from_static("gateway.example.org"));
        headers.insert(header::ORIGIN, HeaderValue::from_static("https://gateway.example.org"));
        headers.insert(header::REFERER, HeaderValue::from_static("https://gateway.example.org/"));
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from_static("42"));
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/xml"));
        headers.insert(header::ACCEPT, HeaderValue::from_static("*/*"));
        headers.insert(header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        headers.insert("x-custom", HeaderValue::from_static("kept"));
        headers
    }

    #[test]
    fn test_drops_and_injects() {
        let sanitizer = HeaderSanitizer::default();
        let out = sanitizer.sanitize(&inbound(), "10.1.2.3").unwrap();

        for dropped in DROPPED_REQUEST_HEADERS {
            assert!(out.get(dropped).is_none(), "{} should be dropped", dropped);
        }
        assert!(out.get(header::TRANSFER_ENCODING).is_none());
        assert_eq!(out.get(header::CONTENT_TYPE).unwrap(), "text/xml");
        assert_eq!(out.get(header::FORWARDED).unwrap(), "for=10.1.2.3");
        assert_eq!(out.get("x-forwarded-for").unwrap(), "10.1.2.3");
        assert_eq!(out.get(header::ACCEPT).unwrap(), "*/*");
        assert_eq!(out.get("x-custom").unwrap(), "kept");
    }

    #[test]
    fn test_forwarded_node_forms() {
        let sanitizer = HeaderSanitizer::default();

        let out = sanitizer.sanitize(&HeaderMap::new(), "2001:db8::1").unwrap();
        assert_eq!(out.get(header::FORWARDED).unwrap(), "for=\"[2001:db8::1]\"");
        assert_eq!(out.get("x-forwarded-for").unwrap(), "2001:db8::1");

        let out = sanitizer.sanitize(&HeaderMap::new(), "::ffff:10.1.2.3").unwrap();
        assert_eq!(out.get(header::FORWARDED).unwrap(), "for=\"[::ffff:10.1.2.3]\"");

        let out = sanitizer.sanitize(&HeaderMap::new(), "unknown").unwrap();
        assert_eq!(out.get(header::FORWARDED).unwrap(), "for=unknown");

        let out = sanitizer.sanitize(&HeaderMap::new(), "10.1.2.3, 10.0.0.1").unwrap();
        assert_eq!(out.get(header::FORWARDED).unwrap(), "for=\"10.1.2.3, 10.0.0.1\"");
    }

    #[test]
    fn test_identity_header_aborts_any_case() {
        let sanitizer = HeaderSanitizer::default();
        for name in ["X-eduPersonPrincipalName", "x-shib-session-id", "X-SHIB-SESSION-ID"] {
            let mut headers = inbound();
            headers.insert(
                HeaderName::from_bytes(name.as_bytes()).unwrap(),
                HeaderValue::from_static("admin"),
            );
            let err = sanitizer.sanitize(&headers, "10.1.2.3").unwrap_err();
            assert!(matches!(err, GatewayError::Injection(_)));
        }
    }

    #[test]
    fn test_configured_identity_header_is_forbidden() {
        let sanitizer = HeaderSanitizer::new(["X-Remote-User"]);
        let mut headers = HeaderMap::new();
        headers.insert("x-remote-user", HeaderValue::from_static("admin"));
        assert_eq!(sanitizer.find_injected(&headers).unwrap().as_str(), "x-remote-user");
    }

    #[test]
    fn test_relay_headers() {
        let mut upstream = HeaderMap::new();
        upstream.insert(header::SET_COOKIE, HeaderValue::from_static("JSESSIONID=2"));
        upstream.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/xml"));
        upstream.insert(header::CONTENT_LENGTH, HeaderValue::from_static("10"));
        upstream.insert(header::CONNECTION, HeaderValue::from_static("close"));
        upstream.insert("x-backend", HeaderValue::from_static("pm"));

        let marker = HeaderName::from_static("i2b2-dev-svr-mode");
        let relayed = relay_response_headers(&upstream, &marker, &HeaderValue::from_static("Proxy"));

        assert!(relayed.get(header::SET_COOKIE).is_none());
        assert!(relayed.get(header::CONNECTION).is_none());
        assert_eq!(relayed.get(header::CONTENT_TYPE).unwrap(), "text/xml");
        assert_eq!(relayed.get(header::CONTENT_LENGTH).unwrap(), "10");
        assert_eq!(relayed.get("x-backend").unwrap(), "pm");
        assert_eq!(relayed.get("i2b2-dev-svr-mode").unwrap(), "Proxy");
    }
}
