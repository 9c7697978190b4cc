//! Header rewriting for both directions of a relayed request.
//!
//! Outbound: inbound headers minus the hop-by-hop set, with query-supplied
//! overrides applied on top, then the Host and User-Agent contracts.
//! Response: upstream headers minus the framing set, with query-supplied
//! response overrides applied on top.

use http::{HeaderMap, HeaderName, HeaderValue, header};
use url::Url;

/// Hop-by-hop headers never forwarded end-to-end.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "upgrade",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
];

/// Response headers owned by this proxy's own framing.
const RESPONSE_STRIP: &[&str] = &["connection", "transfer-encoding", "content-encoding"];

/// Header adjustments collected from the query string.
#[derive(Debug, Clone, Default)]
pub struct HeaderOverrides {
    /// `request_header[NAME]=VALUE` entries, excluding Host.
    pub request: Vec<(String, String)>,
    /// `response_header[NAME]=VALUE` entries.
    pub response: Vec<(String, String)>,
    /// Explicit Host value, from `override_host_header` or
    /// `request_header[Host]` (the former wins).
    pub host: Option<String>,
}

fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP.contains(&name.as_str())
}

/// Build the outbound header set for the target request.
///
/// The Host contract: an explicit override wins; a literal-IP target gets
/// no Host header at all (the transport client derives one from the URL
/// authority); a hostname target gets the hostname with no port suffix,
/// because TLS-terminating origins select the virtual host by Host and an
/// IP-shaped or port-suffixed value breaks that selection. A request
/// without a User-Agent is forwarded with an explicitly empty one so the
/// transport client cannot substitute its own.
pub fn build_outbound_headers(
    inbound: &HeaderMap,
    target: &Url,
    overrides: &HeaderOverrides,
) -> HeaderMap {
    let mut outbound = HeaderMap::new();

    for (name, value) in inbound {
        // Accept-Encoding stays with the hop: the transport client
        // negotiates its own content codings, and the response side strips
        // Content-Encoding to match.
        if *name == header::HOST || *name == header::ACCEPT_ENCODING || is_hop_by_hop(name) {
            continue;
        }
        outbound.append(name.clone(), value.clone());
    }

    for (name, value) in &overrides.request {
        let Ok(header_name) = name.parse::<HeaderName>() else {
            tracing::warn!(header = %name, "Invalid request header name in query, skipping");
            continue;
        };
        if header_name == header::HOST {
            continue;
        }
        match HeaderValue::from_str(value) {
            Ok(header_value) => {
                outbound.insert(header_name, header_value);
            }
            Err(_) => {
                tracing::warn!(header = %name, "Invalid request header value in query, skipping");
            }
        }
    }

    if let Some(host) = &overrides.host {
        match HeaderValue::from_str(host) {
            Ok(value) => {
                outbound.insert(header::HOST, value);
            }
            Err(_) => {
                tracing::warn!(host = %host, "Invalid Host override, leaving Host unset");
            }
        }
    } else if let Some(url::Host::Domain(domain)) = target.host() {
        if let Ok(value) = HeaderValue::from_str(domain) {
            outbound.insert(header::HOST, value);
        }
    }

    if !outbound.contains_key(header::USER_AGENT) {
        outbound.insert(header::USER_AGENT, HeaderValue::from_static(""));
    }

    outbound
}

/// Rewrite upstream response headers before they reach the client.
pub fn rewrite_response_headers(upstream: &HeaderMap, overrides: &HeaderOverrides) -> HeaderMap {
    let mut rewritten = HeaderMap::new();

    for (name, value) in upstream {
        if RESPONSE_STRIP.contains(&name.as_str()) {
            continue;
        }
        rewritten.append(name.clone(), value.clone());
    }

    for (name, value) in &overrides.response {
        let Ok(header_name) = name.parse::<HeaderName>() else {
            tracing::warn!(header = %name, "Invalid response header name in query, skipping");
            continue;
        };
        match HeaderValue::from_str(value) {
            Ok(header_value) => {
                rewritten.insert(header_name, header_value);
            }
            Err(_) => {
                tracing::warn!(header = %name, "Invalid response header value in query, skipping");
            }
        }
    }

    rewritten
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(raw: &str) -> Url {
        Url::parse(raw).unwrap()
    }

    fn inbound(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.append(
                name.parse::<HeaderName>().unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        map
    }

    #[test]
    fn test_hop_by_hop_headers_are_dropped() {
        let headers = inbound(&[
            ("connection", "keep-alive"),
            ("upgrade", "websocket"),
            ("keep-alive", "timeout=5"),
            ("proxy-authorization", "Basic xxx"),
            ("te", "trailers"),
            ("transfer-encoding", "chunked"),
            ("accept-encoding", "gzip"),
            ("x-custom", "kept"),
            ("accept", "*/*"),
        ]);

        let outbound = build_outbound_headers(
            &headers,
            &url("https://example.com/"),
            &HeaderOverrides::default(),
        );

        for name in HOP_BY_HOP {
            assert!(!outbound.contains_key(*name), "{name} should be dropped");
        }
        assert!(!outbound.contains_key("accept-encoding"));
        assert_eq!(outbound.get("x-custom").unwrap(), "kept");
        assert_eq!(outbound.get("accept").unwrap(), "*/*");
    }

    #[test]
    fn test_host_set_to_hostname_without_port() {
        let headers = inbound(&[("host", "proxy.local")]);
        let outbound = build_outbound_headers(
            &headers,
            &url("https://example.com:8443/path"),
            &HeaderOverrides::default(),
        );
        assert_eq!(outbound.get(header::HOST).unwrap(), "example.com");
    }

    #[test]
    fn test_host_omitted_for_literal_ip_target() {
        let headers = inbound(&[("host", "proxy.local")]);
        let outbound = build_outbound_headers(
            &headers,
            &url("https://192.0.2.10:8443/"),
            &HeaderOverrides::default(),
        );
        assert!(!outbound.contains_key(header::HOST));

        let outbound = build_outbound_headers(
            &headers,
            &url("http://[2001:db8::1]/"),
            &HeaderOverrides::default(),
        );
        assert!(!outbound.contains_key(header::HOST));
    }

    #[test]
    fn test_host_override_wins_even_for_ip_target() {
        let overrides = HeaderOverrides {
            host: Some("one.one.one.one".to_string()),
            ..Default::default()
        };
        let outbound = build_outbound_headers(&HeaderMap::new(), &url("https://1.1.1.1/"), &overrides);
        assert_eq!(outbound.get(header::HOST).unwrap(), "one.one.one.one");
    }

    #[test]
    fn test_missing_user_agent_becomes_explicit_blank() {
        let outbound = build_outbound_headers(
            &HeaderMap::new(),
            &url("https://example.com/"),
            &HeaderOverrides::default(),
        );
        assert_eq!(outbound.get(header::USER_AGENT).unwrap(), "");
    }

    #[test]
    fn test_present_user_agent_is_kept() {
        let headers = inbound(&[("user-agent", "curl/8.5.0")]);
        let outbound = build_outbound_headers(
            &headers,
            &url("https://example.com/"),
            &HeaderOverrides::default(),
        );
        assert_eq!(outbound.get(header::USER_AGENT).unwrap(), "curl/8.5.0");
    }

    #[test]
    fn test_request_overrides_replace_inherited_values() {
        let headers = inbound(&[("x-api-key", "old"), ("accept", "*/*")]);
        let overrides = HeaderOverrides {
            request: vec![
                ("X-Api-Key".to_string(), "new".to_string()),
                ("X-Added".to_string(), "1".to_string()),
            ],
            ..Default::default()
        };
        let outbound = build_outbound_headers(&headers, &url("https://example.com/"), &overrides);
        assert_eq!(outbound.get("x-api-key").unwrap(), "new");
        assert_eq!(outbound.get("x-added").unwrap(), "1");
        assert_eq!(outbound.get("accept").unwrap(), "*/*");
    }

    #[test]
    fn test_invalid_override_names_are_skipped() {
        let overrides = HeaderOverrides {
            request: vec![("bad name".to_string(), "v".to_string())],
            ..Default::default()
        };
        let outbound = build_outbound_headers(&HeaderMap::new(), &url("https://example.com/"), &overrides);
        assert_eq!(outbound.len(), 2); // host + blank user-agent only
    }

    #[test]
    fn test_duplicate_inbound_values_are_preserved() {
        let headers = inbound(&[("x-multi", "a"), ("x-multi", "b")]);
        let outbound = build_outbound_headers(
            &headers,
            &url("https://example.com/"),
            &HeaderOverrides::default(),
        );
        let values: Vec<_> = outbound.get_all("x-multi").iter().collect();
        assert_eq!(values.len(), 2);
    }

    #[test]
    fn test_response_framing_headers_are_stripped() {
        let upstream = inbound(&[
            ("connection", "close"),
            ("transfer-encoding", "chunked"),
            ("content-encoding", "gzip"),
            ("content-type", "text/html"),
            ("x-upstream", "1"),
        ]);
        let rewritten = rewrite_response_headers(&upstream, &HeaderOverrides::default());
        assert!(!rewritten.contains_key("connection"));
        assert!(!rewritten.contains_key("transfer-encoding"));
        assert!(!rewritten.contains_key("content-encoding"));
        assert_eq!(rewritten.get("content-type").unwrap(), "text/html");
        assert_eq!(rewritten.get("x-upstream").unwrap(), "1");
    }

    #[test]
    fn test_response_overrides_append_and_replace() {
        let upstream = inbound(&[("x-frame-options", "DENY")]);
        let overrides = HeaderOverrides {
            response: vec![
                ("X-Frame-Options".to_string(), "SAMEORIGIN".to_string()),
                ("Access-Control-Allow-Origin".to_string(), "*".to_string()),
            ],
            ..Default::default()
        };
        let rewritten = rewrite_response_headers(&upstream, &overrides);
        assert_eq!(rewritten.get("x-frame-options").unwrap(), "SAMEORIGIN");
        assert_eq!(rewritten.get("access-control-allow-origin").unwrap(), "*");
    }
}
