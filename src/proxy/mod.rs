//! Request lifecycle: parse, authorize, dispatch to the HTTP or WebSocket
//! relay.
//!
//! Checks run client → token → target. Errors map to exactly one JSON
//! response; once a relay has started writing, later failures only close
//! the connection.

pub mod relay;
pub mod ws;

use std::{net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    body::Body,
    extract::{ConnectInfo, FromRequestParts, Path, Request, State, WebSocketUpgrade},
    response::Response,
};
use http::{HeaderMap, Method, header};
use url::{Url, form_urlencoded};

use crate::{
    AppState, config,
    error::ProxyError,
    headers::{self, HeaderOverrides},
    policy,
    registry::ProxyInstance,
    tls::TlsBypass,
};

/// Entry point for `/{prefix}/{instance}` requests of any method.
pub async fn handle(
    State(state): State<AppState>,
    Path(instance_name): Path<String>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    req: Request,
) -> Response {
    let name = instance_name.clone();
    match run(state, instance_name, peer, req).await {
        Ok(response) => response,
        Err(error) => {
            tracing::debug!(instance = %name, error = %error, "Request rejected");
            error.into_response(&name)
        }
    }
}

async fn run(
    state: AppState,
    instance_name: String,
    peer: SocketAddr,
    req: Request,
) -> Result<Response, ProxyError> {
    let instance = state
        .registry
        .get(&instance_name)
        .ok_or(ProxyError::UnknownInstance(instance_name))?;

    let (mut parts, body) = req.into_parts();

    let client_ip = client_ip(&parts.headers, peer);
    if !policy::client_allowed(&client_ip, &instance.restrict_in) {
        tracing::warn!(
            instance = %instance.name,
            client_ip = %client_ip,
            "Client IP denied"
        );
        return Err(ProxyError::ClientDenied(client_ip));
    }

    let query = ProxyQuery::parse(parts.uri.query().unwrap_or(""))?;

    if !policy::token_valid(query.token.as_deref(), &instance.tokens) {
        tracing::warn!(
            instance = %instance.name,
            client_ip = %client_ip,
            "Token rejected"
        );
        return Err(ProxyError::InvalidToken);
    }

    let target = parse_target(&query.target_url)?;

    if !policy::target_allowed(
        &target,
        &instance.restrict_out,
        instance.loopback_is_internal,
        state.resolver.as_ref(),
    )
    .await
    {
        tracing::warn!(
            instance = %instance.name,
            target = %target,
            restrict_out = instance.restrict_out.variant_name(),
            "Target denied"
        );
        return Err(ProxyError::TargetDenied(target.to_string()));
    }

    let bypass = TlsBypass::parse(query.skip_tls_checks.as_deref());
    if !bypass.is_default() {
        tracing::debug!(
            instance = %instance.name,
            ?bypass,
            "TLS verification relaxed for this request"
        );
    }

    // Prepare the upgrade (without accepting it) only when the request
    // announces one; a plain request with a ws:// target stays HTTP.
    let upgrade = if is_upgrade_request(&parts.headers) {
        let upgrade = WebSocketUpgrade::from_request_parts(&mut parts, &())
            .await
            .map_err(|e| ProxyError::BadUpgrade(e.to_string()))?;
        Some(upgrade)
    } else {
        None
    };

    let outbound = headers::build_outbound_headers(&parts.headers, &target, &query.headers);
    let deadline = Duration::from_secs(config::clamp_timeout(
        query.timeout_override.unwrap_or(instance.timeout_secs),
    ));

    tracing::info!(
        instance = %instance.name,
        client_ip = %client_ip,
        method = %parts.method,
        target = %target,
        websocket = upgrade.is_some(),
        "Relaying request"
    );

    match upgrade {
        Some(upgrade) => ws::proxy_websocket(upgrade, instance, target, outbound, bypass).await,
        None => {
            relay::proxy_http(RelayParams {
                method: parts.method,
                body,
                instance,
                target,
                outbound,
                bypass,
                follow_redirects: query.follow_redirects,
                deadline,
                overrides: query.headers,
            })
            .await
        }
    }
}

/// An inbound request counts as a WebSocket upgrade iff it carries
/// `Connection: Upgrade` and `Upgrade: websocket`, case-insensitively.
pub fn is_upgrade_request(headers: &HeaderMap) -> bool {
    let connection_requests_upgrade = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .any(|value| {
            value
                .split(',')
                .any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
        });

    let upgrade_is_websocket = headers
        .get(header::UPGRADE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.eq_ignore_ascii_case("websocket"));

    connection_requests_upgrade && upgrade_is_websocket
}

/// Everything the HTTP relay needs for one outbound request.
pub struct RelayParams {
    pub method: Method,
    pub body: Body,
    pub instance: Arc<ProxyInstance>,
    pub target: Url,
    pub outbound: HeaderMap,
    pub bypass: TlsBypass,
    pub follow_redirects: bool,
    pub deadline: Duration,
    pub overrides: HeaderOverrides,
}

/// Determine the client IP: first entry of `X-Forwarded-For`, else
/// `X-Real-IP`, else the transport peer address.
pub fn client_ip(headers: &HeaderMap, peer: SocketAddr) -> String {
    if let Some(forwarded) = headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
    {
        if let Some(first) = forwarded.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }

    if let Some(real_ip) = headers
        .get("x-real-ip")
        .and_then(|value| value.to_str().ok())
    {
        let real_ip = real_ip.trim();
        if !real_ip.is_empty() {
            return real_ip.to_string();
        }
    }

    peer.ip().to_string()
}

fn parse_target(raw: &str) -> Result<Url, ProxyError> {
    let url = Url::parse(raw).map_err(|e| ProxyError::InvalidUrl(e.to_string()))?;
    if !matches!(url.scheme(), "http" | "https" | "ws" | "wss") {
        return Err(ProxyError::InvalidUrl(format!(
            "unsupported scheme '{}'",
            url.scheme()
        )));
    }
    if url.host_str().is_none_or(str::is_empty) {
        return Err(ProxyError::InvalidUrl("missing host".to_string()));
    }
    Ok(url)
}

/// Parsed view of the recognized query parameters.
#[derive(Debug, Default)]
pub struct ProxyQuery {
    pub target_url: String,
    pub token: Option<String>,
    pub skip_tls_checks: Option<String>,
    pub follow_redirects: bool,
    pub timeout_override: Option<u64>,
    pub headers: HeaderOverrides,
}

impl ProxyQuery {
    /// Parse the raw query string.
    ///
    /// First occurrence wins for scalar keys; later `request_header[..]` /
    /// `response_header[..]` entries override earlier ones of the same
    /// name. Unrecognized keys are ignored.
    pub fn parse(raw_query: &str) -> Result<Self, ProxyError> {
        let mut target_url: Option<String> = None;
        let mut token: Option<String> = None;
        let mut skip_tls_checks: Option<String> = None;
        let mut follow_redirects: Option<String> = None;
        let mut timeout_override: Option<u64> = None;
        let mut override_host: Option<String> = None;
        let mut bracket_host: Option<String> = None;
        let mut headers = HeaderOverrides::default();

        for (key, value) in form_urlencoded::parse(raw_query.as_bytes()) {
            let key = key.as_ref();
            let value = value.into_owned();

            if let Some(name) = bracket_name(key, "request_header") {
                if name.eq_ignore_ascii_case("host") {
                    bracket_host = Some(value);
                } else {
                    headers.request.push((name.to_string(), value));
                }
                continue;
            }
            if let Some(name) = bracket_name(key, "response_header") {
                headers.response.push((name.to_string(), value));
                continue;
            }

            match key {
                "url" => {
                    if target_url.is_none() {
                        target_url = Some(value);
                    }
                }
                "token" => {
                    if token.is_none() {
                        token = Some(value);
                    }
                }
                "skip_tls_checks" => {
                    if skip_tls_checks.is_none() {
                        skip_tls_checks = Some(value);
                    }
                }
                "follow_redirects" => {
                    if follow_redirects.is_none() {
                        follow_redirects = Some(value);
                    }
                }
                "override_host_header" => {
                    if override_host.is_none() {
                        override_host = Some(value);
                    }
                }
                "timeout" => {
                    if timeout_override.is_none() {
                        timeout_override = value.parse::<u64>().ok();
                    }
                }
                _ => {}
            }
        }

        let target_url = target_url
            .filter(|url| !url.is_empty())
            .ok_or(ProxyError::MissingUrl)?;

        headers.host = override_host.or(bracket_host);

        Ok(Self {
            target_url,
            token,
            skip_tls_checks,
            follow_redirects: follow_redirects.as_deref().is_some_and(is_truthy),
            timeout_override,
            headers,
        })
    }
}

fn bracket_name<'a>(key: &'a str, prefix: &str) -> Option<&'a str> {
    key.strip_prefix(prefix)?
        .strip_prefix('[')?
        .strip_suffix(']')
}

fn is_truthy(value: &str) -> bool {
    matches!(value.to_ascii_lowercase().as_str(), "true" | "1" | "yes")
}
