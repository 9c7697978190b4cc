//! Access-control decisions: client IP, token, and target destination.
//!
//! The three checks run in a fixed order per request — client, then token,
//! then target — so the cheap local checks come first and an
//! unauthenticated client can never trigger a DNS lookup for an
//! attacker-chosen name.

use std::net::IpAddr;

use ipnet::IpNet;
use once_cell::sync::Lazy;
use subtle::ConstantTimeEq;
use url::{Host, Url};

use crate::resolve::Resolve;

/// Private ranges that bound the `external` / `internal` variants.
static PRIVATE_RANGES: Lazy<[IpNet; 3]> = Lazy::new(|| {
    [
        "10.0.0.0/8".parse().expect("valid literal"),
        "172.16.0.0/12".parse().expect("valid literal"),
        "192.168.0.0/16".parse().expect("valid literal"),
    ]
});

/// Destination restriction attached to a proxy instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestrictOut {
    /// Any resolvable destination.
    Any,
    /// Destinations outside the private ranges (and not loopback).
    External,
    /// Destinations inside the private ranges.
    Internal,
    /// Destinations inside at least one of the given blocks.
    Custom(Vec<IpNet>),
}

impl RestrictOut {
    pub fn variant_name(&self) -> &'static str {
        match self {
            Self::Any => "any",
            Self::External => "external",
            Self::Internal => "internal",
            Self::Custom(_) => "custom",
        }
    }
}

fn is_private(ip: IpAddr) -> bool {
    PRIVATE_RANGES.iter().any(|net| net.contains(&ip))
}

/// Whether a client IP may use an instance.
///
/// An empty `restrict_in` accepts any client. An IP that does not parse is
/// rejected whenever a restriction is configured.
pub fn client_allowed(client_ip: &str, restrict_in: &[IpNet]) -> bool {
    if restrict_in.is_empty() {
        return true;
    }
    match client_ip.parse::<IpAddr>() {
        Ok(ip) => restrict_in.iter().any(|net| net.contains(&ip)),
        Err(_) => false,
    }
}

/// Whether a presented token matches one of the instance's tokens.
///
/// Fail-closed: an empty configured set accepts nobody, as does a missing
/// or empty presented token. Each candidate comparison is constant-time in
/// the string contents.
pub fn token_valid(presented: Option<&str>, tokens: &[String]) -> bool {
    if tokens.is_empty() {
        return false;
    }
    let Some(presented) = presented else {
        return false;
    };
    if presented.is_empty() {
        return false;
    }

    let mut matched = false;
    for token in tokens {
        matched |= bool::from(presented.as_bytes().ct_eq(token.as_bytes()));
    }
    matched
}

/// Whether the target URL's destination IP is reachable for this instance.
///
/// Literal IP hosts are used directly; domain hosts go through the injected
/// resolver. Resolution failure denies.
pub async fn target_allowed(
    target: &Url,
    restrict_out: &RestrictOut,
    loopback_is_internal: bool,
    resolver: &dyn Resolve,
) -> bool {
    if !matches!(target.scheme(), "http" | "https" | "ws" | "wss") {
        return false;
    }

    let ip = match target.host() {
        Some(Host::Ipv4(ip)) => IpAddr::V4(ip),
        Some(Host::Ipv6(ip)) => IpAddr::V6(ip),
        Some(Host::Domain(domain)) => match resolver.resolve(domain).await {
            Some(ip) => ip,
            None => {
                tracing::warn!(host = %domain, "DNS resolution failed, denying target");
                return false;
            }
        },
        None => return false,
    };

    match restrict_out {
        RestrictOut::Any => true,
        RestrictOut::External => !is_private(ip) && !ip.is_loopback(),
        RestrictOut::Internal => is_private(ip) || (loopback_is_internal && ip.is_loopback()),
        RestrictOut::Custom(cidrs) => cidrs.iter().any(|net| net.contains(&ip)),
    }
}
