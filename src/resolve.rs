//! DNS resolution seam for target policy checks.
//!
//! Destination policy needs the target's IP address before any connection
//! is attempted. Resolution goes through the [`Resolve`] trait so tests can
//! substitute a fixed table for the system resolver.

use std::net::IpAddr;

use async_trait::async_trait;
use hickory_resolver::{
    Resolver, TokioResolver, name_server::TokioConnectionProvider, system_conf::read_system_conf,
};

/// DNS capability injected into target policy evaluation.
#[async_trait]
pub trait Resolve: Send + Sync {
    /// Resolve a hostname to a single address. `None` means the lookup
    /// failed or returned no records; callers treat that as a denial.
    async fn resolve(&self, host: &str) -> Option<IpAddr>;
}

/// Resolver backed by the system DNS configuration.
pub struct SystemResolver {
    inner: TokioResolver,
}

impl SystemResolver {
    pub fn new() -> Self {
        let inner = match read_system_conf() {
            Ok((config, opts)) => {
                Resolver::builder_with_config(config, TokioConnectionProvider::default())
                    .with_options(opts)
                    .build()
            }
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    "Failed to read system DNS config, using default"
                );
                Resolver::builder_tokio().unwrap().build()
            }
        };
        Self { inner }
    }
}

impl Default for SystemResolver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Resolve for SystemResolver {
    async fn resolve(&self, host: &str) -> Option<IpAddr> {
        match self.inner.lookup_ip(host).await {
            Ok(lookup) => lookup.iter().next(),
            Err(e) => {
                tracing::debug!(host = %host, error = %e, "DNS lookup failed");
                None
            }
        }
    }
}

/// Fixed-table resolver for tests.
#[cfg(test)]
#[derive(Default)]
pub struct StaticResolver(pub std::collections::HashMap<String, IpAddr>);

#[cfg(test)]
impl StaticResolver {
    pub fn with(entries: &[(&str, IpAddr)]) -> Self {
        Self(
            entries
                .iter()
                .map(|(host, ip)| (host.to_string(), *ip))
                .collect(),
        )
    }
}

#[cfg(test)]
#[async_trait]
impl Resolve for StaticResolver {
    async fn resolve(&self, host: &str) -> Option<IpAddr> {
        self.0.get(host).copied()
    }
}
