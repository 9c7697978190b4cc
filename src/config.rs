//! Configuration file loading.
//!
//! The proxy is configured from a single TOML file: a `[server]` table and
//! one `[instances.<name>]` table per proxy instance. Instance records are
//! plain data here; validation and CIDR parsing happen when an instance is
//! installed into the registry, so a bad instance never blocks the others.

use std::{collections::BTreeMap, net::SocketAddr, path::Path};

use serde::Deserialize;

/// Default per-request deadline in seconds.
pub const DEFAULT_TIMEOUT_SECS: u64 = 300;

/// Lower bound for the per-request deadline.
pub const MIN_TIMEOUT_SECS: u64 = 30;

/// Upper bound for the per-request deadline.
pub const MAX_TIMEOUT_SECS: u64 = 3600;

/// Clamp a timeout (from config or a query override) into the allowed range.
pub fn clamp_timeout(secs: u64) -> u64 {
    secs.clamp(MIN_TIMEOUT_SECS, MAX_TIMEOUT_SECS)
}

/// Top-level configuration file.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    /// Proxy instances keyed by name. The name becomes part of the URL.
    #[serde(default)]
    pub instances: BTreeMap<String, InstanceConfig>,
}

/// Listener settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// Address to bind, e.g. `0.0.0.0:8080`.
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,

    /// URL prefix under which instances are served: `/{prefix}/{instance}`.
    #[serde(default = "default_path_prefix")]
    pub path_prefix: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            path_prefix: default_path_prefix(),
        }
    }
}

fn default_listen() -> SocketAddr {
    "0.0.0.0:8080".parse().expect("valid literal")
}

fn default_path_prefix() -> String {
    "proxy".to_string()
}

/// One proxy instance record, as written in the config file.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InstanceConfig {
    /// Shared secrets accepted via the `token` query parameter. An instance
    /// with no tokens is rejected at setup time.
    #[serde(default)]
    pub tokens: Vec<String>,

    /// Destination restriction: `"any"`, `"external"`, `"internal"`, or a
    /// list of CIDR blocks.
    #[serde(default)]
    pub restrict_out: RestrictOutConfig,

    /// Source restriction: CIDR blocks the client IP must fall into.
    /// Empty means any client is accepted.
    #[serde(default)]
    pub restrict_in: Vec<String>,

    /// Whether the host deployment should additionally require its own
    /// authentication for this instance. The proxy only records this.
    #[serde(default)]
    pub requires_auth: bool,

    /// Per-request total deadline in seconds, clamped to 30-3600.
    #[serde(default = "default_timeout")]
    pub timeout: u64,

    /// Whether loopback addresses count as `internal` destinations.
    #[serde(default)]
    pub loopback_is_internal: bool,
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            tokens: Vec::new(),
            restrict_out: RestrictOutConfig::default(),
            restrict_in: Vec::new(),
            requires_auth: false,
            timeout: default_timeout(),
            loopback_is_internal: false,
        }
    }
}

fn default_timeout() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

/// `restrict_out` accepts either a mode name or a list of CIDR blocks.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RestrictOutConfig {
    Mode(String),
    Cidrs(Vec<String>),
}

impl Default for RestrictOutConfig {
    fn default() -> Self {
        Self::Mode("any".to_string())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigFileError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("parse error: {0}")]
    Parse(#[from] toml::de::Error),
}

const DEFAULT_CONFIG: &str = r#"# ostia configuration

[server]
listen = "0.0.0.0:8080"
path_prefix = "proxy"

[instances.default]
# Replace this token before exposing the proxy anywhere.
tokens = ["your-secret-token-here"]
# "any", "external", "internal", or a list of CIDR blocks.
restrict_out = "any"
# CIDR blocks the client IP must fall into; empty accepts any client.
restrict_in = []
requires_auth = false
# Per-request deadline in seconds (30-3600).
timeout = 300
"#;

impl Config {
    /// Load the config file, writing a commented default first if missing.
    pub fn load_or_create(path: &Path) -> Result<Self, ConfigFileError> {
        if !path.exists() {
            std::fs::write(path, DEFAULT_CONFIG)?;
            tracing::info!(path = %path.display(), "Created default configuration file");
        }
        let raw = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&raw)?)
    }
}
