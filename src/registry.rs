//! Live set of proxy instances.
//!
//! Instances are validated once at setup, published behind an `Arc`, and
//! immutable afterwards. `setup` replaces atomically, so a request that
//! captured the previous value keeps using it until the request completes;
//! a request that looks up after the replacement sees the new value, never
//! a mix of the two.

use std::sync::Arc;

use dashmap::DashMap;
use ipnet::IpNet;
use serde::Serialize;

use crate::{
    config::{self, InstanceConfig, RestrictOutConfig},
    policy::RestrictOut,
};

/// A named proxy endpoint. Immutable once published.
#[derive(Debug)]
pub struct ProxyInstance {
    pub name: String,
    pub tokens: Vec<String>,
    pub restrict_out: RestrictOut,
    pub restrict_in: Vec<IpNet>,
    pub requires_auth: bool,
    pub timeout_secs: u64,
    pub loopback_is_internal: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum SetupError {
    #[error("instance name must not be empty")]
    EmptyName,

    #[error("instance '{0}' has no tokens configured")]
    NoTokens(String),
}

impl ProxyInstance {
    /// Validate a config record into a runtime instance.
    ///
    /// An empty token set is rejected outright. Malformed `restrict_out`
    /// CIDRs are dropped with a warning; if none survive, the restriction
    /// falls back to `any`. Malformed `restrict_in` entries are dropped
    /// with a warning.
    pub fn from_config(name: &str, config: &InstanceConfig) -> Result<Self, SetupError> {
        if name.trim().is_empty() {
            return Err(SetupError::EmptyName);
        }
        if config.tokens.is_empty() {
            return Err(SetupError::NoTokens(name.to_string()));
        }

        let restrict_out = match &config.restrict_out {
            RestrictOutConfig::Mode(mode) => match mode.as_str() {
                "any" => RestrictOut::Any,
                "external" => RestrictOut::External,
                "internal" => RestrictOut::Internal,
                other => {
                    tracing::warn!(
                        instance = %name,
                        mode = %other,
                        "Unknown restrict_out mode, falling back to 'any'"
                    );
                    RestrictOut::Any
                }
            },
            RestrictOutConfig::Cidrs(cidrs) => {
                let parsed = parse_cidrs(name, "restrict_out", cidrs);
                if parsed.is_empty() {
                    tracing::warn!(
                        instance = %name,
                        "No valid restrict_out CIDRs, falling back to 'any'"
                    );
                    RestrictOut::Any
                } else {
                    RestrictOut::Custom(parsed)
                }
            }
        };

        Ok(Self {
            name: name.to_string(),
            tokens: config.tokens.clone(),
            restrict_out,
            restrict_in: parse_cidrs(name, "restrict_in", &config.restrict_in),
            requires_auth: config.requires_auth,
            timeout_secs: config::clamp_timeout(config.timeout),
            loopback_is_internal: config.loopback_is_internal,
        })
    }
}

fn parse_cidrs(instance: &str, field: &str, cidrs: &[String]) -> Vec<IpNet> {
    cidrs
        .iter()
        .filter_map(|raw| match raw.parse::<IpNet>() {
            Ok(net) => Some(net),
            Err(_) => {
                tracing::warn!(
                    instance = %instance,
                    field = %field,
                    cidr = %raw,
                    "Invalid CIDR, skipping"
                );
                None
            }
        })
        .collect()
}

/// Registry of live proxy instances keyed by name.
///
/// Lookups never block behind an update; concurrent `setup`/`teardown`
/// calls are atomic per name.
#[derive(Default)]
pub struct InstanceRegistry {
    instances: DashMap<String, Arc<ProxyInstance>>,
}

impl InstanceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and install (or replace) an instance.
    pub fn setup(&self, name: &str, config: &InstanceConfig) -> Result<(), SetupError> {
        let instance = ProxyInstance::from_config(name, config)?;
        self.instances.insert(name.to_string(), Arc::new(instance));
        Ok(())
    }

    /// Remove an instance. Returns whether it existed.
    #[allow(dead_code)] // reconfiguration hook, exercised in tests
    pub fn teardown(&self, name: &str) -> bool {
        self.instances.remove(name).is_some()
    }

    pub fn get(&self, name: &str) -> Option<Arc<ProxyInstance>> {
        self.instances.get(name).map(|entry| entry.value().clone())
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// Sanitized view of all instances, sorted by name.
    pub fn snapshot(&self) -> Vec<InstanceSnapshot> {
        let mut entries: Vec<InstanceSnapshot> = self
            .instances
            .iter()
            .map(|entry| InstanceSnapshot::of(entry.value()))
            .collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        entries
    }
}

/// Instance view for the debug endpoint. Token values are elided.
#[derive(Debug, Clone, Serialize)]
pub struct InstanceSnapshot {
    pub name: String,
    pub restrict_out: &'static str,
    pub restrict_out_cidrs: Vec<String>,
    pub restrict_in: Vec<String>,
    pub token_count: usize,
    pub requires_auth: bool,
    pub timeout: u64,
}

impl InstanceSnapshot {
    fn of(instance: &ProxyInstance) -> Self {
        let restrict_out_cidrs = match &instance.restrict_out {
            RestrictOut::Custom(cidrs) => cidrs.iter().map(|net| net.to_string()).collect(),
            _ => Vec::new(),
        };

        Self {
            name: instance.name.clone(),
            restrict_out: instance.restrict_out.variant_name(),
            restrict_out_cidrs,
            restrict_in: instance.restrict_in.iter().map(|net| net.to_string()).collect(),
            token_count: instance.tokens.len(),
            requires_auth: instance.requires_auth,
            timeout: instance.timeout_secs,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> InstanceConfig {
        InstanceConfig {
            tokens: vec!["secret".to_string()],
            ..Default::default()
        }
    }

    #[test]
    fn test_setup_rejects_empty_tokens() {
        let registry = InstanceRegistry::new();
        let config = InstanceConfig::default();
        assert!(matches!(
            registry.setup("x", &config),
            Err(SetupError::NoTokens(_))
        ));
        assert!(registry.get("x").is_none());
    }

    #[test]
    fn test_setup_rejects_empty_name() {
        let registry = InstanceRegistry::new();
        assert!(matches!(
            registry.setup("  ", &base_config()),
            Err(SetupError::EmptyName)
        ));
    }

    #[test]
    fn test_malformed_restrict_in_entries_are_dropped() {
        let mut config = base_config();
        config.restrict_in = vec!["192.168.1.0/24".to_string(), "not-a-cidr".to_string()];

        let instance = ProxyInstance::from_config("x", &config).unwrap();
        assert_eq!(instance.restrict_in.len(), 1);
    }

    #[test]
    fn test_malformed_restrict_out_falls_back_to_any() {
        let mut config = base_config();
        config.restrict_out = RestrictOutConfig::Cidrs(vec!["bogus".to_string()]);
        let instance = ProxyInstance::from_config("x", &config).unwrap();
        assert_eq!(instance.restrict_out, RestrictOut::Any);

        let mut config = base_config();
        config.restrict_out = RestrictOutConfig::Mode("everything".to_string());
        let instance = ProxyInstance::from_config("x", &config).unwrap();
        assert_eq!(instance.restrict_out, RestrictOut::Any);
    }

    #[test]
    fn test_partially_valid_restrict_out_keeps_valid_blocks() {
        let mut config = base_config();
        config.restrict_out =
            RestrictOutConfig::Cidrs(vec!["8.8.8.0/24".to_string(), "bogus".to_string()]);
        let instance = ProxyInstance::from_config("x", &config).unwrap();
        assert!(matches!(&instance.restrict_out, RestrictOut::Custom(c) if c.len() == 1));
    }

    #[test]
    fn test_timeout_clamped_at_setup() {
        let mut config = base_config();
        config.timeout = 5;
        let instance = ProxyInstance::from_config("x", &config).unwrap();
        assert_eq!(instance.timeout_secs, config::MIN_TIMEOUT_SECS);
    }

    #[test]
    fn test_put_replaces_and_inflight_arc_stays_valid() {
        let registry = InstanceRegistry::new();
        registry.setup("x", &base_config()).unwrap();

        // A request mid-flight holds the old value.
        let inflight = registry.get("x").unwrap();

        let mut updated = base_config();
        updated.tokens = vec!["rotated".to_string(), "secret".to_string()];
        registry.setup("x", &updated).unwrap();

        assert_eq!(inflight.tokens, vec!["secret"]);
        assert_eq!(registry.get("x").unwrap().tokens.len(), 2);
    }

    #[test]
    fn test_teardown() {
        let registry = InstanceRegistry::new();
        registry.setup("x", &base_config()).unwrap();
        assert!(registry.teardown("x"));
        assert!(registry.get("x").is_none());
        assert!(!registry.teardown("x"));
    }

    #[test]
    fn test_concurrent_lookups_during_updates() {
        let registry = Arc::new(InstanceRegistry::new());
        registry.setup("x", &base_config()).unwrap();

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        // Lookups must always observe a complete instance.
                        if let Some(instance) = registry.get("x") {
                            assert!(!instance.tokens.is_empty());
                        }
                    }
                })
            })
            .collect();

        let writer = {
            let registry = registry.clone();
            std::thread::spawn(move || {
                for i in 0..200 {
                    let mut config = base_config();
                    config.tokens = vec![format!("token-{i}")];
                    registry.setup("x", &config).unwrap();
                    registry.teardown("x");
                    registry.setup("x", &base_config()).unwrap();
                }
            })
        };

        for reader in readers {
            reader.join().unwrap();
        }
        writer.join().unwrap();
    }

    #[test]
    fn test_snapshot_elides_tokens() {
        let registry = InstanceRegistry::new();
        let mut config = base_config();
        config.tokens = vec!["a".to_string(), "b".to_string()];
        config.restrict_in = vec!["10.0.0.0/8".to_string()];
        registry.setup("x", &config).unwrap();

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].token_count, 2);
        assert_eq!(snapshot[0].restrict_out, "any");
        assert_eq!(snapshot[0].restrict_in, vec!["10.0.0.0/8"]);

        let json = serde_json::to_string(&snapshot[0]).unwrap();
        assert!(!json.contains("\"tokens\""));
        assert!(json.contains("\"token_count\":2"));
    }
}
