//! The fixed set of throttling policies and their backing stores.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info};

use super::clock::Clock;
use super::counter::{CounterStore, StoreStats};
use super::gate::RequestGate;
use super::policy::{LimiterPolicy, PolicyName};
use crate::config::{PolicyOverride, RateLimitingConfig};
use crate::error::{GateError, Result};

/// Observability snapshot for one policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PolicyStats {
    pub policy: PolicyName,
    pub store: String,
    pub window_secs: u64,
    pub max_requests: u64,
    pub total_keys: usize,
    pub active_keys: usize,
}

/// Policies by name, each bound to the store for its window length.
///
/// Policies that declare the same window share one store and rely on
/// distinct key prefixes to stay apart.
pub struct LimiterRegistry {
    policies: HashMap<PolicyName, Arc<LimiterPolicy>>,
    stores: HashMap<Duration, Arc<CounterStore>>,
    trust_proxy: bool,
}

impl LimiterRegistry {
    /// The five built-in policies with their default limits.
    pub fn builtin_policies(health_path: &str) -> Vec<LimiterPolicy> {
        vec![
            LimiterPolicy::general(health_path),
            LimiterPolicy::strict(),
            LimiterPolicy::authentication(),
            LimiterPolicy::upload(),
            LimiterPolicy::api_key(),
        ]
    }

    /// Register `policies`, creating one store per distinct window.
    ///
    /// Stores are created without sweepers; see [`LimiterRegistry::start`].
    pub fn new(policies: Vec<LimiterPolicy>, clock: Arc<dyn Clock>, trust_proxy: bool) -> Self {
        let mut stores: HashMap<Duration, Arc<CounterStore>> = HashMap::new();
        let mut registered = HashMap::new();

        for policy in policies {
            stores.entry(policy.window).or_insert_with(|| {
                let name = format!("window-{}s", policy.window.as_secs());
                debug!(store = %name, "Creating counter store");
                Arc::new(CounterStore::new(name, Arc::clone(&clock)))
            });
            registered.insert(policy.name, Arc::new(policy));
        }

        Self {
            policies: registered,
            stores,
            trust_proxy,
        }
    }

    /// Build the built-in policies with configured overrides applied.
    pub fn from_config(config: &RateLimitingConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        let mut policies = Self::builtin_policies(&config.health_path);
        for (name, overrides) in &config.policies {
            let name: PolicyName = name.parse()?;
            let policy = policies
                .iter_mut()
                .find(|policy| policy.name == name)
                .ok_or_else(|| GateError::Config(format!("policy {} is not registered", name)))?;
            apply_override(policy, overrides)?;
        }
        Ok(Self::new(policies, clock, config.trust_proxy))
    }

    /// Like [`LimiterRegistry::from_config`], and spawn a sweeper per store.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(config: &RateLimitingConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        if config.sweep_interval_secs == 0 {
            return Err(GateError::Config(
                "sweep_interval_secs must be greater than zero".to_string(),
            ));
        }
        let registry = Self::from_config(config, clock)?;
        let interval = Duration::from_secs(config.sweep_interval_secs);
        for store in registry.stores.values() {
            store.spawn_sweeper(interval);
        }
        info!(
            policies = registry.policies.len(),
            stores = registry.stores.len(),
            "Rate limit registry started"
        );
        Ok(registry)
    }

    pub fn policy(&self, name: PolicyName) -> Option<&Arc<LimiterPolicy>> {
        self.policies.get(&name)
    }

    /// The store backing a policy.
    pub fn store(&self, name: PolicyName) -> Option<&Arc<CounterStore>> {
        let policy = self.policies.get(&name)?;
        self.stores.get(&policy.window)
    }

    /// A request gate for a registered policy.
    pub fn gate(&self, name: PolicyName) -> Option<RequestGate> {
        let policy = self.policies.get(&name)?;
        let store = self.stores.get(&policy.window)?;
        Some(RequestGate::new(
            Arc::clone(policy),
            Arc::clone(store),
            self.trust_proxy,
        ))
    }

    pub fn trust_proxy(&self) -> bool {
        self.trust_proxy
    }

    /// Per-policy stats, in the order of [`PolicyName::ALL`].
    pub fn stats(&self) -> Vec<PolicyStats> {
        PolicyName::ALL
            .into_iter()
            .filter_map(|name| {
                let policy = self.policies.get(&name)?;
                let store = self.stores.get(&policy.window)?;
                let StoreStats {
                    total_keys,
                    active_keys,
                } = store.stats();
                Some(PolicyStats {
                    policy: name,
                    store: store.name().to_string(),
                    window_secs: policy.window.as_secs(),
                    max_requests: policy.max_requests,
                    total_keys,
                    active_keys,
                })
            })
            .collect()
    }

    /// Evict one key from a policy's store.
    pub fn reset(&self, name: PolicyName, key: &str) -> Result<bool> {
        let store = self
            .store(name)
            .ok_or_else(|| GateError::NotFound(format!("policy {} is not registered", name)))?;
        Ok(store.reset(key))
    }

    /// Evict every key from every store.
    pub fn reset_all(&self) {
        for store in self.stores.values() {
            store.reset_all();
        }
    }

    /// Stop every store's sweeper.
    pub async fn shutdown(&self) {
        for store in self.stores.values() {
            store.shutdown().await;
        }
        info!("Rate limit registry stopped");
    }
}

impl std::fmt::Debug for LimiterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LimiterRegistry")
            .field("policies", &self.policies.keys().collect::<Vec<_>>())
            .field("stores", &self.stores.len())
            .field("trust_proxy", &self.trust_proxy)
            .finish()
    }
}

fn apply_override(policy: &mut LimiterPolicy, overrides: &PolicyOverride) -> Result<()> {
    if let Some(secs) = overrides.window_secs {
        if secs == 0 {
            return Err(GateError::Config(format!(
                "policy {}: window_secs must be greater than zero",
                policy.name
            )));
        }
        policy.window = Duration::from_secs(secs);
    }
    if let Some(max) = overrides.max_requests {
        policy.max_requests = max;
    }
    if let Some(message) = &overrides.message {
        policy.message = message.clone();
    }
    if let Some(on_success) = overrides.compensate_on_success {
        policy.compensate.on_success = on_success;
    }
    if let Some(on_failure) = overrides.compensate_on_failure {
        policy.compensate.on_failure = on_failure;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::clock::MockClock;

    fn clock() -> Arc<dyn Clock> {
        Arc::new(MockClock::default())
    }

    #[test]
    fn test_builtin_table() {
        let registry = LimiterRegistry::from_config(&RateLimitingConfig::default(), clock()).unwrap();

        let expect = [
            (PolicyName::General, 15 * 60, 100),
            (PolicyName::Strict, 5 * 60, 10),
            (PolicyName::Authentication, 15 * 60, 5),
            (PolicyName::Upload, 60 * 60, 50),
            (PolicyName::ApiKey, 60 * 60, 1000),
        ];
        for (name, window_secs, max) in expect {
            let policy = registry.policy(name).unwrap();
            assert_eq!(policy.window.as_secs(), window_secs, "{}", name);
            assert_eq!(policy.max_requests, max, "{}", name);
        }
    }

    #[test]
    fn test_policies_share_store_by_window() {
        let registry = LimiterRegistry::from_config(&RateLimitingConfig::default(), clock()).unwrap();

        let general = registry.store(PolicyName::General).unwrap();
        let auth = registry.store(PolicyName::Authentication).unwrap();
        let strict = registry.store(PolicyName::Strict).unwrap();
        let upload = registry.store(PolicyName::Upload).unwrap();
        let api = registry.store(PolicyName::ApiKey).unwrap();

        assert!(Arc::ptr_eq(general, auth));
        assert!(Arc::ptr_eq(upload, api));
        assert!(!Arc::ptr_eq(general, strict));
        assert!(!Arc::ptr_eq(general, upload));
    }

    #[test]
    fn test_overrides_applied() {
        let yaml = r#"
policies:
  authentication:
    max_requests: 3
    window_secs: 60
    compensate_on_success: false
  upload:
    message: "Slow down on uploads"
"#;
        let config: RateLimitingConfig = serde_yaml::from_str(yaml).unwrap();
        let registry = LimiterRegistry::from_config(&config, clock()).unwrap();

        let auth = registry.policy(PolicyName::Authentication).unwrap();
        assert_eq!(auth.max_requests, 3);
        assert_eq!(auth.window, Duration::from_secs(60));
        assert!(!auth.compensate.on_success);
        assert_eq!(
            registry.policy(PolicyName::Upload).unwrap().message,
            "Slow down on uploads"
        );
        // The overridden window gets a store of its own.
        assert!(!Arc::ptr_eq(
            registry.store(PolicyName::Authentication).unwrap(),
            registry.store(PolicyName::General).unwrap()
        ));
    }

    #[test]
    fn test_unknown_policy_rejected() {
        let mut config = RateLimitingConfig::default();
        config
            .policies
            .insert("burst".to_string(), PolicyOverride::default());
        let err = LimiterRegistry::from_config(&config, clock()).unwrap_err();
        assert!(matches!(err, GateError::Config(_)));
    }

    #[test]
    fn test_zero_window_rejected() {
        let mut config = RateLimitingConfig::default();
        config.policies.insert(
            "strict".to_string(),
            PolicyOverride {
                window_secs: Some(0),
                ..PolicyOverride::default()
            },
        );
        assert!(LimiterRegistry::from_config(&config, clock()).is_err());
    }

    #[test]
    fn test_stats_and_reset() {
        let registry = LimiterRegistry::from_config(&RateLimitingConfig::default(), clock()).unwrap();
        let store = registry.store(PolicyName::Strict).unwrap();
        store.increment("strict:ip:10.0.0.1", Duration::from_secs(300));

        let stats = registry.stats();
        assert_eq!(stats.len(), 5);
        let strict = stats.iter().find(|s| s.policy == PolicyName::Strict).unwrap();
        assert_eq!(strict.active_keys, 1);
        assert_eq!(strict.store, "window-300s");

        assert!(registry.reset(PolicyName::Strict, "strict:ip:10.0.0.1").unwrap());
        assert!(!registry.reset(PolicyName::Strict, "strict:ip:10.0.0.1").unwrap());

        store.increment("strict:ip:10.0.0.2", Duration::from_secs(300));
        registry.reset_all();
        assert_eq!(store.stats().total_keys, 0);
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let registry = LimiterRegistry::start(&RateLimitingConfig::default(), clock()).unwrap();
        for name in PolicyName::ALL {
            assert!(registry.store(name).unwrap().has_sweeper());
        }
        registry.shutdown().await;
        for name in PolicyName::ALL {
            assert!(!registry.store(name).unwrap().has_sweeper());
        }
    }
}
