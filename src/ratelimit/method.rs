//! Per-method limiter keyed by method and client.

use std::collections::HashMap;
use std::sync::Arc;

use crate::clock::Clock;
use crate::error::Result;

use super::bucket::BucketLimits;
use super::decision::Decision;
use super::key::LimiterKey;
use super::registry::KeyedLimiterRegistry;
use super::rules::{MethodRules, DEFAULT_METHOD_BURST, DEFAULT_METHOD_RPS};

/// Rate limits each `(method, client)` pair with the method's own rule.
#[derive(Debug)]
pub struct MethodLimiter {
    registry: Arc<KeyedLimiterRegistry>,
    limits: HashMap<String, BucketLimits>,
}

impl MethodLimiter {
    /// Build from rules, falling back to 100 rps / burst 200.
    pub fn new(rules: &MethodRules, clock: Arc<dyn Clock>) -> Result<Self> {
        let fallback = BucketLimits::new(DEFAULT_METHOD_BURST, DEFAULT_METHOD_RPS)?;
        Self::with_default(rules, fallback, clock)
    }

    /// Build from rules with an explicit fallback for unlisted methods.
    pub fn with_default(rules: &MethodRules, fallback: BucketLimits, clock: Arc<dyn Clock>) -> Result<Self> {
        let mut limits = HashMap::with_capacity(rules.methods.len());
        for rule in &rules.methods {
            limits.insert(rule.method.clone(), rule.limits()?);
        }

        Ok(Self {
            registry: Arc::new(KeyedLimiterRegistry::new("method", fallback, clock)),
            limits,
        })
    }

    /// Limits applied to `method`.
    pub fn limits_for(&self, method: &str) -> BucketLimits {
        self.limits
            .get(method)
            .copied()
            .unwrap_or_else(|| self.registry.limits())
    }

    /// Whether `client` may call `method`.
    pub fn check_limit(&self, method: &str, client: &str) -> bool {
        self.check(method, client).allowed
    }

    /// Check `method` for `client` and describe the outcome.
    pub fn check(&self, method: &str, client: &str) -> Decision {
        let key = LimiterKey::method(method, client);
        let take = self.registry.take_with(&key, || self.limits_for(method));
        Decision::from_take(take, self.registry.clock().wall())
    }

    pub fn registry(&self) -> &Arc<KeyedLimiterRegistry> {
        &self.registry
    }
}
