//! Common admission trait over the keyed limiters.

use async_trait::async_trait;

use super::adaptive::AdaptiveLimiter;
use super::breaker::CircuitBreakerLimiter;
use super::decision::Decision;
use super::key::LimiterKey;
use super::organization::QuotaGatedLimiter;
use super::registry::KeyedLimiterRegistry;

/// Trait for limiters that admit or reject a request for a single key.
///
/// This lets callers such as the request pipeline or the simulator drive any
/// limiter without knowing whether it consults an external quota store.
#[async_trait]
pub trait AdmissionBackend: Send + Sync {
    /// Admit or reject one request for `key`, consuming a token on success.
    async fn admit(&self, key: &LimiterKey) -> Decision;
}

#[async_trait]
impl AdmissionBackend for KeyedLimiterRegistry {
    async fn admit(&self, key: &LimiterKey) -> Decision {
        self.check(key)
    }
}

#[async_trait]
impl AdmissionBackend for AdaptiveLimiter {
    async fn admit(&self, key: &LimiterKey) -> Decision {
        self.check(key)
    }
}

#[async_trait]
impl AdmissionBackend for CircuitBreakerLimiter {
    async fn admit(&self, key: &LimiterKey) -> Decision {
        self.check(key)
    }
}

/// Keys are organization identifiers.
#[async_trait]
impl AdmissionBackend for QuotaGatedLimiter {
    async fn admit(&self, key: &LimiterKey) -> Decision {
        self.check_and_consume(key.as_str()).await
    }
}
