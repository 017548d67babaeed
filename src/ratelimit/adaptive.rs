//! Load-adaptive rate limiting.

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info};

use crate::clock::Clock;
use crate::error::{Result, TurnstileError};

use super::bucket::BucketLimits;
use super::decision::Decision;
use super::key::LimiterKey;
use super::registry::KeyedLimiterRegistry;

/// Rate bounds for an [`AdaptiveLimiter`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdaptiveBounds {
    pub base_rps: f64,
    pub min_rps: f64,
    pub max_rps: f64,
    pub burst: f64,
}

impl AdaptiveBounds {
    pub fn validate(&self) -> Result<()> {
        for (field, value) in [
            ("base_rps", self.base_rps),
            ("min_rps", self.min_rps),
            ("max_rps", self.max_rps),
            ("burst", self.burst),
        ] {
            if !(value.is_finite() && value > 0.0) {
                return Err(TurnstileError::invalid(field, value));
            }
        }
        if self.min_rps > self.max_rps {
            return Err(TurnstileError::invalid("min_rps", self.min_rps));
        }
        Ok(())
    }

    /// Rate for a load factor, clamped to `[min_rps, max_rps]`.
    pub fn rate_for(&self, load_factor: f64) -> f64 {
        (self.base_rps / load_factor).clamp(self.min_rps, self.max_rps)
    }
}

#[derive(Debug, Clone, Copy)]
struct AdaptiveState {
    load_factor: f64,
    rps: f64,
}

/// A keyed limiter whose rate follows an externally reported load factor.
///
/// A load factor of 1.0 means nominal load. The effective rate is
/// `base_rps / factor`, clamped to the configured bounds. The burst stays
/// fixed.
#[derive(Debug)]
pub struct AdaptiveLimiter {
    bounds: AdaptiveBounds,
    state: RwLock<AdaptiveState>,
    registry: Arc<KeyedLimiterRegistry>,
}

impl AdaptiveLimiter {
    pub fn new(bounds: AdaptiveBounds, clock: Arc<dyn Clock>) -> Result<Self> {
        bounds.validate()?;

        let rps = bounds.rate_for(1.0);
        let limits = BucketLimits::new(bounds.burst, rps)?;

        Ok(Self {
            bounds,
            state: RwLock::new(AdaptiveState { load_factor: 1.0, rps }),
            registry: Arc::new(KeyedLimiterRegistry::new("adaptive", limits, clock)),
        })
    }

    /// Rescale the rate from a new load factor.
    ///
    /// Zero, negative and non-finite factors are rejected and leave the
    /// current rate in place.
    pub fn update_load_factor(&self, load_factor: f64) -> Result<f64> {
        if !(load_factor.is_finite() && load_factor > 0.0) {
            return Err(TurnstileError::InvalidLoadFactor(load_factor));
        }

        let rps = self.bounds.rate_for(load_factor);
        let limits = BucketLimits::new(self.bounds.burst, rps)?;

        // Holding the state lock orders concurrent updates so the registry
        // always ends up with the limits of the last recorded factor.
        let mut state = self.state.write();
        let previous = state.rps;
        *state = AdaptiveState { load_factor, rps };
        if previous != rps {
            self.registry.reconfigure_all(limits);
            info!(load_factor, previous_rps = previous, rps, "Adjusted adaptive rate");
        } else {
            debug!(load_factor, rps, "Adaptive rate unchanged");
        }

        Ok(rps)
    }

    /// Whether `key` may proceed at the current rate.
    pub fn allow(&self, key: &LimiterKey) -> bool {
        self.registry.allow(key)
    }

    /// Check `key` and describe the outcome.
    pub fn check(&self, key: &LimiterKey) -> Decision {
        self.registry.check(key)
    }

    /// The effective requests per second.
    pub fn current_rps(&self) -> f64 {
        self.state.read().rps
    }

    /// The last accepted load factor.
    pub fn load_factor(&self) -> f64 {
        self.state.read().load_factor
    }

    pub fn bounds(&self) -> AdaptiveBounds {
        self.bounds
    }

    pub fn registry(&self) -> &Arc<KeyedLimiterRegistry> {
        &self.registry
    }
}
