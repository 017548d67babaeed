//! Rate limiting gated by a circuit breaker.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{Result, TurnstileError};

use super::decision::{Decision, RejectReason};
use super::key::LimiterKey;
use super::registry::KeyedLimiterRegistry;

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation
    Closed,
    /// Shedding all load
    Open,
    /// Letting trial traffic through to detect recovery
    HalfOpen,
}

/// Thresholds for a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerSettings {
    /// Failures that open the circuit
    pub failure_threshold: u32,
    /// Time after the last failure before trial traffic is allowed
    pub recovery_timeout: Duration,
}

impl BreakerSettings {
    pub fn validate(&self) -> Result<()> {
        if self.failure_threshold == 0 {
            return Err(TurnstileError::invalid("failure_threshold", 0.0));
        }
        if self.recovery_timeout.is_zero() {
            return Err(TurnstileError::invalid("recovery_timeout", 0.0));
        }
        Ok(())
    }
}

/// The outcome of a downstream call, reported by the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    pub success: bool,
    pub detail: Option<String>,
}

impl Outcome {
    pub fn success() -> Self {
        Self {
            success: true,
            detail: None,
        }
    }

    pub fn failure(detail: impl Into<String>) -> Self {
        Self {
            success: false,
            detail: Some(detail.into()),
        }
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    last_failure_at: Option<Instant>,
}

/// A keyed rate limiter behind a Closed/Open/HalfOpen circuit breaker.
///
/// The breaker only moves on [`record_failure`](Self::record_failure) and
/// [`record_success`](Self::record_success), plus the Open to HalfOpen
/// transition that a check performs once the recovery timeout has passed.
/// Rate-limit rejections never count as failures.
#[derive(Debug)]
pub struct CircuitBreakerLimiter {
    settings: BreakerSettings,
    breaker: Mutex<BreakerState>,
    registry: Arc<KeyedLimiterRegistry>,
}

impl CircuitBreakerLimiter {
    pub fn new(settings: BreakerSettings, registry: Arc<KeyedLimiterRegistry>) -> Result<Self> {
        settings.validate()?;
        Ok(Self {
            settings,
            breaker: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failure_count: 0,
                last_failure_at: None,
            }),
            registry,
        })
    }

    /// Whether a request for `key` may proceed.
    pub fn check_limit(&self, key: &LimiterKey) -> bool {
        self.check(key).allowed
    }

    /// Check the breaker, then the rate limit for `key`.
    pub fn check(&self, key: &LimiterKey) -> Decision {
        if let Some(wait) = self.gate() {
            debug!(key = %key, "Circuit open, rejecting request");
            let clock = self.registry.clock();
            let reset_at = clock.wall()
                + chrono::TimeDelta::from_std(wait).unwrap_or_else(|_| chrono::TimeDelta::zero());
            return Decision::reject(
                RejectReason::CircuitOpen,
                self.registry.limits().capacity().floor() as u64,
                0,
                reset_at,
                wait,
            );
        }

        self.registry.check(key)
    }

    /// Returns the remaining open time when the circuit rejects.
    fn gate(&self) -> Option<Duration> {
        let now = self.registry.clock().now();
        let mut breaker = self.breaker.lock();

        if breaker.state != CircuitState::Open {
            return None;
        }

        let since_failure = breaker
            .last_failure_at
            .map(|at| now.saturating_duration_since(at))
            .unwrap_or(Duration::MAX);

        if since_failure > self.settings.recovery_timeout {
            breaker.state = CircuitState::HalfOpen;
            info!(
                failure_count = breaker.failure_count,
                "Circuit breaker half-open, allowing trial traffic"
            );
            None
        } else {
            Some(self.settings.recovery_timeout - since_failure)
        }
    }

    /// Report a failed downstream call.
    pub fn record_failure(&self) {
        let now = self.registry.clock().now();
        let mut breaker = self.breaker.lock();

        breaker.failure_count = breaker.failure_count.saturating_add(1);
        breaker.last_failure_at = Some(now);

        match breaker.state {
            CircuitState::Closed if breaker.failure_count >= self.settings.failure_threshold => {
                breaker.state = CircuitState::Open;
                warn!(
                    failure_count = breaker.failure_count,
                    threshold = self.settings.failure_threshold,
                    "Circuit breaker opened"
                );
            }
            CircuitState::HalfOpen => {
                breaker.state = CircuitState::Open;
                warn!("Trial request failed, circuit breaker re-opened");
            }
            _ => {}
        }
    }

    /// Report a successful downstream call.
    ///
    /// Resets the failure count. Closes the circuit when half-open; a late
    /// success while open does not close it.
    pub fn record_success(&self) {
        let mut breaker = self.breaker.lock();
        breaker.failure_count = 0;

        if breaker.state == CircuitState::HalfOpen {
            breaker.state = CircuitState::Closed;
            info!("Circuit breaker closed");
        }
    }

    /// Report an outcome.
    pub fn record_outcome(&self, outcome: &Outcome) {
        if outcome.success {
            self.record_success();
        } else {
            debug!(detail = ?outcome.detail, "Downstream failure reported");
            self.record_failure();
        }
    }

    pub fn state(&self) -> CircuitState {
        self.breaker.lock().state
    }

    pub fn failure_count(&self) -> u32 {
        self.breaker.lock().failure_count
    }

    pub fn settings(&self) -> BreakerSettings {
        self.settings
    }

    pub fn registry(&self) -> &Arc<KeyedLimiterRegistry> {
        &self.registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::ratelimit::bucket::BucketLimits;

    fn breaker(threshold: u32, timeout: Duration) -> (CircuitBreakerLimiter, ManualClock) {
        let clock = ManualClock::new();
        let registry = Arc::new(KeyedLimiterRegistry::new(
            "breaker",
            BucketLimits::new(100.0, 100.0).unwrap(),
            Arc::new(clock.clone()),
        ));
        let settings = BreakerSettings {
            failure_threshold: threshold,
            recovery_timeout: timeout,
        };
        (CircuitBreakerLimiter::new(settings, registry).unwrap(), clock)
    }

    #[test]
    fn test_starts_closed() {
        let (breaker, _) = breaker(3, Duration::from_secs(10));
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.check_limit(&LimiterKey::client("10.0.0.1")));
    }

    #[test]
    fn test_opens_after_exactly_threshold_failures() {
        let (breaker, _) = breaker(3, Duration::from_secs(10));

        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);

        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(breaker.failure_count(), 3);
    }

    #[test]
    fn test_open_rejects_without_consuming_tokens() {
        let (breaker, _) = breaker(1, Duration::from_secs(10));
        let key = LimiterKey::client("10.0.0.1");

        breaker.record_failure();
        let decision = breaker.check(&key);

        assert!(!decision.allowed);
        assert_eq!(decision.reason, Some(RejectReason::CircuitOpen));
        assert_eq!(decision.retry_after, Some(Duration::from_secs(10)));
        assert!(!breaker.registry().contains(&key));
    }

    #[test]
    fn test_half_open_only_after_recovery_timeout() {
        let (breaker, clock) = breaker(1, Duration::from_secs(10));
        let key = LimiterKey::client("10.0.0.1");

        breaker.record_failure();

        clock.advance(Duration::from_secs(10));
        assert!(!breaker.check_limit(&key), "timeout must be exceeded, not just reached");
        assert_eq!(breaker.state(), CircuitState::Open);

        clock.advance(Duration::from_millis(1));
        assert!(breaker.check_limit(&key));
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
    }

    #[test]
    fn test_half_open_success_closes() {
        let (breaker, clock) = breaker(2, Duration::from_secs(5));
        breaker.record_failure();
        breaker.record_failure();

        clock.advance(Duration::from_secs(6));
        assert!(breaker.check_limit(&LimiterKey::client("10.0.0.1")));

        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.failure_count(), 0);
    }

    #[test]
    fn test_half_open_failure_reopens_and_restarts_timer() {
        let (breaker, clock) = breaker(1, Duration::from_secs(5));
        let key = LimiterKey::client("10.0.0.1");
        breaker.record_failure();

        clock.advance(Duration::from_secs(6));
        assert!(breaker.check_limit(&key));
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);

        clock.advance(Duration::from_secs(3));
        assert!(!breaker.check_limit(&key));
        clock.advance(Duration::from_secs(3));
        assert!(breaker.check_limit(&key));
    }

    #[test]
    fn test_success_resets_failure_count_when_closed() {
        let (breaker, _) = breaker(3, Duration::from_secs(5));

        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn test_late_success_does_not_close_open_circuit() {
        let (breaker, _) = breaker(1, Duration::from_secs(5));
        breaker.record_failure();

        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(breaker.failure_count(), 0);
    }

    #[test]
    fn test_rate_limit_applies_when_closed() {
        let clock = ManualClock::new();
        let registry = Arc::new(KeyedLimiterRegistry::new(
            "breaker",
            BucketLimits::new(1.0, 1.0).unwrap(),
            Arc::new(clock),
        ));
        let settings = BreakerSettings {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(30),
        };
        let breaker = CircuitBreakerLimiter::new(settings, registry).unwrap();
        let key = LimiterKey::client("10.0.0.1");

        assert!(breaker.check_limit(&key));
        let decision = breaker.check(&key);
        assert_eq!(decision.reason, Some(RejectReason::SoftRateExceeded));
        assert_eq!(breaker.state(), CircuitState::Closed, "rate rejections are not failures");
    }

    #[test]
    fn test_record_outcome() {
        let (breaker, _) = breaker(1, Duration::from_secs(5));

        breaker.record_outcome(&Outcome::failure("database rejected query"));
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn test_invalid_settings_rejected() {
        let registry = Arc::new(KeyedLimiterRegistry::new(
            "breaker",
            BucketLimits::new(1.0, 1.0).unwrap(),
            Arc::new(ManualClock::new()),
        ));
        let settings = BreakerSettings {
            failure_threshold: 0,
            recovery_timeout: Duration::from_secs(1),
        };
        assert!(CircuitBreakerLimiter::new(settings, registry).is_err());
    }
}
