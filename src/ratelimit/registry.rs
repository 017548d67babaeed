//! Keyed registry of token buckets.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::{debug, trace};

use crate::clock::Clock;

use super::bucket::{BucketLimits, Reservation, TakeResult, TokenBucket};
use super::decision::Decision;
use super::key::LimiterKey;

/// Default idle threshold after which an untouched bucket is evicted.
pub const DEFAULT_IDLE_AFTER: Duration = Duration::from_secs(3600);

/// How a sweep decides that a bucket is idle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepPolicy {
    /// Evict buckets that have not served a take for longer than this.
    IdleFor(Duration),
    /// Evict buckets that have refilled to capacity.
    ///
    /// Cheap but approximate: a key under light, steady traffic may never
    /// be full at sweep time and so is never evicted.
    FullCapacity,
}

impl Default for SweepPolicy {
    fn default() -> Self {
        SweepPolicy::IdleFor(DEFAULT_IDLE_AFTER)
    }
}

/// Lazily creates and caches one [`TokenBucket`] per key.
///
/// The map is sharded. Creation happens inside the shard lock of the key's
/// entry, so concurrent first accesses to a key always observe one bucket.
/// Takes run while the shard is read-locked, which keeps a concurrent sweep
/// from evicting a bucket mid-take.
pub struct KeyedLimiterRegistry {
    /// Name used in logs
    name: String,
    /// Buckets indexed by key
    buckets: DashMap<LimiterKey, Arc<TokenBucket>>,
    /// Limits given to newly created buckets
    template: RwLock<BucketLimits>,
    /// Eviction rule applied by sweeps
    sweep_policy: RwLock<SweepPolicy>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for KeyedLimiterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyedLimiterRegistry")
            .field("name", &self.name)
            .field("buckets", &self.buckets.len())
            .field("template", &*self.template.read())
            .field("sweep_policy", &*self.sweep_policy.read())
            .finish()
    }
}

impl KeyedLimiterRegistry {
    /// Create an empty registry whose buckets use `limits`.
    pub fn new(name: impl Into<String>, limits: BucketLimits, clock: Arc<dyn Clock>) -> Self {
        Self {
            name: name.into(),
            buckets: DashMap::new(),
            template: RwLock::new(limits),
            sweep_policy: RwLock::new(SweepPolicy::default()),
            clock,
        }
    }

    /// Set the eviction rule used by [`sweep`](Self::sweep).
    pub fn with_sweep_policy(self, policy: SweepPolicy) -> Self {
        *self.sweep_policy.write() = policy;
        self
    }

    /// Replace the eviction rule of a shared registry.
    pub fn set_sweep_policy(&self, policy: SweepPolicy) {
        *self.sweep_policy.write() = policy;
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Limits given to new buckets.
    pub fn limits(&self) -> BucketLimits {
        *self.template.read()
    }

    pub fn sweep_policy(&self) -> SweepPolicy {
        *self.sweep_policy.read()
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Get the bucket for `key`, creating it from the template if needed.
    pub fn get_or_create(&self, key: &LimiterKey) -> Arc<TokenBucket> {
        self.get_or_create_with(key, || self.limits())
    }

    /// Get the bucket for `key`, creating it with `limits` if needed.
    ///
    /// `limits` runs inside the critical section and only on creation.
    pub fn get_or_create_with<F>(&self, key: &LimiterKey, limits: F) -> Arc<TokenBucket>
    where
        F: FnOnce() -> BucketLimits,
    {
        if let Some(bucket) = self.buckets.get(key) {
            return Arc::clone(bucket.value());
        }

        let entry = self
            .buckets
            .entry(key.clone())
            .or_insert_with(|| self.create_bucket(key, limits()));
        Arc::clone(entry.value())
    }

    /// Consume a token for `key`.
    pub fn allow(&self, key: &LimiterKey) -> bool {
        self.take(key).allowed
    }

    /// Consume a token for `key`, reporting the bucket state.
    pub fn take(&self, key: &LimiterKey) -> TakeResult {
        self.take_with(key, || self.limits())
    }

    /// Consume a token for `key` and describe the outcome.
    pub fn check(&self, key: &LimiterKey) -> Decision {
        Decision::from_take(self.take(key), self.clock.wall())
    }

    /// Consume a token for `key`, creating its bucket with `limits` if needed.
    pub fn take_with<F>(&self, key: &LimiterKey, limits: F) -> TakeResult
    where
        F: FnOnce() -> BucketLimits,
    {
        let now = self.clock.now();

        let result = if let Some(bucket) = self.buckets.get(key) {
            bucket.take(now)
        } else {
            let bucket = self
                .buckets
                .entry(key.clone())
                .or_insert_with(|| self.create_bucket(key, limits()));
            bucket.take(now)
        };

        trace!(
            registry = %self.name,
            key = %key,
            allowed = result.allowed,
            remaining = result.remaining,
            "Checked rate limit"
        );
        result
    }

    /// Probe when `key` could next take a token, without consuming one.
    ///
    /// The reservation holds the key's registered bucket, creating a full one
    /// if needed, so a later commit is charged to the same bucket as `allow`.
    pub fn reserve(&self, key: &LimiterKey) -> Reservation {
        let bucket = self.get_or_create(key);
        bucket.reserve(self.clock.now())
    }

    /// Tokens currently available for `key`, if it has a bucket.
    pub fn tokens(&self, key: &LimiterKey) -> Option<f64> {
        let now = self.clock.now();
        self.buckets.get(key).map(|bucket| bucket.tokens(now))
    }

    pub fn contains(&self, key: &LimiterKey) -> bool {
        self.buckets.contains_key(key)
    }

    /// Drop the bucket for `key`; the next request starts from a full bucket.
    pub fn remove(&self, key: &LimiterKey) -> bool {
        self.buckets.remove(key).is_some()
    }

    /// Swap the limits of one existing bucket.
    pub fn reconfigure(&self, key: &LimiterKey, limits: BucketLimits) -> bool {
        let now = self.clock.now();
        match self.buckets.get(key) {
            Some(bucket) => {
                bucket.reconfigure(limits, now);
                true
            }
            None => false,
        }
    }

    /// Swap the template and the limits of every live bucket.
    pub fn reconfigure_all(&self, limits: BucketLimits) {
        *self.template.write() = limits;

        let now = self.clock.now();
        for bucket in self.buckets.iter() {
            bucket.value().reconfigure(limits, now);
        }

        debug!(
            registry = %self.name,
            capacity = limits.capacity(),
            refill_per_second = limits.refill_per_second(),
            buckets = self.buckets.len(),
            "Reconfigured all buckets"
        );
    }

    /// Evict idle buckets according to the registry's sweep policy.
    ///
    /// Returns the number of buckets removed.
    pub fn sweep(&self) -> usize {
        self.sweep_with(self.sweep_policy())
    }

    /// Evict idle buckets according to `policy`.
    pub fn sweep_with(&self, policy: SweepPolicy) -> usize {
        let now = self.clock.now();
        let mut removed = 0;

        self.buckets.retain(|key, bucket| {
            let idle = match policy {
                SweepPolicy::IdleFor(threshold) => bucket.idle_for(now) > threshold,
                SweepPolicy::FullCapacity => bucket.is_full(now),
            };
            if idle {
                trace!(registry = %self.name, key = %key, "Evicting idle bucket");
                removed += 1;
            }
            !idle
        });

        removed
    }

    /// Get the number of live buckets.
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Drop every bucket.
    pub fn clear(&self) {
        self.buckets.clear();
    }

    fn create_bucket(&self, key: &LimiterKey, limits: BucketLimits) -> Arc<TokenBucket> {
        debug!(
            registry = %self.name,
            key = %key,
            capacity = limits.capacity(),
            refill_per_second = limits.refill_per_second(),
            "Creating new token bucket"
        );
        Arc::new(TokenBucket::new(limits, self.clock.now()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::ratelimit::decision::RejectReason;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn registry(capacity: f64, rate: f64) -> (KeyedLimiterRegistry, ManualClock) {
        let clock = ManualClock::new();
        let limits = BucketLimits::new(capacity, rate).unwrap();
        (
            KeyedLimiterRegistry::new("test", limits, Arc::new(clock.clone())),
            clock,
        )
    }

    #[test]
    fn test_registry_creation() {
        let (registry, _) = registry(1.0, 1.0);
        assert!(registry.is_empty());
        assert_eq!(registry.name(), "test");
    }

    #[test]
    fn test_first_access_creates_bucket() {
        let (registry, _) = registry(1.0, 1.0);
        let key = LimiterKey::client("10.0.0.5:1234");

        assert!(registry.allow(&key));
        assert_eq!(registry.len(), 1);
        assert!(registry.contains(&key));
    }

    #[test]
    fn test_burst_then_reject_then_refill() {
        let (registry, clock) = registry(1.0, 1.0);
        let key = LimiterKey::user("alice");

        assert!(registry.allow(&key));
        assert!(!registry.allow(&key));

        clock.advance(Duration::from_secs(1));
        assert!(registry.allow(&key));
    }

    #[test]
    fn test_keys_have_independent_buckets() {
        let (registry, _) = registry(1.0, 1.0);
        let alice = LimiterKey::user("alice");
        let bob = LimiterKey::user("bob");

        assert!(registry.allow(&alice));
        assert!(!registry.allow(&alice));
        assert!(registry.allow(&bob), "separate bucket per key");
    }

    #[test]
    fn test_get_or_create_returns_same_instance() {
        let (registry, _) = registry(5.0, 1.0);
        let key = LimiterKey::organization("org-1");

        let first = registry.get_or_create(&key);
        let second = registry.get_or_create(&key);
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_concurrent_first_access_creates_one_bucket() {
        let (registry, _) = registry(100.0, 1.0);
        let key = LimiterKey::client("10.0.0.99");
        let created = AtomicUsize::new(0);

        let buckets: Vec<Arc<TokenBucket>> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..16)
                .map(|_| {
                    s.spawn(|| {
                        registry.get_or_create_with(&key, || {
                            created.fetch_add(1, Ordering::SeqCst);
                            registry.limits()
                        })
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(created.load(Ordering::SeqCst), 1);
        assert!(buckets.iter().all(|b| Arc::ptr_eq(b, &buckets[0])));
    }

    #[test]
    fn test_concurrent_allow_has_no_lost_updates() {
        let (registry, _) = registry(50.0, 1.0);
        let key = LimiterKey::client("10.0.0.1");
        let successes = AtomicUsize::new(0);

        std::thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    for _ in 0..25 {
                        if registry.allow(&key) {
                            successes.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                });
            }
        });

        // The manual clock never moves, so no refill happens.
        assert_eq!(successes.load(Ordering::SeqCst), 50);
    }

    #[test]
    fn test_reserve_does_not_consume() {
        let (registry, _) = registry(1.0, 1.0);
        let key = LimiterKey::user("carol");

        let reservation = registry.reserve(&key);
        assert_eq!(reservation.delay(), Duration::ZERO);
        reservation.cancel();
        assert_eq!(registry.tokens(&key), Some(1.0));

        assert!(registry.allow(&key));
        let reservation = registry.reserve(&key);
        assert_eq!(reservation.delay(), Duration::from_secs(1));
        reservation.cancel();
        assert_eq!(registry.tokens(&key), Some(0.0));
    }

    #[test]
    fn test_committed_reservation_charges_registered_bucket() {
        let (registry, _) = registry(1.0, 1.0);
        let key = LimiterKey::client("10.0.0.9");
        let now = registry.clock().now();

        assert!(registry.reserve(&key).commit(now));
        assert!(!registry.allow(&key));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.tokens(&key), Some(0.0));
    }

    #[test]
    fn test_remove_resets_key() {
        let (registry, _) = registry(1.0, 1.0);
        let key = LimiterKey::user("dave");

        assert!(registry.allow(&key));
        assert!(!registry.allow(&key));
        assert!(registry.remove(&key));
        assert!(registry.allow(&key));
    }

    #[test]
    fn test_reconfigure_all_updates_template_and_buckets() {
        let (registry, clock) = registry(2.0, 2.0);
        let key = LimiterKey::client("10.0.0.2");
        assert!(registry.allow(&key));
        assert!(registry.allow(&key));

        registry.reconfigure_all(BucketLimits::new(2.0, 1.0).unwrap());
        assert_eq!(registry.limits().refill_per_second(), 1.0);

        clock.advance(Duration::from_millis(500));
        assert!(!registry.allow(&key), "half a token at the new rate");
        clock.advance(Duration::from_millis(500));
        assert!(registry.allow(&key));
    }

    #[test]
    fn test_sweep_idle_for_evicts_untouched_buckets() {
        let (registry, clock) = registry(5.0, 1.0);
        let registry = registry.with_sweep_policy(SweepPolicy::IdleFor(Duration::from_secs(60)));
        let stale = LimiterKey::client("10.0.0.1");
        let fresh = LimiterKey::client("10.0.0.2");

        assert!(registry.allow(&stale));
        clock.advance(Duration::from_secs(45));
        assert!(registry.allow(&fresh));
        clock.advance(Duration::from_secs(20));

        assert_eq!(registry.sweep(), 1);
        assert!(!registry.contains(&stale));
        assert!(registry.contains(&fresh));
    }

    #[test]
    fn test_sweep_full_capacity_heuristic() {
        let (registry, clock) = registry(2.0, 1.0);
        let busy = LimiterKey::client("10.0.0.1");
        let quiet = LimiterKey::client("10.0.0.2");

        assert!(registry.allow(&quiet));
        clock.advance(Duration::from_secs(5));
        assert!(registry.allow(&busy));

        assert_eq!(registry.sweep_with(SweepPolicy::FullCapacity), 1);
        assert!(registry.contains(&busy));
        assert!(!registry.contains(&quiet));
    }

    #[test]
    fn test_check_reports_metadata() {
        let (registry, _) = registry(2.0, 1.0);
        let key = LimiterKey::client("10.0.0.3");

        let first = registry.check(&key);
        assert!(first.allowed);
        assert_eq!(first.limit, 2);
        assert_eq!(first.remaining, 1);

        registry.check(&key);
        let rejected = registry.check(&key);
        assert!(!rejected.allowed);
        assert_eq!(rejected.reason, Some(RejectReason::SoftRateExceeded));
        assert_eq!(rejected.retry_after, Some(Duration::from_secs(1)));
    }

    #[test]
    fn test_clear() {
        let (registry, _) = registry(1.0, 1.0);
        registry.allow(&LimiterKey::user("a"));
        registry.allow(&LimiterKey::user("b"));
        assert_eq!(registry.len(), 2);

        registry.clear();
        assert_eq!(registry.len(), 0);
    }
}
