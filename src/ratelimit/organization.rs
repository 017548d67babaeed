//! Organization-level admission: hard quota plus soft token-bucket shaping.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, error, info, trace, warn};

use crate::error::Result;
use crate::quota::{OracleError, QuotaOracle, ResourceKind};

use super::bucket::BucketLimits;
use super::decision::{next_hour_boundary, until, Decision, RejectReason};
use super::key::LimiterKey;
use super::registry::KeyedLimiterRegistry;

/// Hourly ceiling assumed when the oracle cannot be reached.
pub const DEFAULT_CALLS_PER_HOUR: u64 = 1000;
/// Smallest burst given to an organization bucket.
pub const MIN_BURST: u64 = 10;

/// Policy knobs for a [`QuotaGatedLimiter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrganizationPolicy {
    /// Ceiling used for new buckets while the oracle is unavailable
    pub default_calls_per_hour: u64,
    /// Floor for the burst of every organization bucket
    pub min_burst: u64,
    /// Admit requests when the oracle fails instead of rejecting them
    pub fail_open: bool,
}

impl Default for OrganizationPolicy {
    fn default() -> Self {
        Self {
            default_calls_per_hour: DEFAULT_CALLS_PER_HOUR,
            min_burst: MIN_BURST,
            fail_open: true,
        }
    }
}

/// Bucket limits for an hourly ceiling: `ceiling / 3600` per second with a
/// burst of a tenth of the ceiling, but never less than `min_burst`.
pub fn hourly_bucket_limits(ceiling_per_hour: u64, min_burst: u64) -> Result<BucketLimits> {
    let burst = (ceiling_per_hour / 10).max(min_burst);
    BucketLimits::per_hour(ceiling_per_hour, burst)
}

/// Per-organization admission.
///
/// Every request first consults the quota oracle: an exhausted hourly ceiling
/// rejects outright. Otherwise the organization's token bucket, sized from
/// the quota seen when it was created, shapes the traffic. Admitted requests
/// are recorded against the oracle in a detached task.
///
/// When the oracle fails the limiter fails open by default: the cached
/// bucket, or a conservative default one, still applies, but the hard
/// ceiling does not.
pub struct QuotaGatedLimiter {
    oracle: Arc<dyn QuotaOracle>,
    registry: Arc<KeyedLimiterRegistry>,
    policy: OrganizationPolicy,
    fallback: BucketLimits,
    oracle_degraded: AtomicBool,
}

impl std::fmt::Debug for QuotaGatedLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuotaGatedLimiter")
            .field("registry", &self.registry)
            .field("policy", &self.policy)
            .field("oracle_degraded", &self.oracle_degraded)
            .finish()
    }
}

impl QuotaGatedLimiter {
    pub fn new(
        oracle: Arc<dyn QuotaOracle>,
        registry: Arc<KeyedLimiterRegistry>,
        policy: OrganizationPolicy,
    ) -> Result<Self> {
        let fallback = hourly_bucket_limits(policy.default_calls_per_hour, policy.min_burst)?;
        Ok(Self {
            oracle,
            registry,
            policy,
            fallback,
            oracle_degraded: AtomicBool::new(false),
        })
    }

    /// Admit or reject one request for `org_id`, consuming quota on success.
    pub async fn check_and_consume(&self, org_id: &str) -> Decision {
        let key = LimiterKey::organization(org_id);

        // No limiter lock is held across the oracle call.
        let snapshot = match self.oracle.get_quota(org_id).await {
            Ok(snapshot) => {
                self.mark_healthy();
                Some(snapshot)
            }
            Err(e) => {
                self.mark_degraded(org_id, &e);
                None
            }
        };

        let now = self.registry.clock().wall();
        let reset_at = next_hour_boundary(now);

        let limits = match &snapshot {
            Some(snapshot) if snapshot.is_exhausted() => {
                debug!(
                    organization_id = %org_id,
                    used = snapshot.used_this_hour,
                    ceiling = snapshot.ceiling_per_hour,
                    "API quota exceeded"
                );
                return Decision::reject(
                    RejectReason::HardQuotaExceeded,
                    snapshot.ceiling_per_hour,
                    0,
                    reset_at,
                    until(now, reset_at),
                );
            }
            Some(snapshot) => {
                hourly_bucket_limits(snapshot.ceiling_per_hour, self.policy.min_burst).unwrap_or(self.fallback)
            }
            None if self.policy.fail_open => self.fallback,
            None => {
                return Decision::reject(
                    RejectReason::QuotaUnavailable,
                    self.fallback.hourly_limit(),
                    0,
                    reset_at,
                    until(now, reset_at),
                );
            }
        };

        let take = self.registry.take_with(&key, || limits);
        let limit = take.limits.hourly_limit();
        let remaining = take.remaining.max(0.0).floor() as u64;

        if !take.allowed {
            debug!(organization_id = %org_id, "Organization rate limit exceeded");
            return Decision::reject(
                RejectReason::SoftRateExceeded,
                limit,
                remaining,
                reset_at,
                until(now, reset_at),
            );
        }

        self.record_usage(org_id);
        trace!(organization_id = %org_id, remaining, "Organization request admitted");
        Decision::allow(limit, remaining, reset_at)
    }

    /// Drop the organization's bucket so the next request sizes a new one
    /// from a fresh quota snapshot.
    pub fn invalidate(&self, org_id: &str) -> bool {
        self.registry.remove(&LimiterKey::organization(org_id))
    }

    /// Resize the organization's bucket in place for a new hourly ceiling.
    ///
    /// Returns `false` when the organization has no bucket yet.
    pub fn resize(&self, org_id: &str, ceiling_per_hour: u64) -> Result<bool> {
        let limits = hourly_bucket_limits(ceiling_per_hour, self.policy.min_burst)?;
        let resized = self.registry.reconfigure(&LimiterKey::organization(org_id), limits);
        if resized {
            info!(organization_id = %org_id, ceiling_per_hour, "Resized organization bucket");
        }
        Ok(resized)
    }

    /// Whether the last oracle call failed.
    pub fn is_oracle_degraded(&self) -> bool {
        self.oracle_degraded.load(Ordering::Acquire)
    }

    pub fn policy(&self) -> OrganizationPolicy {
        self.policy
    }

    pub fn registry(&self) -> &Arc<KeyedLimiterRegistry> {
        &self.registry
    }

    fn record_usage(&self, org_id: &str) {
        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                error!(organization_id = %org_id, "No async runtime, API usage not recorded");
                return;
            }
        };

        let oracle = Arc::clone(&self.oracle);
        let org_id = org_id.to_string();
        handle.spawn(async move {
            if let Err(e) = oracle.increment_usage(&org_id, ResourceKind::Api).await {
                error!(organization_id = %org_id, error = %e, "Failed to increment API usage");
            }
        });
    }

    // Warn once per outage, not once per request.
    fn mark_degraded(&self, org_id: &str, e: &OracleError) {
        if !self.oracle_degraded.swap(true, Ordering::AcqRel) {
            warn!(
                organization_id = %org_id,
                error = %e,
                fail_open = self.policy.fail_open,
                "Quota oracle unavailable"
            );
        } else {
            debug!(organization_id = %org_id, error = %e, "Quota oracle still unavailable");
        }
    }

    fn mark_healthy(&self) {
        if self.oracle_degraded.load(Ordering::Acquire) && self.oracle_degraded.swap(false, Ordering::AcqRel) {
            info!("Quota oracle recovered");
        }
    }
}
