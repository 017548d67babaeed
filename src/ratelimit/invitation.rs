//! Invitation rate limiting per user and per organization.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use crate::clock::Clock;
use crate::error::{Result, TurnstileError};

use super::bucket::BucketLimits;
use super::key::LimiterKey;
use super::registry::{KeyedLimiterRegistry, SweepPolicy};

/// Length of an invitation quota window.
pub const INVITATION_WINDOW: Duration = Duration::from_secs(3600);
/// Idle buckets are dropped after this long without an invitation.
pub const INVITATION_EXPIRATION: Duration = Duration::from_secs(2 * INVITATION_WINDOW.as_secs());

/// Default invitations per hour per user.
pub const DEFAULT_USER_LIMIT: u32 = 20;
/// Default invitations per hour per organization.
pub const DEFAULT_ORG_LIMIT: u32 = 5;

/// Which axis rejected an invitation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum InvitationDenied {
    #[error("user rate limit exceeded")]
    User,
    #[error("organization rate limit exceeded")]
    Organization,
}

/// Snapshot of invitation limiter state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InvitationStats {
    pub user_limiters_count: usize,
    pub org_limiters_count: usize,
    pub user_limit: u32,
    pub org_limit: u32,
}

/// Limits invitations on two independent axes.
///
/// Each user and each organization gets a bucket holding a full hour of
/// invitations that refills over the hour.
#[derive(Debug)]
pub struct InvitationLimiter {
    user_limit: u32,
    org_limit: u32,
    users: Arc<KeyedLimiterRegistry>,
    orgs: Arc<KeyedLimiterRegistry>,
}

impl InvitationLimiter {
    /// Create a limiter allowing `user_limit` and `org_limit` invitations an hour.
    pub fn new(user_limit: u32, org_limit: u32, clock: Arc<dyn Clock>) -> Result<Self> {
        let user_limits = hourly(user_limit, "user_limit")?;
        let org_limits = hourly(org_limit, "org_limit")?;
        let policy = SweepPolicy::IdleFor(INVITATION_EXPIRATION);

        Ok(Self {
            user_limit,
            org_limit,
            users: Arc::new(
                KeyedLimiterRegistry::new("invitation_user", user_limits, clock.clone()).with_sweep_policy(policy),
            ),
            orgs: Arc::new(KeyedLimiterRegistry::new("invitation_org", org_limits, clock).with_sweep_policy(policy)),
        })
    }

    /// Whether `user_id` may send another invitation. Consumes quota.
    pub fn check_user(&self, user_id: &str) -> bool {
        self.users.allow(&LimiterKey::user(user_id))
    }

    /// Whether `org_id` may send another invitation. Consumes quota.
    pub fn check_org(&self, org_id: &str) -> bool {
        self.orgs.allow(&LimiterKey::organization(org_id))
    }

    /// Check the user, then the organization.
    ///
    /// The organization is not charged when the user is rejected.
    pub fn check_both(&self, user_id: &str, org_id: &str) -> std::result::Result<(), InvitationDenied> {
        if !self.check_user(user_id) {
            debug!(user_id = %user_id, "Invitation rejected by user limit");
            return Err(InvitationDenied::User);
        }
        if !self.check_org(org_id) {
            debug!(organization_id = %org_id, "Invitation rejected by organization limit");
            return Err(InvitationDenied::Organization);
        }
        Ok(())
    }

    /// Time until `user_id` can send another invitation.
    pub fn user_retry_after(&self, user_id: &str) -> Duration {
        time_until_available(&self.users, &LimiterKey::user(user_id))
    }

    /// Time until `org_id` can send another invitation.
    pub fn org_retry_after(&self, org_id: &str) -> Duration {
        time_until_available(&self.orgs, &LimiterKey::organization(org_id))
    }

    /// Invitations `user_id` can send right now.
    pub fn user_remaining(&self, user_id: &str) -> u32 {
        remaining(&self.users, &LimiterKey::user(user_id), self.user_limit)
    }

    /// Invitations `org_id` can send right now.
    pub fn org_remaining(&self, org_id: &str) -> u32 {
        remaining(&self.orgs, &LimiterKey::organization(org_id), self.org_limit)
    }

    /// Restore a user's full quota.
    pub fn reset_user(&self, user_id: &str) {
        self.users.remove(&LimiterKey::user(user_id));
    }

    /// Restore an organization's full quota.
    pub fn reset_org(&self, org_id: &str) {
        self.orgs.remove(&LimiterKey::organization(org_id));
    }

    /// Drop buckets idle for longer than [`INVITATION_EXPIRATION`].
    pub fn sweep(&self) -> usize {
        self.users.sweep() + self.orgs.sweep()
    }

    pub fn stats(&self) -> InvitationStats {
        InvitationStats {
            user_limiters_count: self.users.len(),
            org_limiters_count: self.orgs.len(),
            user_limit: self.user_limit,
            org_limit: self.org_limit,
        }
    }

    pub fn user_registry(&self) -> &Arc<KeyedLimiterRegistry> {
        &self.users
    }

    pub fn org_registry(&self) -> &Arc<KeyedLimiterRegistry> {
        &self.orgs
    }
}

fn hourly(limit: u32, field: &'static str) -> Result<BucketLimits> {
    if limit == 0 {
        return Err(TurnstileError::invalid(field, 0.0));
    }
    let limit = f64::from(limit);
    BucketLimits::new(limit, limit / INVITATION_WINDOW.as_secs_f64())
}

// Keys without a bucket can invite right away; probing must not create one.
fn time_until_available(registry: &KeyedLimiterRegistry, key: &LimiterKey) -> Duration {
    if !registry.contains(key) {
        return Duration::ZERO;
    }
    let reservation = registry.reserve(key);
    let delay = reservation.delay();
    reservation.cancel();
    delay
}

fn remaining(registry: &KeyedLimiterRegistry, key: &LimiterKey, limit: u32) -> u32 {
    match registry.tokens(key) {
        Some(tokens) => tokens.max(0.0).floor() as u32,
        None => limit,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn limiter(user_limit: u32, org_limit: u32) -> (InvitationLimiter, ManualClock) {
        let clock = ManualClock::new();
        (
            InvitationLimiter::new(user_limit, org_limit, Arc::new(clock.clone())).unwrap(),
            clock,
        )
    }

    #[test]
    fn test_user_limit() {
        let (limiter, _) = limiter(3, 10);

        for _ in 0..3 {
            assert!(limiter.check_user("alice"));
        }
        assert!(!limiter.check_user("alice"));
        assert!(limiter.check_user("bob"));
    }

    #[test]
    fn test_org_limit() {
        let (limiter, _) = limiter(20, 2);

        assert!(limiter.check_org("org-1"));
        assert!(limiter.check_org("org-1"));
        assert!(!limiter.check_org("org-1"));
    }

    #[test]
    fn test_check_both_reports_axis() {
        let (limiter, _) = limiter(1, 1);

        assert_eq!(limiter.check_both("alice", "org-1"), Ok(()));
        assert_eq!(limiter.check_both("bob", "org-1"), Err(InvitationDenied::Organization));
        assert_eq!(limiter.check_both("alice", "org-2"), Err(InvitationDenied::User));
        assert_eq!(
            InvitationDenied::Organization.to_string(),
            "organization rate limit exceeded"
        );
    }

    #[test]
    fn test_user_rejection_does_not_charge_org() {
        let (limiter, _) = limiter(1, 5);

        assert!(limiter.check_both("alice", "org-1").is_ok());
        assert!(limiter.check_both("alice", "org-1").is_err());
        assert_eq!(limiter.org_remaining("org-1"), 4);
    }

    #[test]
    fn test_remaining_and_retry_after() {
        let (limiter, _) = limiter(2, 5);

        assert_eq!(limiter.user_remaining("alice"), 2);
        assert_eq!(limiter.user_retry_after("alice"), Duration::ZERO);

        limiter.check_user("alice");
        assert_eq!(limiter.user_remaining("alice"), 1);
        assert_eq!(limiter.user_retry_after("alice"), Duration::ZERO);

        limiter.check_user("alice");
        assert_eq!(limiter.user_remaining("alice"), 0);
        // 2 per hour refills one token every 30 minutes.
        let wait = limiter.user_retry_after("alice");
        assert!((wait.as_secs_f64() - 1800.0).abs() < 1e-6);

        // Asking for the wait must not consume anything.
        assert_eq!(limiter.user_remaining("alice"), 0);
        assert_eq!(limiter.org_remaining("org-9"), 5);
        assert_eq!(limiter.org_retry_after("org-9"), Duration::ZERO);
    }

    #[test]
    fn test_refill_over_the_hour() {
        let (limiter, clock) = limiter(2, 5);
        limiter.check_user("alice");
        limiter.check_user("alice");
        assert!(!limiter.check_user("alice"));

        clock.advance(Duration::from_secs(1801));
        assert!(limiter.check_user("alice"));
    }

    #[test]
    fn test_reset() {
        let (limiter, _) = limiter(1, 1);
        assert!(limiter.check_user("alice"));
        assert!(limiter.check_org("org-1"));

        limiter.reset_user("alice");
        limiter.reset_org("org-1");
        assert!(limiter.check_user("alice"));
        assert!(limiter.check_org("org-1"));
    }

    #[test]
    fn test_sweep_removes_expired_and_next_request_is_fresh() {
        let (limiter, clock) = limiter(2, 5);
        limiter.check_user("alice");
        limiter.check_user("alice");
        limiter.check_org("org-1");

        clock.advance(Duration::from_secs(3600));
        limiter.check_user("bob");

        clock.advance(INVITATION_EXPIRATION + Duration::from_secs(1));
        assert_eq!(limiter.sweep(), 3);
        assert_eq!(limiter.stats().user_limiters_count, 0);
        assert_eq!(limiter.stats().org_limiters_count, 0);

        assert_eq!(limiter.user_remaining("alice"), 2);
        assert!(limiter.check_user("alice"));
        assert_eq!(limiter.user_remaining("alice"), 1);
    }

    #[test]
    fn test_sweep_keeps_recent_entries() {
        let (limiter, clock) = limiter(2, 5);
        limiter.check_user("alice");

        clock.advance(Duration::from_secs(3600));
        assert_eq!(limiter.sweep(), 0);
        assert_eq!(limiter.stats().user_limiters_count, 1);
    }

    #[test]
    fn test_expiration_spans_two_windows() {
        assert_eq!(INVITATION_EXPIRATION, INVITATION_WINDOW * 2);

        let (limiter, _) = limiter(4, 5);
        let limits = limiter.user_registry().limits();
        assert_eq!(limits.capacity(), 4.0);
        assert!((limits.refill_per_second() * INVITATION_WINDOW.as_secs_f64() - 4.0).abs() < 1e-9);
    }

    #[test]
    fn test_retry_after_creates_no_entries() {
        let (limiter, _) = limiter(2, 5);

        assert_eq!(limiter.user_retry_after("alice"), Duration::ZERO);
        assert_eq!(limiter.org_retry_after("org-9"), Duration::ZERO);
        assert_eq!(limiter.stats().user_limiters_count, 0);
        assert_eq!(limiter.stats().org_limiters_count, 0);
    }

    #[test]
    fn test_stats() {
        let (limiter, _) = limiter(DEFAULT_USER_LIMIT, DEFAULT_ORG_LIMIT);
        limiter.check_both("alice", "org-1").unwrap();
        limiter.check_user("bob");

        let stats = limiter.stats();
        assert_eq!(stats.user_limiters_count, 2);
        assert_eq!(stats.org_limiters_count, 1);
        assert_eq!(stats.user_limit, 20);
        assert_eq!(stats.org_limit, 5);
    }

    #[test]
    fn test_zero_limits_rejected() {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new());
        assert!(InvitationLimiter::new(0, 5, clock.clone()).is_err());
        assert!(InvitationLimiter::new(20, 0, clock).is_err());
    }
}
