//! Admission decisions and the throttling metadata handed to the pipeline.

use std::time::Duration;

use chrono::{DateTime, DurationRound, TimeDelta, Utc};
use serde::Serialize;

use super::bucket::{saturating_secs, TakeResult};

/// Why a request was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    /// The organization has exhausted its hourly ceiling
    HardQuotaExceeded,
    /// The token bucket is empty
    SoftRateExceeded,
    /// The circuit breaker is shedding load
    CircuitOpen,
    /// The quota oracle failed and the limiter is configured to fail closed
    QuotaUnavailable,
}

impl RejectReason {
    /// Machine-readable reason string.
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::HardQuotaExceeded => "hard_quota_exceeded",
            RejectReason::SoftRateExceeded => "soft_rate_exceeded",
            RejectReason::CircuitOpen => "circuit_open",
            RejectReason::QuotaUnavailable => "quota_unavailable",
        }
    }

    fn message(&self) -> &'static str {
        match self {
            RejectReason::HardQuotaExceeded => "API quota exhausted for the current hour.",
            RejectReason::SoftRateExceeded => "Too many requests. Please try again later.",
            RejectReason::CircuitOpen => "Service is temporarily shedding load. Please try again later.",
            RejectReason::QuotaUnavailable => "Quota service unavailable. Please try again later.",
        }
    }
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The outcome of an admission check.
///
/// Building a decision does no I/O and allocates nothing; header strings are
/// only produced on demand.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Decision {
    /// Whether the request may proceed
    pub allowed: bool,
    /// Advertised limit for the window
    pub limit: u64,
    /// Requests left in the window
    pub remaining: u64,
    /// When the window resets
    pub reset_at: DateTime<Utc>,
    /// How long to wait before retrying (rejections only)
    pub retry_after: Option<Duration>,
    /// Why the request was rejected (rejections only)
    pub reason: Option<RejectReason>,
}

impl Decision {
    /// An allowed decision.
    pub fn allow(limit: u64, remaining: u64, reset_at: DateTime<Utc>) -> Self {
        Self {
            allowed: true,
            limit,
            remaining,
            reset_at,
            retry_after: None,
            reason: None,
        }
    }

    /// A rejected decision.
    pub fn reject(
        reason: RejectReason,
        limit: u64,
        remaining: u64,
        reset_at: DateTime<Utc>,
        retry_after: Duration,
    ) -> Self {
        Self {
            allowed: false,
            limit,
            remaining,
            reset_at,
            retry_after: Some(retry_after),
            reason: Some(reason),
        }
    }

    /// Build a decision from a bucket take.
    ///
    /// The limit is the bucket's burst; the reset time is when the bucket
    /// will be full again.
    pub fn from_take(take: TakeResult, now: DateTime<Utc>) -> Self {
        let limits = take.limits;
        let missing = (limits.capacity() - take.remaining).max(0.0);
        let until_full = saturating_secs(missing / limits.refill_per_second());
        let reset_at = now
            .checked_add_signed(to_delta(until_full))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let limit = limits.capacity().floor() as u64;
        let remaining = take.remaining.max(0.0).floor() as u64;

        if take.allowed {
            Self::allow(limit, remaining, reset_at)
        } else {
            Self::reject(
                RejectReason::SoftRateExceeded,
                limit,
                remaining,
                reset_at,
                take.retry_after,
            )
        }
    }

    /// Retry-After in whole seconds (rejections only).
    pub fn retry_after_secs(&self) -> Option<u64> {
        self.retry_after.map(retry_after_seconds)
    }

    /// Reset time as Unix epoch seconds.
    pub fn reset_epoch(&self) -> i64 {
        self.reset_at.timestamp()
    }

    /// Rate-limit response headers.
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        let mut headers = vec![
            ("X-RateLimit-Limit", self.limit.to_string()),
            ("X-RateLimit-Remaining", self.remaining.to_string()),
            ("X-RateLimit-Reset", self.reset_epoch().to_string()),
        ];
        if let Some(retry_after) = self.retry_after {
            headers.push(("Retry-After", format_retry_after(retry_after)));
        }
        headers
    }

    /// JSON body for a rejection, or `None` when allowed.
    pub fn throttle_response(&self) -> Option<ThrottleResponse> {
        let reason = self.reason?;
        Some(ThrottleResponse {
            error: "Rate limit exceeded",
            message: reason.message(),
            reason: reason.as_str(),
            retry_after: self.retry_after_secs().unwrap_or(1),
            reset_at: self.reset_at.to_rfc3339(),
        })
    }
}

/// Body of a throttling response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ThrottleResponse {
    pub error: &'static str,
    pub message: &'static str,
    pub reason: &'static str,
    pub retry_after: u64,
    pub reset_at: String,
}

impl ThrottleResponse {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Whole seconds for a Retry-After value: rounded up, at least 1.
pub fn retry_after_seconds(delay: Duration) -> u64 {
    let secs = delay.as_secs().saturating_add(u64::from(delay.subsec_nanos() > 0));
    secs.max(1)
}

/// Format a delay for an HTTP Retry-After header.
pub fn format_retry_after(delay: Duration) -> String {
    retry_after_seconds(delay).to_string()
}

/// The first instant of the hour after `now`.
pub fn next_hour_boundary(now: DateTime<Utc>) -> DateTime<Utc> {
    let hour = TimeDelta::hours(1);
    now.duration_trunc(hour).unwrap_or(now) + hour
}

/// Time from `now` until `then`, zero if `then` has passed.
pub fn until(now: DateTime<Utc>, then: DateTime<Utc>) -> Duration {
    (then - now).to_std().unwrap_or(Duration::ZERO)
}

fn to_delta(duration: Duration) -> TimeDelta {
    TimeDelta::from_std(duration).unwrap_or(TimeDelta::MAX)
}
