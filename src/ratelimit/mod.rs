//! Rate limiting primitives and the limiters built on them.

mod adaptive;
mod backend;
mod breaker;
mod bucket;
mod decision;
mod invitation;
mod key;
mod method;
mod organization;
mod registry;
mod rules;
mod sweeper;

pub use adaptive::{AdaptiveBounds, AdaptiveLimiter};
pub use backend::AdmissionBackend;
pub use breaker::{BreakerSettings, CircuitBreakerLimiter, CircuitState, Outcome};
pub use bucket::{BucketLimits, Reservation, TakeResult, TokenBucket};
pub use decision::{
    format_retry_after, next_hour_boundary, retry_after_seconds, Decision, RejectReason, ThrottleResponse,
};
pub use invitation::{
    InvitationDenied, InvitationLimiter, InvitationStats, DEFAULT_ORG_LIMIT, DEFAULT_USER_LIMIT,
    INVITATION_EXPIRATION, INVITATION_WINDOW,
};
pub use key::{LimiterKey, UNKNOWN_CLIENT};
pub use method::MethodLimiter;
pub use organization::{
    hourly_bucket_limits, OrganizationPolicy, QuotaGatedLimiter, DEFAULT_CALLS_PER_HOUR, MIN_BURST,
};
pub use registry::{KeyedLimiterRegistry, SweepPolicy, DEFAULT_IDLE_AFTER};
pub use rules::{MethodRule, MethodRules, DEFAULT_METHOD_BURST, DEFAULT_METHOD_RPS};
pub use sweeper::{IdleSweeper, Sweepable, SweeperHandle, DEFAULT_SWEEP_INTERVAL};
