//! Token bucket primitive.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::error::{Result, TurnstileError};

const SECONDS_PER_HOUR: f64 = 3600.0;

/// Immutable sizing of a token bucket.
///
/// A bucket holds up to `capacity` tokens and refills continuously at
/// `refill_per_second`. Changing either value means swapping in a new
/// `BucketLimits`, never mutating one in place.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketLimits {
    capacity: f64,
    refill_per_second: f64,
}

impl BucketLimits {
    /// Create limits, rejecting zero, negative or non-finite values.
    pub fn new(capacity: f64, refill_per_second: f64) -> Result<Self> {
        if !(capacity.is_finite() && capacity > 0.0) {
            return Err(TurnstileError::invalid("capacity", capacity));
        }
        if !(refill_per_second.is_finite() && refill_per_second > 0.0) {
            return Err(TurnstileError::invalid("refill_per_second", refill_per_second));
        }
        Ok(Self {
            capacity,
            refill_per_second,
        })
    }

    /// Limits for `per_hour` events an hour with the given burst.
    pub fn per_hour(per_hour: u64, burst: u64) -> Result<Self> {
        Self::new(burst as f64, per_hour as f64 / SECONDS_PER_HOUR)
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    pub fn refill_per_second(&self) -> f64 {
        self.refill_per_second
    }

    /// Same capacity, different refill rate.
    pub fn with_rate(&self, refill_per_second: f64) -> Result<Self> {
        Self::new(self.capacity, refill_per_second)
    }

    /// The refill rate expressed as events per hour.
    pub fn hourly_limit(&self) -> u64 {
        (self.refill_per_second * SECONDS_PER_HOUR).round() as u64
    }
}

/// Result of a take attempt, captured under the bucket lock.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TakeResult {
    /// Whether a token was consumed
    pub allowed: bool,
    /// Tokens left after the attempt
    pub remaining: f64,
    /// Wait until the next token is available (zero when one already is)
    pub retry_after: Duration,
    /// Limits in force for the attempt
    pub limits: BucketLimits,
}

#[derive(Debug)]
struct BucketState {
    limits: BucketLimits,
    tokens: f64,
    last_refill: Instant,
    last_access: Instant,
}

impl BucketState {
    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            self.tokens = (self.tokens + elapsed * self.limits.refill_per_second).min(self.limits.capacity);
            self.last_refill = now;
        }
    }

    fn tokens_at(&self, now: Instant) -> f64 {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        (self.tokens + elapsed * self.limits.refill_per_second).min(self.limits.capacity)
    }

    fn wait_for_token(&self, tokens: f64) -> Duration {
        if tokens >= 1.0 {
            Duration::ZERO
        } else {
            saturating_secs((1.0 - tokens) / self.limits.refill_per_second)
        }
    }
}

/// Seconds as a `Duration`, saturating at `Duration::MAX` for very slow rates.
pub(crate) fn saturating_secs(secs: f64) -> Duration {
    Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
}

/// A single-key token bucket.
///
/// All state sits behind one lock, including the limits, so a rate change
/// can never interleave with a refill calculation.
#[derive(Debug)]
pub struct TokenBucket {
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// Create a full bucket.
    pub fn new(limits: BucketLimits, now: Instant) -> Self {
        Self {
            state: Mutex::new(BucketState {
                limits,
                tokens: limits.capacity,
                last_refill: now,
                last_access: now,
            }),
        }
    }

    /// Consume one token if available.
    pub fn allow(&self, now: Instant) -> bool {
        self.take(now).allowed
    }

    /// Consume one token if available, reporting the resulting state.
    pub fn take(&self, now: Instant) -> TakeResult {
        let mut state = self.state.lock();
        state.refill(now);
        state.last_access = now;

        let allowed = state.tokens >= 1.0;
        if allowed {
            state.tokens -= 1.0;
        }

        TakeResult {
            allowed,
            remaining: state.tokens,
            retry_after: state.wait_for_token(state.tokens),
            limits: state.limits,
        }
    }

    /// Tokens that would be available at `now`, without touching state.
    pub fn tokens(&self, now: Instant) -> f64 {
        self.state.lock().tokens_at(now)
    }

    /// Current limits.
    pub fn limits(&self) -> BucketLimits {
        self.state.lock().limits
    }

    /// Swap in new limits.
    ///
    /// Tokens accrued so far are settled at the old rate first. When the
    /// capacity changes the token count is scaled proportionally.
    pub fn reconfigure(&self, limits: BucketLimits, now: Instant) {
        let mut state = self.state.lock();
        state.refill(now);

        let fill = state.tokens / state.limits.capacity;
        state.tokens = (fill * limits.capacity).clamp(0.0, limits.capacity);
        state.limits = limits;
    }

    /// Whether the bucket is at full capacity.
    pub fn is_full(&self, now: Instant) -> bool {
        let state = self.state.lock();
        state.tokens_at(now) >= state.limits.capacity
    }

    /// Time since the bucket last served a take.
    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.state.lock().last_access)
    }

    /// Compute the wait until a token is available without consuming one.
    pub fn reserve(self: &Arc<Self>, now: Instant) -> Reservation {
        let delay = {
            let state = self.state.lock();
            state.wait_for_token(state.tokens_at(now))
        };
        Reservation {
            bucket: Arc::clone(self),
            delay,
        }
    }
}

/// An uncommitted claim on a future token.
///
/// Creating a reservation changes nothing. Callers that only need the delay should
/// [`cancel`](Reservation::cancel); callers that waited out the delay
/// [`commit`](Reservation::commit).
#[derive(Debug)]
#[must_use = "a reservation should be committed or cancelled"]
pub struct Reservation {
    bucket: Arc<TokenBucket>,
    delay: Duration,
}

impl Reservation {
    /// Wait until one token would be available, as of reservation time.
    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Drop the reservation. No token is consumed.
    pub fn cancel(self) {}

    /// Try to take the reserved token now.
    pub fn commit(self, now: Instant) -> bool {
        self.bucket.allow(now)
    }
}
