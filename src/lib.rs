//! Turnstile - Multi-tier Admission Control
//!
//! This crate decides whether a request may proceed, using in-process token
//! buckets keyed by client address, user, organization or method. Organization
//! traffic is additionally gated by an hourly quota read from an external
//! oracle. Adaptive and circuit-breaker limiters adjust admission to backend
//! health, and invitations have their own per-user and per-organization
//! limits.

pub mod admission;
pub mod clock;
pub mod config;
pub mod error;
pub mod quota;
pub mod ratelimit;

pub use admission::AdmissionControl;
pub use error::{Result, TurnstileError};
