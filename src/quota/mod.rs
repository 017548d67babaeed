//! The quota oracle consumed by organization-level admission.
//!
//! Quota persistence lives outside this crate. The oracle answers how much of
//! a resource an organization has used this hour and what its ceiling is, and
//! accepts usage increments.

mod oracle;

pub use oracle::{InMemoryQuotaOracle, OracleError, QuotaOracle, QuotaSnapshot, ResourceKind};
