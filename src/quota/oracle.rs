//! Quota oracle trait and an in-memory implementation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Errors reported by a quota oracle.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum OracleError {
    /// The backing store could not be reached
    #[error("quota store unavailable: {0}")]
    Unavailable(String),

    /// No quota record exists for the organization
    #[error("no quota for organization {0}")]
    NotFound(String),
}

/// Kinds of metered resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Connection,
    Query,
    Storage,
    Api,
    ConcurrentQuery,
    TeamMember,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Connection => "connection",
            ResourceKind::Query => "query",
            ResourceKind::Storage => "storage",
            ResourceKind::Api => "api",
            ResourceKind::ConcurrentQuery => "concurrent_query",
            ResourceKind::TeamMember => "team_member",
        }
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time view of an organization's hourly API quota.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaSnapshot {
    /// The organization this snapshot describes
    pub organization_id: String,
    /// Maximum API calls allowed per hour
    pub ceiling_per_hour: u64,
    /// API calls recorded so far in the current hour
    pub used_this_hour: u64,
}

impl QuotaSnapshot {
    pub fn new(organization_id: impl Into<String>, ceiling_per_hour: u64, used_this_hour: u64) -> Self {
        Self {
            organization_id: organization_id.into(),
            ceiling_per_hour,
            used_this_hour,
        }
    }

    /// Whether the hard ceiling has been reached.
    pub fn is_exhausted(&self) -> bool {
        self.used_this_hour >= self.ceiling_per_hour
    }
}

/// Answers quota questions for organizations.
///
/// Implementations may perform I/O. Callers never hold limiter locks across
/// these calls.
#[async_trait]
pub trait QuotaOracle: Send + Sync {
    /// Fetch the current quota snapshot for an organization.
    async fn get_quota(&self, organization_id: &str) -> Result<QuotaSnapshot, OracleError>;

    /// Record one unit of usage of `kind` against an organization.
    async fn increment_usage(&self, organization_id: &str, kind: ResourceKind) -> Result<(), OracleError>;
}

/// An in-process oracle backed by a map.
///
/// Organizations without an explicit ceiling get `default_ceiling`. The
/// oracle can be switched into a failing mode to exercise fail-open paths.
#[derive(Debug)]
pub struct InMemoryQuotaOracle {
    default_ceiling: u64,
    ceilings: RwLock<HashMap<String, u64>>,
    usage: RwLock<HashMap<(String, ResourceKind), u64>>,
    failing: AtomicBool,
}

impl InMemoryQuotaOracle {
    pub fn new(default_ceiling: u64) -> Self {
        Self {
            default_ceiling,
            ceilings: RwLock::new(HashMap::new()),
            usage: RwLock::new(HashMap::new()),
            failing: AtomicBool::new(false),
        }
    }

    /// Set the hourly API ceiling for an organization.
    pub fn set_ceiling(&self, organization_id: &str, ceiling_per_hour: u64) {
        self.ceilings
            .write()
            .insert(organization_id.to_string(), ceiling_per_hour);
    }

    /// Overwrite recorded usage for an organization.
    pub fn set_usage(&self, organization_id: &str, kind: ResourceKind, used: u64) {
        self.usage
            .write()
            .insert((organization_id.to_string(), kind), used);
    }

    /// Recorded usage for an organization.
    pub fn usage(&self, organization_id: &str, kind: ResourceKind) -> u64 {
        self.usage
            .read()
            .get(&(organization_id.to_string(), kind))
            .copied()
            .unwrap_or(0)
    }

    /// Make every subsequent call fail with [`OracleError::Unavailable`].
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), OracleError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(OracleError::Unavailable("in-memory oracle switched off".to_string()));
        }
        Ok(())
    }
}

impl Default for InMemoryQuotaOracle {
    fn default() -> Self {
        Self::new(1000)
    }
}

#[async_trait]
impl QuotaOracle for InMemoryQuotaOracle {
    async fn get_quota(&self, organization_id: &str) -> Result<QuotaSnapshot, OracleError> {
        self.check_available()?;

        let ceiling = self
            .ceilings
            .read()
            .get(organization_id)
            .copied()
            .unwrap_or(self.default_ceiling);

        Ok(QuotaSnapshot::new(
            organization_id,
            ceiling,
            self.usage(organization_id, ResourceKind::Api),
        ))
    }

    async fn increment_usage(&self, organization_id: &str, kind: ResourceKind) -> Result<(), OracleError> {
        self.check_available()?;

        let mut usage = self.usage.write();
        let entry = usage.entry((organization_id.to_string(), kind)).or_insert(0);
        *entry += 1;

        debug!(
            organization_id = %organization_id,
            resource_kind = %kind,
            used = *entry,
            "Usage incremented"
        );
        Ok(())
    }
}
