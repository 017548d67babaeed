//! Configuration management for Turnstile.
//!
//! Configuration is YAML. [`TurnstileConfig::from_file`] reads a single file;
//! [`TurnstileConfig::load`] layers `TURNSTILE__SECTION__FIELD` environment
//! variables over an optional file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Result, TurnstileError};
use crate::ratelimit::{
    hourly_bucket_limits, AdaptiveBounds, BreakerSettings, BucketLimits, MethodRule, MethodRules,
    OrganizationPolicy, SweepPolicy, DEFAULT_CALLS_PER_HOUR, DEFAULT_METHOD_BURST, DEFAULT_METHOD_RPS,
    DEFAULT_ORG_LIMIT, DEFAULT_USER_LIMIT, MIN_BURST,
};

/// Prefix for environment overrides.
pub const ENV_PREFIX: &str = "TURNSTILE";

/// Main configuration for the admission-control subsystem.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TurnstileConfig {
    /// Per-client-address limits
    #[serde(default)]
    pub client: KeyedLimitConfig,

    /// Per-user limits
    #[serde(default)]
    pub user: KeyedLimitConfig,

    /// Per-method limits
    #[serde(default)]
    pub methods: MethodsConfig,

    /// Organization quota gating
    #[serde(default)]
    pub organization: OrganizationConfig,

    /// Load-adaptive limits
    #[serde(default)]
    pub adaptive: AdaptiveConfig,

    /// Circuit breaker in front of a keyed limiter
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,

    /// Invitation limits
    #[serde(default)]
    pub invitation: InvitationConfig,

    /// Idle entry eviction
    #[serde(default)]
    pub sweeper: SweeperConfig,
}

/// A plain keyed token-bucket limit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyedLimitConfig {
    /// Sustained requests per second
    #[serde(default = "default_rps")]
    pub requests_per_second: f64,

    /// Requests allowed instantaneously
    #[serde(default = "default_burst")]
    pub burst: f64,
}

impl Default for KeyedLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_second: default_rps(),
            burst: default_burst(),
        }
    }
}

impl KeyedLimitConfig {
    pub fn limits(&self) -> Result<BucketLimits> {
        BucketLimits::new(self.burst, self.requests_per_second)
    }
}

fn default_rps() -> f64 {
    DEFAULT_METHOD_RPS
}

fn default_burst() -> f64 {
    DEFAULT_METHOD_BURST
}

/// Per-method rules, inline and/or from a rules file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodsConfig {
    /// Path to a method rules file, loaded before the inline rules
    #[serde(default)]
    pub rules_path: Option<PathBuf>,

    /// Limit for methods without a rule
    #[serde(default)]
    pub default: KeyedLimitConfig,

    /// Inline rules. These win over file rules for the same method.
    #[serde(default)]
    pub rules: Vec<MethodRule>,
}

impl Default for MethodsConfig {
    fn default() -> Self {
        Self {
            rules_path: None,
            default: KeyedLimitConfig::default(),
            rules: Vec::new(),
        }
    }
}

impl MethodsConfig {
    /// Effective rules: the rules file, if any, followed by inline rules.
    pub fn rules(&self) -> Result<MethodRules> {
        let mut methods = match &self.rules_path {
            Some(path) => MethodRules::from_file(path)?.methods,
            None => Vec::new(),
        };
        methods.extend(self.rules.iter().cloned());
        Ok(MethodRules::new(methods))
    }
}

/// Organization quota gating.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrganizationConfig {
    /// Hourly ceiling assumed while the quota oracle is unavailable
    #[serde(default = "default_calls_per_hour")]
    pub default_calls_per_hour: u64,

    /// Smallest burst for any organization bucket
    #[serde(default = "default_min_burst")]
    pub min_burst: u64,

    /// Admit requests when the quota oracle fails
    #[serde(default = "default_true")]
    pub fail_open: bool,
}

impl Default for OrganizationConfig {
    fn default() -> Self {
        Self {
            default_calls_per_hour: default_calls_per_hour(),
            min_burst: default_min_burst(),
            fail_open: true,
        }
    }
}

impl OrganizationConfig {
    pub fn policy(&self) -> OrganizationPolicy {
        OrganizationPolicy {
            default_calls_per_hour: self.default_calls_per_hour,
            min_burst: self.min_burst,
            fail_open: self.fail_open,
        }
    }

    /// Limits new organization buckets start from.
    pub fn template(&self) -> Result<BucketLimits> {
        hourly_bucket_limits(self.default_calls_per_hour, self.min_burst)
    }
}

fn default_calls_per_hour() -> u64 {
    DEFAULT_CALLS_PER_HOUR
}

fn default_min_burst() -> u64 {
    MIN_BURST
}

fn default_true() -> bool {
    true
}

/// Load-adaptive limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdaptiveConfig {
    /// Rate at a load factor of 1.0
    #[serde(default = "default_rps")]
    pub base_rps: f64,

    /// Lowest rate under heavy load
    #[serde(default = "default_min_rps")]
    pub min_rps: f64,

    /// Highest rate under light load
    #[serde(default = "default_max_rps")]
    pub max_rps: f64,

    #[serde(default = "default_burst")]
    pub burst: f64,
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            base_rps: default_rps(),
            min_rps: default_min_rps(),
            max_rps: default_max_rps(),
            burst: default_burst(),
        }
    }
}

impl AdaptiveConfig {
    pub fn bounds(&self) -> AdaptiveBounds {
        AdaptiveBounds {
            base_rps: self.base_rps,
            min_rps: self.min_rps,
            max_rps: self.max_rps,
            burst: self.burst,
        }
    }
}

fn default_min_rps() -> f64 {
    10.0
}

fn default_max_rps() -> f64 {
    1000.0
}

/// Circuit breaker settings and the limit it gates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Seconds after the last failure before trial traffic is allowed
    #[serde(default = "default_recovery_timeout_secs")]
    pub recovery_timeout_secs: u64,

    /// Limit applied while the circuit admits traffic
    #[serde(default)]
    pub limit: KeyedLimitConfig,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            recovery_timeout_secs: default_recovery_timeout_secs(),
            limit: KeyedLimitConfig::default(),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn settings(&self) -> BreakerSettings {
        BreakerSettings {
            failure_threshold: self.failure_threshold,
            recovery_timeout: Duration::from_secs(self.recovery_timeout_secs),
        }
    }
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_recovery_timeout_secs() -> u64 {
    30
}

/// Invitation limits, per hour.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvitationConfig {
    #[serde(default = "default_user_limit")]
    pub user_limit: u32,

    #[serde(default = "default_org_limit")]
    pub org_limit: u32,
}

impl Default for InvitationConfig {
    fn default() -> Self {
        Self {
            user_limit: default_user_limit(),
            org_limit: default_org_limit(),
        }
    }
}

fn default_user_limit() -> u32 {
    DEFAULT_USER_LIMIT
}

fn default_org_limit() -> u32 {
    DEFAULT_ORG_LIMIT
}

/// How idle entries are detected.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SweepMode {
    /// Evict entries untouched for `idle_after_secs`
    #[default]
    Idle,
    /// Evict entries whose bucket has refilled to capacity
    FullCapacity,
}

/// Idle entry eviction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweeperConfig {
    /// Seconds between sweep passes
    #[serde(default = "default_sweep_interval_secs")]
    pub interval_secs: u64,

    /// Seconds without access before an entry is idle
    #[serde(default = "default_idle_after_secs")]
    pub idle_after_secs: u64,

    #[serde(default)]
    pub mode: SweepMode,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_sweep_interval_secs(),
            idle_after_secs: default_idle_after_secs(),
            mode: SweepMode::default(),
        }
    }
}

impl SweeperConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    /// Policy for the keyed registries. Invitations always use their own
    /// expiration.
    pub fn policy(&self) -> SweepPolicy {
        match self.mode {
            SweepMode::Idle => SweepPolicy::IdleFor(Duration::from_secs(self.idle_after_secs)),
            SweepMode::FullCapacity => SweepPolicy::FullCapacity,
        }
    }
}

fn default_sweep_interval_secs() -> u64 {
    3600
}

fn default_idle_after_secs() -> u64 {
    3600
}

impl TurnstileConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| TurnstileError::Config(e.to_string()))
    }

    /// Load configuration from an optional file with environment overrides.
    ///
    /// `TURNSTILE__CLIENT__BURST=50` overrides `client.burst`.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration file");
            builder = builder.add_source(config::File::from(path).format(config::FileFormat::Yaml));
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        );

        builder
            .build()
            .and_then(|settings| settings.try_deserialize())
            .map_err(|e| TurnstileError::Config(e.to_string()))
    }

    /// Render the effective configuration as YAML.
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).map_err(|e| TurnstileError::Config(e.to_string()))
    }

    /// Check every section can build its limiter.
    pub fn validate(&self) -> Result<()> {
        self.client.limits()?;
        self.user.limits()?;
        self.methods.default.limits()?;
        self.methods.rules()?.validate()?;
        self.organization.template()?;
        self.adaptive.bounds().validate()?;
        self.circuit_breaker.settings().validate()?;
        self.circuit_breaker.limit.limits()?;
        if self.invitation.user_limit == 0 {
            return Err(TurnstileError::invalid("invitation.user_limit", 0.0));
        }
        if self.invitation.org_limit == 0 {
            return Err(TurnstileError::invalid("invitation.org_limit", 0.0));
        }
        if self.sweeper.interval_secs == 0 {
            return Err(TurnstileError::invalid("sweeper.interval_secs", 0.0));
        }
        if self.sweeper.mode == SweepMode::Idle && self.sweeper.idle_after_secs == 0 {
            return Err(TurnstileError::invalid("sweeper.idle_after_secs", 0.0));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = TurnstileConfig::default();
        assert_eq!(config.client.requests_per_second, 100.0);
        assert_eq!(config.client.burst, 200.0);
        assert_eq!(config.organization.default_calls_per_hour, 1000);
        assert!(config.organization.fail_open);
        assert_eq!(config.invitation.user_limit, 20);
        assert_eq!(config.invitation.org_limit, 5);
        assert_eq!(config.sweeper.policy(), SweepPolicy::IdleFor(Duration::from_secs(3600)));
        config.validate().unwrap();
    }

    #[test]
    fn test_partial_yaml_fills_defaults() {
        let yaml = r#"
client:
  requests_per_second: 5
organization:
  fail_open: false
methods:
  rules:
    - method: /svc.Auth/Login
      requests_per_second: 1
      burst: 3
sweeper:
  mode: full_capacity
"#;
        let config = TurnstileConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.client.requests_per_second, 5.0);
        assert_eq!(config.client.burst, 200.0);
        assert!(!config.organization.fail_open);
        assert_eq!(config.organization.min_burst, 10);
        assert_eq!(config.methods.rules().unwrap().find("/svc.Auth/Login").unwrap().burst, 3.0);
        assert_eq!(config.sweeper.policy(), SweepPolicy::FullCapacity);
        config.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_bad_sections() {
        let mut config = TurnstileConfig::default();
        config.adaptive.min_rps = 2000.0;
        assert!(config.validate().is_err());

        let mut config = TurnstileConfig::default();
        config.circuit_breaker.failure_threshold = 0;
        assert!(config.validate().is_err());

        let mut config = TurnstileConfig::default();
        config.invitation.org_limit = 0;
        assert!(matches!(
            config.validate(),
            Err(TurnstileError::InvalidConfiguration { field: "invitation.org_limit", .. })
        ));

        let mut config = TurnstileConfig::default();
        config.methods.rules.push(MethodRule::new("/svc.X/Y", 0.0, 1.0));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_yaml_round_trip_of_effective_config() {
        let config = TurnstileConfig::default();
        let yaml = config.to_yaml().unwrap();
        assert_eq!(TurnstileConfig::from_yaml(&yaml).unwrap(), config);
    }

    #[test]
    fn test_from_file_and_rules_file() {
        let dir = std::env::temp_dir().join(format!("turnstile-config-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();

        let rules_path = dir.join("rules.yaml");
        let mut rules = std::fs::File::create(&rules_path).unwrap();
        writeln!(rules, "- method: /svc.Query/Execute\n  requests_per_second: 10\n  burst: 20").unwrap();

        let config_path = dir.join("turnstile.yaml");
        let mut file = std::fs::File::create(&config_path).unwrap();
        writeln!(
            file,
            "methods:\n  rules_path: {}\n  rules:\n    - method: /svc.Query/Execute\n      requests_per_second: 2\n      burst: 4",
            rules_path.display()
        )
        .unwrap();

        let config = TurnstileConfig::from_file(&config_path).unwrap();
        let rules = config.methods.rules().unwrap();
        assert_eq!(rules.methods.len(), 2);
        assert_eq!(rules.find("/svc.Query/Execute").unwrap().requests_per_second, 2.0);

        let loaded = TurnstileConfig::load(Some(&config_path)).unwrap();
        assert_eq!(loaded.methods.rules.len(), 1);

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_environment_overrides() {
        std::env::set_var("TURNSTILE__CLIENT__BURST", "50");
        std::env::set_var("TURNSTILE__ORGANIZATION__FAIL_OPEN", "false");
        std::env::set_var("TURNSTILE__INVITATION__USER_LIMIT", "7");

        let loaded = TurnstileConfig::load(None);

        std::env::remove_var("TURNSTILE__CLIENT__BURST");
        std::env::remove_var("TURNSTILE__ORGANIZATION__FAIL_OPEN");
        std::env::remove_var("TURNSTILE__INVITATION__USER_LIMIT");

        let config = loaded.unwrap();
        assert_eq!(config.client.burst, 50.0);
        assert_eq!(config.client.requests_per_second, 100.0);
        assert!(!config.organization.fail_open);
        assert_eq!(config.invitation.user_limit, 7);
        assert_eq!(config.invitation.org_limit, 5);
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let result = TurnstileConfig::from_file("/nonexistent/turnstile.yaml");
        assert!(matches!(result, Err(TurnstileError::Io(_))));
    }
}
