//! Per-method rate limit rules.
//!
//! Rules map an RPC method name to a requests-per-second rate and a burst.
//! They load from YAML, either as a bare list or under a `methods` key:
//!
//! ```yaml
//! methods:
//!   - method: /sqlstudio.Query/Execute
//!     requests_per_second: 10
//!     burst: 20
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

use super::bucket::BucketLimits;
use crate::error::{Result, TurnstileError};

/// Rate for methods without a rule.
pub const DEFAULT_METHOD_RPS: f64 = 100.0;
/// Burst for methods without a rule.
pub const DEFAULT_METHOD_BURST: f64 = 200.0;

/// A rate limit rule for one method.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodRule {
    /// Fully qualified method name
    pub method: String,
    /// Sustained requests per second
    pub requests_per_second: f64,
    /// Requests allowed instantaneously
    pub burst: f64,
}

impl MethodRule {
    pub fn new(method: impl Into<String>, requests_per_second: f64, burst: f64) -> Self {
        Self {
            method: method.into(),
            requests_per_second,
            burst,
        }
    }

    /// Validated bucket limits for this rule.
    pub fn limits(&self) -> Result<BucketLimits> {
        BucketLimits::new(self.burst, self.requests_per_second)
    }
}

/// The full set of method rules.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MethodRules {
    #[serde(default)]
    pub methods: Vec<MethodRule>,
}

impl MethodRules {
    pub fn new(methods: Vec<MethodRule>) -> Self {
        Self { methods }
    }

    /// Load rules from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading method rate limit rules");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load rules from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        // A bare list of rules is accepted as well as the `methods:` form.
        if let Ok(methods) = serde_yaml::from_str::<Vec<MethodRule>>(yaml) {
            return Ok(Self::new(methods));
        }

        serde_yaml::from_str(yaml)
            .map_err(|e| TurnstileError::Config(format!("Failed to parse method rules: {}", e)))
    }

    /// Find the rule for a method. The last rule for a method wins.
    pub fn find(&self, method: &str) -> Option<&MethodRule> {
        self.methods.iter().rev().find(|rule| rule.method == method)
    }

    /// Check every rule has positive, finite limits.
    pub fn validate(&self) -> Result<()> {
        for rule in &self.methods {
            rule.limits()?;
        }
        Ok(())
    }
}
