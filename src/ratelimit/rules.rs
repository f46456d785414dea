//! Rate limit rules and their configuration format.
//!
//! A [`Rule`] is an immutable value naming an algorithm, a limit and a window.
//! Rule files are YAML and map onto [`RuleSetConfig`]:
//!
//! ```yaml
//! default_rule: api
//! rules:
//!   - name: api
//!     algorithm: fixed_window
//!     limit: 100
//!     unit: minute
//!   - name: login
//!     algorithm: token_bucket
//!     limit: 10
//!     unit: second
//!     burst: 20
//! ```

use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Result, SluiceError};

/// Rate limiting algorithm selected by a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    /// Counter per epoch-aligned window
    FixedWindow,
    /// Weighted blend of the current and previous window counters
    SlidingWindow,
    /// Continuously refilled bucket with burst capacity
    TokenBucket,
}

impl Algorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::FixedWindow => "fixed_window",
            Algorithm::SlidingWindow => "sliding_window",
            Algorithm::TokenBucket => "token_bucket",
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Time unit for rule windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    Millisecond,
    Second,
    Minute,
    Hour,
    Day,
}

impl TimeUnit {
    /// Get the duration of one unit.
    pub fn duration(&self) -> Duration {
        match self {
            TimeUnit::Millisecond => Duration::from_millis(1),
            TimeUnit::Second => Duration::from_secs(1),
            TimeUnit::Minute => Duration::from_secs(60),
            TimeUnit::Hour => Duration::from_secs(3600),
            TimeUnit::Day => Duration::from_secs(86400),
        }
    }
}

/// A single rate limit rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    /// Unique rule name
    pub name: String,
    /// Algorithm used to enforce the rule
    pub algorithm: Algorithm,
    /// Units permitted per window
    pub limit: u64,
    /// Window length; for token buckets, the period over which `limit` tokens accrue
    pub window: Duration,
    /// Bucket capacity (token bucket only); defaults to `limit`
    pub burst: Option<u64>,
    /// Caller keys starting with this prefix resolve to this rule
    pub key_prefix: Option<String>,
}

impl Rule {
    /// Create a new rule.
    pub fn new(name: impl Into<String>, algorithm: Algorithm, limit: u64, window: Duration) -> Self {
        Self {
            name: name.into(),
            algorithm,
            limit,
            window,
            burst: None,
            key_prefix: None,
        }
    }

    pub fn fixed_window(name: impl Into<String>, limit: u64, window: Duration) -> Self {
        Self::new(name, Algorithm::FixedWindow, limit, window)
    }

    pub fn sliding_window(name: impl Into<String>, limit: u64, window: Duration) -> Self {
        Self::new(name, Algorithm::SlidingWindow, limit, window)
    }

    pub fn token_bucket(name: impl Into<String>, limit: u64, window: Duration) -> Self {
        Self::new(name, Algorithm::TokenBucket, limit, window)
    }

    /// Set the bucket capacity.
    pub fn with_burst(mut self, burst: u64) -> Self {
        self.burst = Some(burst);
        self
    }

    /// Match caller keys by prefix.
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = Some(prefix.into());
        self
    }

    /// Effective bucket capacity.
    pub fn burst(&self) -> u64 {
        self.burst.unwrap_or(self.limit)
    }

    /// Token refill rate in tokens per second.
    pub fn refill_rate(&self) -> f64 {
        self.limit as f64 / self.window.as_secs_f64()
    }

    /// Every reason this rule cannot be activated.
    pub fn violations(&self) -> Vec<String> {
        let mut violations = Vec::new();
        let label: &str = if self.name.is_empty() { "<unnamed>" } else { &self.name };

        if self.name.is_empty() {
            violations.push("rule name must not be empty".to_string());
        }
        if self.limit == 0 {
            violations.push(format!("rule '{}': limit must be greater than 0", label));
        }
        if self.window < Duration::from_millis(1) {
            violations.push(format!("rule '{}': window must be at least 1ms", label));
        }
        if self.burst.is_some() && self.algorithm != Algorithm::TokenBucket {
            violations.push(format!(
                "rule '{}': burst is only valid for token_bucket, not {}",
                label, self.algorithm
            ));
        }
        if matches!(self.key_prefix.as_deref(), Some("")) {
            violations.push(format!("rule '{}': key_prefix must not be empty", label));
        }

        violations
    }
}

/// Validate a complete rule set, reporting every offending rule at once.
pub fn validate(rules: &[Rule], default_rule: Option<&str>) -> Result<()> {
    let mut violations = Vec::new();
    let mut names = HashSet::new();

    for rule in rules {
        violations.extend(rule.violations());
        if !rule.name.is_empty() && !names.insert(rule.name.as_str()) {
            violations.push(format!("rule '{}': duplicate name", rule.name));
        }
    }

    if let Some(default) = default_rule {
        if !names.contains(default) {
            violations.push(format!("default rule '{}' is not defined", default));
        }
    }

    if violations.is_empty() {
        Ok(())
    } else {
        Err(SluiceError::InvalidRule { violations })
    }
}

/// A rule as written in a rules file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleConfig {
    pub name: String,
    pub algorithm: Algorithm,
    /// Units permitted per window
    pub limit: u64,
    /// The time unit
    pub unit: TimeUnit,
    /// Window length in `unit`s
    #[serde(default = "default_units")]
    pub units: u32,
    #[serde(default)]
    pub burst: Option<u64>,
    #[serde(default)]
    pub key_prefix: Option<String>,
}

fn default_units() -> u32 {
    1
}

impl From<RuleConfig> for Rule {
    fn from(config: RuleConfig) -> Self {
        Rule {
            name: config.name,
            algorithm: config.algorithm,
            limit: config.limit,
            window: config.unit.duration() * config.units,
            burst: config.burst,
            key_prefix: config.key_prefix,
        }
    }
}

/// A complete rules file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleSetConfig {
    /// Rule used when neither the name nor a key prefix matches
    #[serde(default)]
    pub default_rule: Option<String>,
    #[serde(default)]
    pub rules: Vec<RuleConfig>,
}

impl RuleSetConfig {
    /// Load rules from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading rate limit rules");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load rules from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| SluiceError::Config(format!("Failed to parse rules: {}", e)))
    }

    /// Convert into validated rules plus the default rule name.
    pub fn into_rules(self) -> Result<(Vec<Rule>, Option<String>)> {
        let rules: Vec<Rule> = self.rules.into_iter().map(Rule::from).collect();
        validate(&rules, self.default_rule.as_deref())?;
        Ok((rules, self.default_rule))
    }
}
