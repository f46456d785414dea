//! Configuration management for Sluice.
//!
//! Settings come from an optional YAML file, overridden by environment
//! variables of the form `SLUICE__SECTION__FIELD` (e.g.
//! `SLUICE__STORE__BACKEND=redis`).

use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SluiceError};
use crate::ratelimit::FailurePolicy;
use crate::store::StoreBackend;

const ENV_PREFIX: &str = "SLUICE";
const ENV_SEPARATOR: &str = "__";

/// Main configuration for the Sluice service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SluiceConfig {
    /// Counter store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Counter store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Which backend holds the counters
    #[serde(default)]
    pub backend: StoreBackend,

    /// Redis connection URL (redis backend only)
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Namespace prepended to every Redis key
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Deadline for each store operation in milliseconds; 0 disables it
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            redis_url: default_redis_url(),
            key_prefix: default_key_prefix(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

impl StoreConfig {
    /// The store deadline, if enabled.
    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_ms > 0).then(|| Duration::from_millis(self.timeout_ms))
    }
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_key_prefix() -> String {
    "sluice".to_string()
}

fn default_timeout_ms() -> u64 {
    50
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Path to the rules file
    #[serde(default)]
    pub rules_path: Option<PathBuf>,

    /// Rules reload interval in seconds; 0 disables reloading
    #[serde(default = "default_reload_interval")]
    pub reload_interval_secs: u64,

    /// Answer given when the store fails
    #[serde(default)]
    pub failure_policy: FailurePolicy,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            rules_path: None,
            reload_interval_secs: default_reload_interval(),
            failure_policy: FailurePolicy::default(),
        }
    }
}

impl RateLimitingConfig {
    pub fn reload_interval(&self) -> Option<Duration> {
        (self.reload_interval_secs > 0).then(|| Duration::from_secs(self.reload_interval_secs))
    }
}

fn default_reload_interval() -> u64 {
    30
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` takes precedence
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl SluiceConfig {
    /// Load configuration from an optional file plus the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).format(FileFormat::Yaml).required(true));
        }
        Self::build(builder, Environment::with_prefix(ENV_PREFIX))
    }

    /// Load configuration from a YAML string plus the environment.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let builder = Config::builder().add_source(File::from_str(yaml, FileFormat::Yaml));
        Self::build(builder, Environment::with_prefix(ENV_PREFIX))
    }

    fn build(
        builder: config::ConfigBuilder<config::builder::DefaultState>,
        env: Environment,
    ) -> Result<Self> {
        let env = env
            .prefix_separator(ENV_SEPARATOR)
            .separator(ENV_SEPARATOR)
            .try_parsing(true);

        builder
            .add_source(env)
            .build()
            .and_then(Config::try_deserialize)
            .map_err(|e| SluiceError::Config(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(vars: &[(&str, &str)]) -> Environment {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Environment::with_prefix(ENV_PREFIX).source(Some(map))
    }

    #[test]
    fn test_defaults() {
        let config = SluiceConfig::build(Config::builder(), env(&[])).unwrap();

        assert_eq!(config.store.backend, StoreBackend::Memory);
        assert_eq!(config.store.timeout(), Some(Duration::from_millis(50)));
        assert_eq!(config.rate_limiting.failure_policy, FailurePolicy::Propagate);
        assert_eq!(config.rate_limiting.reload_interval(), Some(Duration::from_secs(30)));
        assert_eq!(config.logging.level, "info");
        assert!(!config.logging.json);
    }

    #[test]
    fn test_from_yaml() {
        let yaml = r#"
store:
  backend: redis
  redis_url: redis://cache:6379
  timeout_ms: 0
rate_limiting:
  rules_path: /etc/sluice/rules.yaml
  reload_interval_secs: 0
  failure_policy: open
logging:
  json: true
"#;
        let config = SluiceConfig::from_yaml(yaml).unwrap();

        assert_eq!(config.store.backend, StoreBackend::Redis);
        assert_eq!(config.store.redis_url, "redis://cache:6379");
        assert_eq!(config.store.key_prefix, "sluice");
        assert_eq!(config.store.timeout(), None);
        assert_eq!(
            config.rate_limiting.rules_path.as_deref(),
            Some(Path::new("/etc/sluice/rules.yaml"))
        );
        assert_eq!(config.rate_limiting.reload_interval(), None);
        assert_eq!(config.rate_limiting.failure_policy, FailurePolicy::Open);
        assert!(config.logging.json);
    }

    #[test]
    fn test_environment_overrides_file() {
        let builder = Config::builder().add_source(File::from_str(
            "store:\n  backend: memory\n  timeout_ms: 10\n",
            FileFormat::Yaml,
        ));
        let config = SluiceConfig::build(
            builder,
            env(&[
                ("SLUICE__STORE__BACKEND", "redis"),
                ("SLUICE__STORE__TIMEOUT_MS", "250"),
                ("SLUICE__RATE_LIMITING__FAILURE_POLICY", "closed"),
            ]),
        )
        .unwrap();

        assert_eq!(config.store.backend, StoreBackend::Redis);
        assert_eq!(config.store.timeout_ms, 250);
        assert_eq!(config.rate_limiting.failure_policy, FailurePolicy::Closed);
    }

    #[test]
    fn test_invalid_value_is_config_error() {
        let err = SluiceConfig::from_yaml("store:\n  backend: memcached\n").unwrap_err();
        assert!(matches!(err, SluiceError::Config(_)));
    }

    #[test]
    fn test_missing_file_is_config_error() {
        let err = SluiceConfig::load(Some(Path::new("/nonexistent/sluice.yaml"))).unwrap_err();
        assert!(matches!(err, SluiceError::Config(_)));
    }
}
