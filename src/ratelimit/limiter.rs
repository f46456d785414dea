//! Rate limiter facade.
//!
//! Resolves the rule for a caller key, dispatches to the algorithm the rule
//! names, and applies the store deadline, corruption recovery and failure
//! policy around the single store primitive each call makes.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use super::algorithms::Limiter;
use super::decision::Decision;
use super::key::StoreKey;
use super::registry::RuleRegistry;
use super::rules::Rule;
use crate::clock::{self, Clock, SystemClock};
use crate::error::{ErrorCode, Result, SluiceError};
use crate::store::Store;

/// What to answer when the store is unreachable or too slow.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Return the store error to the caller
    #[default]
    Propagate,
    /// Allow the request
    Open,
    /// Deny the request for one window
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Check,
    Status,
}

/// The decision engine.
///
/// Thread-safe; share it behind an `Arc`. The only state it owns besides the
/// store handle is the rule registry, which is swapped atomically.
pub struct RateLimiter {
    registry: RuleRegistry,
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    store_timeout: Option<Duration>,
    failure_policy: FailurePolicy,
}

impl RateLimiter {
    /// Create a rate limiter with no rules, the system clock, no store
    /// deadline and the `Propagate` failure policy.
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            registry: RuleRegistry::new(),
            store,
            clock: Arc::new(SystemClock),
            store_timeout: None,
            failure_policy: FailurePolicy::default(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Bound every store primitive by `timeout`.
    pub fn with_store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = Some(timeout);
        self
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    /// Install an initial rule set.
    pub fn with_rules(self, rules: Vec<Rule>, default_rule: Option<&str>) -> Result<Self> {
        self.registry.replace(rules, default_rule)?;
        Ok(self)
    }

    pub fn registry(&self) -> &RuleRegistry {
        &self.registry
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn failure_policy(&self) -> FailurePolicy {
        self.failure_policy
    }

    /// Count one request for `key` under the rule resolved from `rule_name`.
    pub async fn check_key(&self, key: &str, rule_name: &str) -> Result<Decision> {
        self.check_key_at(key, rule_name, self.clock.now()).await
    }

    /// [`check_key`](Self::check_key) at an explicit instant.
    pub async fn check_key_at(
        &self,
        key: &str,
        rule_name: &str,
        now: DateTime<Utc>,
    ) -> Result<Decision> {
        let rule = self.registry.resolve(rule_name, key)?;
        self.evaluate(Mode::Check, &rule, key, now).await
    }

    /// Report the limit state for `key` without counting a request.
    pub async fn status_key(&self, key: &str, rule_name: &str) -> Result<Decision> {
        self.status_key_at(key, rule_name, self.clock.now()).await
    }

    /// [`status_key`](Self::status_key) at an explicit instant.
    pub async fn status_key_at(
        &self,
        key: &str,
        rule_name: &str,
        now: DateTime<Utc>,
    ) -> Result<Decision> {
        let rule = self.registry.resolve(rule_name, key)?;
        self.evaluate(Mode::Status, &rule, key, now).await
    }

    /// Validate and atomically swap in a new rule set. On error the current
    /// rules stay in effect. Returns the new rule set version.
    pub fn replace_rules(&self, rules: Vec<Rule>, default_rule: Option<&str>) -> Result<u64> {
        self.registry.replace(rules, default_rule)
    }

    /// Drop the stored state for `key` under the resolved rule.
    pub async fn reset_key(&self, key: &str, rule_name: &str) -> Result<()> {
        let rule = self.registry.resolve(rule_name, key)?;
        let store_key = StoreKey::new(&rule, key).to_string_key();
        self.bounded(self.store.reset(&store_key)).await
    }

    async fn evaluate(
        &self,
        mode: Mode,
        rule: &Rule,
        key: &str,
        now: DateTime<Utc>,
    ) -> Result<Decision> {
        let limiter = Limiter::for_algorithm(rule.algorithm);
        let store_key = StoreKey::new(rule, key).to_string_key();

        trace!(key = %store_key, rule = %rule.name, mode = ?mode, "Evaluating rate limit");

        let result = match self.run(mode, &limiter, &store_key, rule, now).await {
            Err(SluiceError::StateCorrupt { reason, .. }) => {
                self.recover(mode, &limiter, &store_key, rule, now, &reason).await
            }
            other => other,
        };

        match result {
            Ok(decision) => {
                if !decision.allowed && mode == Mode::Check {
                    debug!(
                        key = %store_key,
                        rule = %rule.name,
                        retry_after = ?decision.retry_after,
                        "Rate limit exceeded"
                    );
                }
                Ok(decision)
            }
            Err(e) if e.is_transient() => self.fallback(e, rule, &store_key, now),
            Err(e) => Err(e),
        }
    }

    async fn run(
        &self,
        mode: Mode,
        limiter: &Limiter,
        store_key: &str,
        rule: &Rule,
        now: DateTime<Utc>,
    ) -> Result<Decision> {
        let store = self.store.as_ref();
        match mode {
            Mode::Check => self.bounded(limiter.check(store, store_key, rule, now)).await,
            Mode::Status => self.bounded(limiter.status(store, store_key, rule, now)).await,
        }
    }

    /// A backend reported unparseable state. Checks reset the key and retry
    /// once from zero-state; status reads never mutate, so they answer as if
    /// the key were new.
    async fn recover(
        &self,
        mode: Mode,
        limiter: &Limiter,
        store_key: &str,
        rule: &Rule,
        now: DateTime<Utc>,
        reason: &str,
    ) -> Result<Decision> {
        warn!(key = %store_key, rule = %rule.name, reason = %reason, "Corrupt rate limit state");

        let decision = match mode {
            Mode::Status => limiter.unseen(rule, now),
            Mode::Check => {
                self.bounded(self.store.reset(store_key)).await?;
                self.run(mode, limiter, store_key, rule, now).await?
            }
        };
        Ok(decision.with_warning(ErrorCode::StateCorrupt))
    }

    /// Apply the store deadline. On expiry the outcome of the primitive is
    /// unknown and nothing is compensated.
    async fn bounded<T>(&self, op: impl Future<Output = Result<T>>) -> Result<T> {
        match self.store_timeout {
            Some(limit) => tokio::time::timeout(limit, op)
                .await
                .map_err(|_| SluiceError::StoreTimeout(limit))?,
            None => op.await,
        }
    }

    fn fallback(
        &self,
        error: SluiceError,
        rule: &Rule,
        store_key: &str,
        now: DateTime<Utc>,
    ) -> Result<Decision> {
        let code = error.code();
        match self.failure_policy {
            FailurePolicy::Propagate => Err(error),
            FailurePolicy::Open => {
                warn!(key = %store_key, error = %error, "Store failed, allowing request");
                Ok(Decision::allowed(rule.limit, rule.limit, now).with_warning(code))
            }
            FailurePolicy::Closed => {
                warn!(key = %store_key, error = %error, "Store failed, denying request");
                Ok(Decision::denied(rule.limit, clock::add(now, rule.window), rule.window)
                    .with_warning(code))
            }
        }
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("backend", &self.store.backend_name())
            .field("rules_version", &self.registry.snapshot().version())
            .field("store_timeout", &self.store_timeout)
            .field("failure_policy", &self.failure_policy)
            .finish()
    }
}
