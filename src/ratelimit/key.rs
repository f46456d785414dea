//! Store key generation.

use std::fmt;

use super::rules::{Algorithm, Rule};

/// The key a caller's counter is stored under.
///
/// Caller keys are opaque; they are namespaced by algorithm and rule name so
/// the same caller key limited by two rules never shares state.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StoreKey {
    /// Algorithm that owns the state shape
    pub algorithm: Algorithm,
    /// Rule the counter belongs to
    pub rule: String,
    /// Caller-supplied key
    pub key: String,
}

impl StoreKey {
    /// Create a store key for a caller key under a rule.
    pub fn new(rule: &Rule, key: &str) -> Self {
        Self {
            algorithm: rule.algorithm,
            rule: rule.name.clone(),
            key: key.to_string(),
        }
    }

    /// Convert to the backend key string: `{algorithm}:{rule}:{key}`.
    pub fn to_string_key(&self) -> String {
        format!("{}:{}:{}", self.algorithm, self.rule, self.key)
    }
}

impl fmt::Display for StoreKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_string_key())
    }
}
