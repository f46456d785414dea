//! The live rule set.
//!
//! Rules are held as an immutable [`RuleSet`] snapshot behind an `ArcSwap`.
//! Readers load the current snapshot without locking and keep it alive for as
//! long as they hold the `Arc`; [`RuleRegistry::replace`] validates a complete
//! new set and swaps the pointer, so a reader sees either the old set or the
//! new one, never a mix.

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use tracing::{debug, info, warn};

use super::rules::{validate, Rule};
use crate::error::{Result, SluiceError};

/// An immutable, fully validated set of rules.
#[derive(Debug, Default)]
pub struct RuleSet {
    rules: HashMap<String, Arc<Rule>>,
    /// Rules with a key prefix, longest prefix first
    prefixed: Vec<Arc<Rule>>,
    default_rule: Option<Arc<Rule>>,
    version: u64,
}

impl RuleSet {
    /// Build a rule set, rejecting it if any rule is invalid.
    pub fn new(rules: Vec<Rule>, default_rule: Option<&str>, version: u64) -> Result<Self> {
        validate(&rules, default_rule)?;

        let rules: HashMap<String, Arc<Rule>> = rules
            .into_iter()
            .map(|rule| (rule.name.clone(), Arc::new(rule)))
            .collect();

        let mut prefixed: Vec<Arc<Rule>> = rules
            .values()
            .filter(|rule| rule.key_prefix.is_some())
            .cloned()
            .collect();
        prefixed.sort_by(|a, b| {
            let len = |r: &Rule| r.key_prefix.as_ref().map_or(0, String::len);
            len(b).cmp(&len(a)).then_with(|| a.name.cmp(&b.name))
        });

        let default_rule = default_rule.and_then(|name| rules.get(name).cloned());

        Ok(Self {
            rules,
            prefixed,
            default_rule,
            version,
        })
    }

    /// Find the rule for a request.
    ///
    /// Resolution order: exact rule name, then the longest matching key
    /// prefix, then the default rule.
    pub fn resolve(&self, rule_name: &str, key: &str) -> Result<Arc<Rule>> {
        if let Some(rule) = self.rules.get(rule_name) {
            return Ok(rule.clone());
        }

        if let Some(rule) = self.prefixed.iter().find(|rule| {
            rule.key_prefix
                .as_deref()
                .is_some_and(|prefix| key.starts_with(prefix))
        }) {
            return Ok(rule.clone());
        }

        self.default_rule
            .clone()
            .ok_or_else(|| SluiceError::UnknownRule(rule_name.to_string()))
    }

    /// Look up a rule by exact name.
    pub fn get(&self, name: &str) -> Option<&Arc<Rule>> {
        self.rules.get(name)
    }

    pub fn default_rule(&self) -> Option<&Arc<Rule>> {
        self.default_rule.as_ref()
    }

    /// Monotonic version, bumped on every successful replace.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// Process-wide holder of the current [`RuleSet`].
#[derive(Debug)]
pub struct RuleRegistry {
    current: ArcSwap<RuleSet>,
}

impl RuleRegistry {
    /// Create a registry with no rules.
    pub fn new() -> Self {
        Self {
            current: ArcSwap::from_pointee(RuleSet::default()),
        }
    }

    /// Create a registry with an initial rule set.
    pub fn with_rules(rules: Vec<Rule>, default_rule: Option<&str>) -> Result<Self> {
        let set = RuleSet::new(rules, default_rule, 1)?;
        Ok(Self {
            current: ArcSwap::from_pointee(set),
        })
    }

    /// Resolve against the current snapshot.
    pub fn resolve(&self, rule_name: &str, key: &str) -> Result<Arc<Rule>> {
        self.current.load().resolve(rule_name, key)
    }

    /// The current snapshot. Holding it keeps that rule set alive even after
    /// it has been replaced.
    pub fn snapshot(&self) -> Arc<RuleSet> {
        self.current.load_full()
    }

    /// Validate and atomically install a new rule set.
    ///
    /// On error the live set is left untouched. Returns the new version.
    pub fn replace(&self, rules: Vec<Rule>, default_rule: Option<&str>) -> Result<u64> {
        let count = rules.len();
        let mut installed = 0;

        // rcu retries the closure if another replace raced us, so versions
        // stay strictly increasing.
        let mut error = None;
        self.current.rcu(|old| {
            match RuleSet::new(rules.clone(), default_rule, old.version + 1) {
                Ok(set) => {
                    installed = set.version;
                    error = None;
                    Arc::new(set)
                }
                Err(e) => {
                    error = Some(e);
                    Arc::clone(old)
                }
            }
        });

        if let Some(e) = error {
            warn!(error = %e, "Rejected rule set, keeping current rules");
            return Err(e);
        }

        info!(version = installed, rules = count, "Installed new rule set");
        debug!(default_rule = ?default_rule, "Rule set default");
        Ok(installed)
    }
}

impl Default for RuleRegistry {
    fn default() -> Self {
        Self::new()
    }
}
