//! Rate limiting rules, algorithms and the decision engine.

pub mod algorithms;
mod decision;
mod key;
mod limiter;
mod registry;
mod reload;
mod rules;

pub use algorithms::{FixedWindow, Limiter, SlidingWindowCounter, TokenBucket};
pub use decision::Decision;
pub use key::StoreKey;
pub use limiter::{FailurePolicy, RateLimiter};
pub use registry::{RuleRegistry, RuleSet};
pub use reload::{RuleReloader, RulesFile};
pub use rules::{validate, Algorithm, Rule, RuleConfig, RuleSetConfig, TimeUnit};
