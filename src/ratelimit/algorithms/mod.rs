//! Rate limiting algorithms
//!
//! - **Fixed Window**: one counter per epoch-aligned window
//! - **Sliding Window Counter**: current window plus a weighted share of the previous one
//! - **Token Bucket**: continuous refill with burst capacity
//!
//! Each algorithm issues exactly one store primitive per call and then
//! computes its decision synchronously from the returned snapshot. The
//! `decide`/`observe` functions are pure so the arithmetic can be tested
//! without a store.

mod fixed_window;
mod sliding_window;
mod token_bucket;

pub use fixed_window::FixedWindow;
pub use sliding_window::SlidingWindowCounter;
pub use token_bucket::TokenBucket;

use chrono::{DateTime, Utc};

use super::decision::Decision;
use super::rules::{Algorithm, Rule};
use crate::error::{ErrorCode, Result};
use crate::store::Store;

/// One limiter per algorithm, selected by a rule's `algorithm` tag.
#[derive(Debug, Clone, Copy)]
pub enum Limiter {
    FixedWindow(FixedWindow),
    SlidingWindow(SlidingWindowCounter),
    TokenBucket(TokenBucket),
}

impl Limiter {
    /// The limiter for an algorithm.
    pub fn for_algorithm(algorithm: Algorithm) -> Self {
        match algorithm {
            Algorithm::FixedWindow => Limiter::FixedWindow(FixedWindow),
            Algorithm::SlidingWindow => Limiter::SlidingWindow(SlidingWindowCounter),
            Algorithm::TokenBucket => Limiter::TokenBucket(TokenBucket),
        }
    }

    /// Count one request against `key` and decide whether it is allowed.
    pub async fn check(
        &self,
        store: &dyn Store,
        key: &str,
        rule: &Rule,
        now: DateTime<Utc>,
    ) -> Result<Decision> {
        match self {
            Limiter::FixedWindow(l) => l.check(store, key, rule, now).await,
            Limiter::SlidingWindow(l) => l.check(store, key, rule, now).await,
            Limiter::TokenBucket(l) => l.check(store, key, rule, now).await,
        }
    }

    /// Report the state of `key` without counting a request.
    pub async fn status(
        &self,
        store: &dyn Store,
        key: &str,
        rule: &Rule,
        now: DateTime<Utc>,
    ) -> Result<Decision> {
        match self {
            Limiter::FixedWindow(l) => l.status(store, key, rule, now).await,
            Limiter::SlidingWindow(l) => l.status(store, key, rule, now).await,
            Limiter::TokenBucket(l) => l.status(store, key, rule, now).await,
        }
    }

    /// The status of a key that has never been seen.
    pub fn unseen(&self, rule: &Rule, now: DateTime<Utc>) -> Decision {
        match self {
            Limiter::FixedWindow(l) => l.unseen(rule, now),
            Limiter::SlidingWindow(l) => l.unseen(rule, now),
            Limiter::TokenBucket(l) => l.unseen(rule, now),
        }
    }
}

/// Flag a decision whose stored state had to be reset.
pub(crate) fn mark_recovered(decision: Decision, recovered: bool) -> Decision {
    if recovered {
        decision.with_warning(ErrorCode::StateCorrupt)
    } else {
        decision
    }
}
