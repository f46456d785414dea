//! Token Bucket Algorithm
//!
//! A bucket holds up to `burst` tokens and refills continuously at
//! `limit / window` tokens per second. Each request takes one token. Refill
//! is computed from elapsed wall-clock time since the last refill, so
//! irregular call intervals and restarts that reload prior state are handled
//! without a ticker.
//!
//! The bucket has no window boundary: an allowed decision resets "now", a
//! denied one when the next token arrives.

use std::time::Duration;

use chrono::{DateTime, Utc};

use super::mark_recovered;
use crate::clock;
use crate::error::Result;
use crate::ratelimit::decision::Decision;
use crate::ratelimit::rules::Rule;
use crate::store::{BucketParams, Store, TokenSnapshot};

/// Token bucket rate limiter
#[derive(Debug, Clone, Copy, Default)]
pub struct TokenBucket;

impl TokenBucket {
    /// Bucket parameters for a rule; one token per request.
    pub fn params(rule: &Rule) -> BucketParams {
        BucketParams {
            rate: rule.refill_rate(),
            burst: rule.burst(),
            cost: 1,
        }
    }

    pub async fn check(
        &self,
        store: &dyn Store,
        key: &str,
        rule: &Rule,
        now: DateTime<Utc>,
    ) -> Result<Decision> {
        let params = Self::params(rule);
        let snapshot = store.refill_and_consume(key, params, now).await?;
        Ok(mark_recovered(
            Self::decide(rule, &params, &snapshot, now),
            snapshot.recovered,
        ))
    }

    pub async fn status(
        &self,
        store: &dyn Store,
        key: &str,
        rule: &Rule,
        now: DateTime<Utc>,
    ) -> Result<Decision> {
        let params = Self::params(rule);
        let snapshot = store.read_tokens(key, params, now).await?;
        Ok(mark_recovered(
            Self::decide(rule, &params, &snapshot, now),
            snapshot.recovered,
        ))
    }

    pub fn unseen(&self, rule: &Rule, now: DateTime<Utc>) -> Decision {
        let params = Self::params(rule);
        let full = params.burst as f64;
        let snapshot = TokenSnapshot {
            accepted: full >= params.cost as f64,
            tokens_before: full,
            tokens_remaining: full,
            recovered: false,
        };
        Self::decide(rule, &params, &snapshot, now)
    }

    /// Decide from a bucket snapshot. Works for both the consuming and the
    /// read-only primitive, since each reports `accepted` for the level it saw.
    pub fn decide(
        rule: &Rule,
        params: &BucketParams,
        snapshot: &TokenSnapshot,
        now: DateTime<Utc>,
    ) -> Decision {
        let remaining = snapshot.tokens_remaining.floor().max(0.0) as u64;

        if snapshot.accepted {
            return Decision::allowed(rule.limit, remaining, now);
        }

        // An unsatisfiable request (burst below cost) never gets a token;
        // the window is only a hint.
        let retry_after = snapshot
            .next_available(params)
            .unwrap_or(rule.window)
            .max(Duration::from_millis(1));
        Decision::denied(rule.limit, clock::add(now, retry_after), retry_after)
    }
}
