//! Sliding Window Counter Algorithm
//!
//! Approximates a sliding window with two fixed-window counters. The previous
//! window's count is weighted by how much of it still overlaps a window
//! ending now:
//!
//! ```text
//! estimate = previous × (1 − elapsed / window) + current
//! ```
//!
//! A request is allowed while `estimate <= limit`. The weighting assumes
//! requests were spread uniformly over the previous window, so the estimate
//! is an approximation; it needs two counters per key instead of one
//! timestamp per request.
//!
//! `current`, `previous` and `elapsed` all come from the single snapshot
//! returned by the increment, never from a separate read.

use std::time::Duration;

use chrono::{DateTime, Utc};

use super::mark_recovered;
use crate::clock;
use crate::error::Result;
use crate::ratelimit::decision::Decision;
use crate::ratelimit::rules::Rule;
use crate::store::{ceil_millis, Store, WindowPosition, WindowSnapshot};

const MIN_RETRY: Duration = Duration::from_millis(1);

/// Sliding window counter rate limiter
#[derive(Debug, Clone, Copy, Default)]
pub struct SlidingWindowCounter;

impl SlidingWindowCounter {
    pub async fn check(
        &self,
        store: &dyn Store,
        key: &str,
        rule: &Rule,
        now: DateTime<Utc>,
    ) -> Result<Decision> {
        let snapshot = store.increment_window(key, rule.window, now).await?;
        Ok(mark_recovered(Self::decide(rule, &snapshot, now), snapshot.recovered))
    }

    pub async fn status(
        &self,
        store: &dyn Store,
        key: &str,
        rule: &Rule,
        now: DateTime<Utc>,
    ) -> Result<Decision> {
        let snapshot = store.read_window_pair(key, rule.window, now).await?;
        Ok(mark_recovered(Self::observe(rule, &snapshot, now), snapshot.recovered))
    }

    pub fn unseen(&self, rule: &Rule, now: DateTime<Utc>) -> Decision {
        let pos = WindowPosition::at(now, rule.window);
        let snapshot = WindowSnapshot {
            current: 0,
            previous: 0,
            elapsed: pos.elapsed(),
            window: rule.window,
            recovered: false,
        };
        Self::observe(rule, &snapshot, now)
    }

    /// Weighted request count for the window ending now.
    pub fn estimate(snapshot: &WindowSnapshot) -> f64 {
        let window = snapshot.window.as_secs_f64();
        let elapsed = snapshot.elapsed.as_secs_f64().min(window);
        let weight = 1.0 - elapsed / window;
        snapshot.previous as f64 * weight + snapshot.current as f64
    }

    /// Decide a request whose increment produced `snapshot`.
    pub fn decide(rule: &Rule, snapshot: &WindowSnapshot, now: DateTime<Utc>) -> Decision {
        let estimate = Self::estimate(snapshot);
        let limit = rule.limit as f64;
        let reset_at = clock::add(now, snapshot.ttl_remaining());

        if estimate <= limit {
            Decision::allowed(rule.limit, remaining(limit, estimate), reset_at)
        } else {
            Decision::denied(rule.limit, reset_at, retry_after(rule, snapshot, estimate))
        }
    }

    /// Describe the window without counting a request.
    pub fn observe(rule: &Rule, snapshot: &WindowSnapshot, now: DateTime<Utc>) -> Decision {
        let estimate = Self::estimate(snapshot);
        let limit = rule.limit as f64;
        let reset_at = clock::add(now, snapshot.ttl_remaining());
        let remaining = remaining(limit, estimate);

        if remaining > 0 {
            Decision::allowed(rule.limit, remaining, reset_at)
        } else {
            // Wait until one more request would fit.
            Decision::denied(rule.limit, reset_at, retry_after(rule, snapshot, estimate + 1.0))
        }
    }
}

fn remaining(limit: f64, estimate: f64) -> u64 {
    (limit - estimate).floor().max(0.0) as u64
}

/// Time until the estimate decays back under the limit, assuming no further
/// requests. Only the previous window's share decays; if the current window
/// alone is over the limit, wait for the window to roll.
fn retry_after(rule: &Rule, snapshot: &WindowSnapshot, estimate: f64) -> Duration {
    let ttl = snapshot.ttl_remaining();
    let limit = rule.limit as f64;

    if snapshot.previous == 0 || snapshot.current as f64 > limit {
        return ttl.max(MIN_RETRY);
    }

    // The previous window's weight drops by `previous / window` per second
    let excess = estimate - limit;
    let wait_secs = excess * snapshot.window.as_secs_f64() / snapshot.previous as f64;
    ceil_millis(wait_secs).min(ttl).max(MIN_RETRY)
}
