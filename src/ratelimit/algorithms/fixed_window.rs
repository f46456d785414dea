//! Fixed Window Algorithm
//!
//! Time is divided into epoch-aligned windows of `rule.window`, each with its
//! own counter. A request is allowed while the window's count stays at or
//! below `rule.limit`.
//!
//! ## Boundary behaviour
//!
//! The previous window's count is discarded at the boundary, so up to
//! `2 × limit` requests can be accepted in a span shorter than one window:
//! `limit` just before the boundary and `limit` just after it. This is
//! inherent to the algorithm; use the sliding window counter when it matters.

use chrono::{DateTime, Utc};

use super::mark_recovered;
use crate::clock;
use crate::error::Result;
use crate::ratelimit::decision::Decision;
use crate::ratelimit::rules::Rule;
use crate::store::{Store, WindowPosition, WindowSnapshot};

/// Fixed window rate limiter
#[derive(Debug, Clone, Copy, Default)]
pub struct FixedWindow;

impl FixedWindow {
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

    /// Decide a request whose increment produced `snapshot`.
    pub fn decide(rule: &Rule, snapshot: &WindowSnapshot, now: DateTime<Utc>) -> Decision {
        let ttl = snapshot.ttl_remaining();
        let reset_at = clock::add(now, ttl);

        if snapshot.current <= rule.limit {
            Decision::allowed(rule.limit, rule.limit - snapshot.current, reset_at)
        } else {
            Decision::denied(rule.limit, reset_at, ttl)
        }
    }

    /// Describe the window without counting a request.
    pub fn observe(rule: &Rule, snapshot: &WindowSnapshot, now: DateTime<Utc>) -> Decision {
        let ttl = snapshot.ttl_remaining();
        let reset_at = clock::add(now, ttl);
        let remaining = rule.limit.saturating_sub(snapshot.current);

        if remaining > 0 {
            Decision::allowed(rule.limit, remaining, reset_at)
        } else {
            Decision::denied(rule.limit, reset_at, ttl)
        }
    }
}
