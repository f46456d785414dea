//! Counter storage backends.
//!
//! A [`Store`] exposes the atomic primitives the rate limiting algorithms are
//! built on. Each primitive is one indivisible unit regardless of backend:
//!
//! - **Memory**: the read-modify-write runs under the key's `DashMap` entry guard
//! - **Redis**: the read-modify-write runs server-side as a single Lua script
//!
//! Callers never see intermediate state and never combine a read with a later
//! write of their own.

mod memory;
mod remote;

pub use memory::MemoryStore;
pub use remote::RedisStore;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::StoreConfig;
use crate::error::Result;

/// Counters for the window containing `now` and the one before it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowSnapshot {
    /// Count in the current window (post-increment for `increment_window`)
    pub current: u64,
    /// Count in the immediately preceding window
    pub previous: u64,
    /// Time elapsed since the current window started, `0 <= elapsed < window`
    pub elapsed: Duration,
    /// Window length the snapshot was taken for
    pub window: Duration,
    /// Set when unparseable state was found and reset to zero
    pub recovered: bool,
}

impl WindowSnapshot {
    /// Time until the current window closes.
    pub fn ttl_remaining(&self) -> Duration {
        self.window.saturating_sub(self.elapsed)
    }
}

/// Parameters of a token bucket check.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketParams {
    /// Tokens accrued per second
    pub rate: f64,
    /// Bucket capacity
    pub burst: u64,
    /// Tokens one request consumes
    pub cost: u64,
}

impl BucketParams {
    /// How long an idle bucket keeps its record. Past this point the bucket
    /// would have refilled to `burst` anyway, so expiry is indistinguishable
    /// from a full bucket.
    ///
    /// A bucket that never refills never expires.
    pub fn record_ttl(&self) -> Duration {
        if self.rate <= 0.0 || !self.rate.is_finite() {
            return Duration::MAX;
        }
        let fill_secs = (self.burst.max(1) as f64 / self.rate) * 2.0;
        Duration::try_from_secs_f64(fill_secs)
            .unwrap_or(Duration::MAX)
            .max(Duration::from_millis(1))
    }

    /// [`record_ttl`](Self::record_ttl) in milliseconds, saturating at
    /// [`MAX_RECORD_TTL_MS`].
    pub(crate) fn record_ttl_millis(&self) -> i64 {
        i64::try_from(self.record_ttl().as_millis())
            .unwrap_or(MAX_RECORD_TTL_MS)
            .clamp(1, MAX_RECORD_TTL_MS)
    }
}

/// Longest record lifetime a store will apply, about 73 million years. Any
/// expiry at least this long behaves as "never" for a live bucket while
/// `now + ttl` stays representable.
pub(crate) const MAX_RECORD_TTL_MS: i64 = i64::MAX / 4;

/// Result of a token bucket primitive.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TokenSnapshot {
    /// Whether `cost` tokens were (or, for reads, could be) taken
    pub accepted: bool,
    /// Tokens available after refill, before consuming
    pub tokens_before: f64,
    /// Tokens left after this operation
    pub tokens_remaining: f64,
    /// Set when unparseable state was found and reset to a full bucket
    pub recovered: bool,
}

impl TokenSnapshot {
    /// Time until `cost` tokens will be available, given the refill rate.
    pub fn next_available(&self, params: &BucketParams) -> Option<Duration> {
        let missing = params.cost as f64 - self.tokens_remaining;
        if missing <= 0.0 {
            return Some(Duration::ZERO);
        }
        if params.cost > params.burst || params.rate <= 0.0 {
            return None;
        }
        Some(ceil_millis(missing / params.rate))
    }
}

/// Trait for counter storage backends.
#[async_trait]
pub trait Store: Send + Sync {
    /// Increment the counter for the window containing `now` and return the
    /// post-increment snapshot, including the previous window's count.
    ///
    /// The record expires two windows after the current one starts, so the
    /// previous window stays readable for one more window.
    async fn increment_window(
        &self,
        key: &str,
        window: Duration,
        now: DateTime<Utc>,
    ) -> Result<WindowSnapshot>;

    /// Read the current and previous window counters without mutating them.
    async fn read_window_pair(
        &self,
        key: &str,
        window: Duration,
        now: DateTime<Utc>,
    ) -> Result<WindowSnapshot>;

    /// Refill the bucket for the time since its last refill, try to take
    /// `params.cost` tokens, and persist the result.
    async fn refill_and_consume(
        &self,
        key: &str,
        params: BucketParams,
        now: DateTime<Utc>,
    ) -> Result<TokenSnapshot>;

    /// Compute the bucket's refilled level at `now` without persisting it.
    async fn read_tokens(
        &self,
        key: &str,
        params: BucketParams,
        now: DateTime<Utc>,
    ) -> Result<TokenSnapshot>;

    /// Drop all state for a key.
    async fn reset(&self, key: &str) -> Result<()>;

    /// Get store backend name for logs
    fn backend_name(&self) -> &'static str;
}

/// Store backend selection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// In-process store (single instance only)
    #[default]
    Memory,
    /// Redis store (shared between processes)
    Redis,
}

/// Build the store described by the configuration.
pub async fn connect(config: &StoreConfig) -> Result<Arc<dyn Store>> {
    let store: Arc<dyn Store> = match config.backend {
        StoreBackend::Memory => Arc::new(MemoryStore::new()),
        StoreBackend::Redis => {
            Arc::new(RedisStore::with_prefix(&config.redis_url, config.key_prefix.clone()).await?)
        }
    };
    info!(backend = store.backend_name(), "Store initialized");
    Ok(store)
}

/// Position of an instant within an epoch-aligned window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct WindowPosition {
    /// Start of the window, in milliseconds since the epoch
    pub start_ms: i64,
    /// Milliseconds since `start_ms`
    pub elapsed_ms: i64,
    /// Window length in milliseconds
    pub window_ms: i64,
}

impl WindowPosition {
    pub fn at(now: DateTime<Utc>, window: Duration) -> Self {
        let window_ms = window_millis(window);
        let now_ms = now.timestamp_millis();
        let elapsed_ms = now_ms.rem_euclid(window_ms);
        Self {
            start_ms: now_ms - elapsed_ms,
            elapsed_ms,
            window_ms,
        }
    }

    /// Index of the window since the epoch.
    pub fn index(&self) -> i64 {
        self.start_ms.div_euclid(self.window_ms)
    }

    pub fn elapsed(&self) -> Duration {
        Duration::from_millis(self.elapsed_ms as u64)
    }
}

/// Window length in whole milliseconds, never below one.
pub(crate) fn window_millis(window: Duration) -> i64 {
    i64::try_from(window.as_millis()).unwrap_or(i64::MAX).max(1)
}

/// Token level after refilling from `last_refill_ms` to `now_ms`, capped at `burst`.
pub(crate) fn refill(tokens: f64, last_refill_ms: i64, now_ms: i64, rate: f64, burst: u64) -> f64 {
    let elapsed_secs = now_ms.saturating_sub(last_refill_ms).max(0) as f64 / 1000.0;
    (tokens + elapsed_secs * rate).min(burst as f64)
}

/// Round a number of seconds up to whole milliseconds.
pub(crate) fn ceil_millis(secs: f64) -> Duration {
    let millis = (secs * 1000.0).ceil();
    if !millis.is_finite() || millis >= u64::MAX as f64 {
        return Duration::MAX;
    }
    Duration::from_millis(millis.max(0.0) as u64)
}

/// Window counter state shared by both stores: the count for the window
/// starting at `window_start` and for the one before it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct WindowRecord {
    pub current: u64,
    pub previous: u64,
    pub window_start: i64,
    pub window_ms: i64,
    pub expires_at: i64,
}

impl WindowRecord {
    pub fn empty(pos: WindowPosition) -> Self {
        Self::stored(pos.start_ms, pos.window_ms, 0, 0)
    }

    /// A record as persisted. It expires two windows after it starts.
    pub fn stored(window_start: i64, window_ms: i64, current: u64, previous: u64) -> Self {
        Self {
            current,
            previous,
            window_start,
            window_ms,
            expires_at: window_start.saturating_add(window_ms.saturating_mul(2)),
        }
    }

    /// The record as seen from the window at `pos`.
    pub fn rolled(self, pos: WindowPosition, now_ms: i64) -> Self {
        if self.window_ms != pos.window_ms || now_ms >= self.expires_at {
            return Self::empty(pos);
        }
        if self.window_start >= pos.start_ms {
            // Same window, or the clock stepped backwards into an older one.
            return self;
        }
        let previous = if self.window_start + pos.window_ms == pos.start_ms {
            self.current
        } else {
            0
        };
        Self::stored(pos.start_ms, pos.window_ms, 0, previous)
    }

    pub fn snapshot(&self, now_ms: i64, window: Duration) -> WindowSnapshot {
        let elapsed_ms = (now_ms - self.window_start).clamp(0, self.window_ms - 1);
        WindowSnapshot {
            current: self.current,
            previous: self.previous,
            elapsed: Duration::from_millis(elapsed_ms as u64),
            window,
            recovered: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::at_offset;

    #[test]
    fn test_window_position_is_epoch_aligned() {
        let pos = WindowPosition::at(at_offset(Duration::from_millis(59_900)), Duration::from_secs(60));
        assert_eq!(pos.start_ms, 0);
        assert_eq!(pos.elapsed_ms, 59_900);

        let pos = WindowPosition::at(at_offset(Duration::from_millis(60_100)), Duration::from_secs(60));
        assert_eq!(pos.start_ms, 60_000);
        assert_eq!(pos.elapsed_ms, 100);
        assert_eq!(pos.index(), 1);
    }

    #[test]
    fn test_sub_millisecond_window_is_clamped() {
        assert_eq!(window_millis(Duration::from_micros(10)), 1);
    }

    #[test]
    fn test_refill_caps_at_burst() {
        assert_eq!(refill(0.0, 0, 500, 10.0, 10), 5.0);
        assert_eq!(refill(0.0, 0, 5_000, 10.0, 10), 10.0);
        // Clock going backwards never drains the bucket
        assert_eq!(refill(3.0, 1_000, 0, 10.0, 10), 3.0);
    }

    #[test]
    fn test_next_available() {
        let params = BucketParams { rate: 10.0, burst: 10, cost: 1 };
        let snapshot = TokenSnapshot {
            accepted: false,
            tokens_before: 0.0,
            tokens_remaining: 0.0,
            recovered: false,
        };
        assert_eq!(snapshot.next_available(&params), Some(Duration::from_millis(100)));

        let unsatisfiable = BucketParams { rate: 10.0, burst: 0, cost: 1 };
        assert_eq!(snapshot.next_available(&unsatisfiable), None);
    }

    #[test]
    fn test_record_ttl_covers_full_refill() {
        let params = BucketParams { rate: 10.0, burst: 10, cost: 1 };
        assert_eq!(params.record_ttl(), Duration::from_secs(2));
        assert_eq!(params.record_ttl_millis(), 2_000);
    }

    #[test]
    fn test_record_ttl_is_not_capped_for_slow_buckets() {
        // One token per 1000 days: a full refill takes 1000 days
        let params = BucketParams {
            rate: 1.0 / (1_000.0 * 86_400.0),
            burst: 1,
            cost: 1,
        };
        let two_thousand_days = Duration::from_secs(2_000 * 86_400);
        assert!(params.record_ttl() >= two_thousand_days - Duration::from_secs(1));
        assert!(params.record_ttl_millis() >= (2_000 * 86_400 - 1) * 1_000);
    }

    #[test]
    fn test_record_ttl_saturates() {
        let never = BucketParams { rate: 0.0, burst: 1, cost: 1 };
        assert_eq!(never.record_ttl(), Duration::MAX);
        assert_eq!(never.record_ttl_millis(), MAX_RECORD_TTL_MS);

        let glacial = BucketParams { rate: f64::MIN_POSITIVE, burst: u64::MAX, cost: 1 };
        assert_eq!(glacial.record_ttl(), Duration::MAX);
        assert_eq!(glacial.record_ttl_millis(), MAX_RECORD_TTL_MS);
    }

    #[test]
    fn test_window_record_roll() {
        let minute = Duration::from_secs(60);
        let record = WindowRecord::stored(0, 60_000, 7, 3);

        let same = record.rolled(WindowPosition::at(at_offset(Duration::from_secs(30)), minute), 30_000);
        assert_eq!(same, record);

        let next = record.rolled(WindowPosition::at(at_offset(Duration::from_secs(70)), minute), 70_000);
        assert_eq!((next.current, next.previous, next.window_start), (0, 7, 60_000));

        let expired = record.rolled(WindowPosition::at(at_offset(Duration::from_secs(130)), minute), 130_000);
        assert_eq!((expired.current, expired.previous), (0, 0));
    }

    #[test]
    fn test_store_backend_default() {
        assert_eq!(StoreBackend::default(), StoreBackend::Memory);
    }
}
