//! In-memory counter store
//!
//! Uses DashMap for thread-safe concurrent access. Every primitive holds the
//! key's entry guard for its whole read-modify-write, so two callers on the
//! same key are serialized while callers on other keys proceed in parallel.
//! Suitable for single-instance deployments and tests; for state shared
//! between processes, use the Redis store.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::{debug, trace, warn};

use super::{refill, BucketParams, Store, TokenSnapshot, WindowPosition, WindowRecord, WindowSnapshot};
use crate::error::Result;

/// Run an expiry purge after this many writes.
const PURGE_EVERY: u64 = 4096;

/// Token bucket state
#[derive(Debug, Clone, Copy)]
struct BucketRecord {
    tokens: f64,
    last_refill: i64,
    expires_at: i64,
}

impl BucketRecord {
    fn full(params: &BucketParams, now_ms: i64) -> Self {
        Self {
            tokens: params.burst as f64,
            last_refill: now_ms,
            expires_at: now_ms.saturating_add(params.record_ttl_millis()),
        }
    }

    fn is_corrupt(&self) -> bool {
        !self.tokens.is_finite() || self.tokens < 0.0
    }

    /// Token level at `now_ms`, treating an expired record as a full bucket.
    fn level_at(&self, params: &BucketParams, now_ms: i64) -> f64 {
        if now_ms >= self.expires_at {
            return params.burst as f64;
        }
        refill(self.tokens, self.last_refill, now_ms, params.rate, params.burst)
    }
}

/// In-memory counter store
pub struct MemoryStore {
    /// Window counters, shared by fixed and sliding window limiters
    windows: DashMap<String, WindowRecord>,
    /// Token bucket states
    buckets: DashMap<String, BucketRecord>,
    /// Writes since the last purge
    writes: AtomicU64,
}

impl MemoryStore {
    /// Create a new in-memory store
    pub fn new() -> Self {
        debug!("Creating new in-memory counter store");
        Self {
            windows: DashMap::new(),
            buckets: DashMap::new(),
            writes: AtomicU64::new(0),
        }
    }

    /// Get the number of tracked keys (for monitoring)
    pub fn key_count(&self) -> usize {
        self.windows.len() + self.buckets.len()
    }

    /// Drop every record whose expiry has passed.
    pub fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        let now_ms = now.timestamp_millis();
        let before = self.key_count();
        self.windows.retain(|_, record| now_ms < record.expires_at);
        self.buckets.retain(|_, record| now_ms < record.expires_at);
        let purged = before.saturating_sub(self.key_count());
        if purged > 0 {
            debug!(purged = purged, remaining = self.key_count(), "Purged expired counters");
        }
        purged
    }

    /// Purge on every `PURGE_EVERY`th write. Must run before any entry guard
    /// is taken, since `retain` locks every shard.
    fn maybe_purge(&self, now: DateTime<Utc>) {
        if self.writes.fetch_add(1, Ordering::Relaxed) % PURGE_EVERY == PURGE_EVERY - 1 {
            self.purge_expired(now);
        }
    }

    #[cfg(test)]
    pub(crate) fn poison_bucket(&self, key: &str) {
        if let Some(mut record) = self.buckets.get_mut(key) {
            record.tokens = f64::NAN;
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn increment_window(
        &self,
        key: &str,
        window: Duration,
        now: DateTime<Utc>,
    ) -> Result<WindowSnapshot> {
        self.maybe_purge(now);

        let now_ms = now.timestamp_millis();
        let pos = WindowPosition::at(now, window);

        let mut entry = self
            .windows
            .entry(key.to_string())
            .or_insert_with(|| WindowRecord::empty(pos));

        let mut record = entry.rolled(pos, now_ms);
        record.current = record.current.saturating_add(1);
        *entry = record;

        let snapshot = record.snapshot(now_ms, window);
        trace!(key = %key, current = snapshot.current, previous = snapshot.previous, "Window incremented");
        Ok(snapshot)
    }

    async fn read_window_pair(
        &self,
        key: &str,
        window: Duration,
        now: DateTime<Utc>,
    ) -> Result<WindowSnapshot> {
        let now_ms = now.timestamp_millis();
        let pos = WindowPosition::at(now, window);

        let record = match self.windows.get(key) {
            Some(entry) => entry.rolled(pos, now_ms),
            None => WindowRecord::empty(pos),
        };

        Ok(record.snapshot(now_ms, window))
    }

    async fn refill_and_consume(
        &self,
        key: &str,
        params: BucketParams,
        now: DateTime<Utc>,
    ) -> Result<TokenSnapshot> {
        self.maybe_purge(now);

        let now_ms = now.timestamp_millis();

        let mut entry = self
            .buckets
            .entry(key.to_string())
            .or_insert_with(|| BucketRecord::full(&params, now_ms));

        let recovered = entry.is_corrupt();
        if recovered {
            warn!(key = %key, tokens = entry.tokens, "Corrupt token bucket state, resetting to full");
            *entry = BucketRecord::full(&params, now_ms);
        }

        let tokens_before = entry.level_at(&params, now_ms);
        let cost = params.cost as f64;
        let accepted = tokens_before >= cost;
        let tokens_remaining = if accepted { tokens_before - cost } else { tokens_before };

        let last_refill = now_ms.max(entry.last_refill);
        *entry = BucketRecord {
            tokens: tokens_remaining,
            last_refill,
            expires_at: now_ms.saturating_add(params.record_ttl_millis()),
        };

        trace!(key = %key, accepted = accepted, tokens = tokens_remaining, "Token bucket refilled");

        Ok(TokenSnapshot {
            accepted,
            tokens_before,
            tokens_remaining,
            recovered,
        })
    }

    async fn read_tokens(
        &self,
        key: &str,
        params: BucketParams,
        now: DateTime<Utc>,
    ) -> Result<TokenSnapshot> {
        let now_ms = now.timestamp_millis();

        let (tokens, recovered) = match self.buckets.get(key) {
            Some(entry) if entry.is_corrupt() => (params.burst as f64, true),
            Some(entry) => (entry.level_at(&params, now_ms), false),
            None => (params.burst as f64, false),
        };

        Ok(TokenSnapshot {
            accepted: tokens >= params.cost as f64,
            tokens_before: tokens,
            tokens_remaining: tokens,
            recovered,
        })
    }

    async fn reset(&self, key: &str) -> Result<()> {
        debug!(key = %key, "Resetting counter state");
        self.windows.remove(key);
        self.buckets.remove(key);
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::at_offset;
    use std::sync::Arc;

    fn t(millis: u64) -> DateTime<Utc> {
        at_offset(Duration::from_millis(millis))
    }

    const MINUTE: Duration = Duration::from_secs(60);

    #[tokio::test]
    async fn test_increment_window_counts_within_window() {
        let store = MemoryStore::new();

        for expected in 1..=3 {
            let snapshot = store.increment_window("k", MINUTE, t(1_000)).await.unwrap();
            assert_eq!(snapshot.current, expected);
            assert_eq!(snapshot.previous, 0);
        }

        let snapshot = store.increment_window("k", MINUTE, t(59_000)).await.unwrap();
        assert_eq!(snapshot.current, 4);
        assert_eq!(snapshot.elapsed, Duration::from_secs(59));
        assert_eq!(snapshot.ttl_remaining(), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_window_rolls_current_into_previous() {
        let store = MemoryStore::new();

        for _ in 0..5 {
            store.increment_window("k", MINUTE, t(10_000)).await.unwrap();
        }

        let snapshot = store.increment_window("k", MINUTE, t(70_000)).await.unwrap();
        assert_eq!(snapshot.current, 1);
        assert_eq!(snapshot.previous, 5);
        assert_eq!(snapshot.elapsed, Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_window_gap_drops_previous() {
        let store = MemoryStore::new();

        store.increment_window("k", MINUTE, t(10_000)).await.unwrap();

        // Two windows later the record has expired entirely
        let snapshot = store.increment_window("k", MINUTE, t(130_000)).await.unwrap();
        assert_eq!(snapshot.current, 1);
        assert_eq!(snapshot.previous, 0);
    }

    #[tokio::test]
    async fn test_read_window_pair_does_not_mutate() {
        let store = MemoryStore::new();

        store.increment_window("k", MINUTE, t(0)).await.unwrap();
        store.increment_window("k", MINUTE, t(0)).await.unwrap();

        for _ in 0..10 {
            let snapshot = store.read_window_pair("k", MINUTE, t(30_000)).await.unwrap();
            assert_eq!(snapshot.current, 2);
        }

        // Reading into the next window reports the roll without storing it
        let snapshot = store.read_window_pair("k", MINUTE, t(90_000)).await.unwrap();
        assert_eq!(snapshot.current, 0);
        assert_eq!(snapshot.previous, 2);

        let snapshot = store.increment_window("k", MINUTE, t(30_000)).await.unwrap();
        assert_eq!(snapshot.current, 3);
    }

    #[tokio::test]
    async fn test_read_window_pair_unknown_key() {
        let store = MemoryStore::new();
        let snapshot = store.read_window_pair("missing", MINUTE, t(5_000)).await.unwrap();
        assert_eq!(snapshot.current, 0);
        assert_eq!(snapshot.previous, 0);
        assert_eq!(store.key_count(), 0);
    }

    #[tokio::test]
    async fn test_window_length_change_starts_fresh() {
        let store = MemoryStore::new();

        store.increment_window("k", MINUTE, t(0)).await.unwrap();
        let snapshot = store
            .increment_window("k", Duration::from_secs(10), t(1_000))
            .await
            .unwrap();
        assert_eq!(snapshot.current, 1);
        assert_eq!(snapshot.previous, 0);
    }

    #[tokio::test]
    async fn test_refill_and_consume() {
        let store = MemoryStore::new();
        let params = BucketParams { rate: 1.0, burst: 5, cost: 1 };

        for i in (0..5).rev() {
            let snapshot = store.refill_and_consume("test", params, t(0)).await.unwrap();
            assert!(snapshot.accepted);
            assert_eq!(snapshot.tokens_remaining, i as f64);
        }

        let snapshot = store.refill_and_consume("test", params, t(0)).await.unwrap();
        assert!(!snapshot.accepted);
        assert_eq!(snapshot.tokens_before, 0.0);

        // Half a token later: still denied, but the partial token is kept
        let snapshot = store.refill_and_consume("test", params, t(500)).await.unwrap();
        assert!(!snapshot.accepted);
        assert_eq!(snapshot.tokens_remaining, 0.5);

        let snapshot = store.refill_and_consume("test", params, t(1_000)).await.unwrap();
        assert!(snapshot.accepted);
        assert_eq!(snapshot.tokens_remaining, 0.0);
    }

    #[tokio::test]
    async fn test_read_tokens_does_not_consume() {
        let store = MemoryStore::new();
        let params = BucketParams { rate: 1.0, burst: 2, cost: 1 };

        store.refill_and_consume("test", params, t(0)).await.unwrap();

        for _ in 0..5 {
            let snapshot = store.read_tokens("test", params, t(0)).await.unwrap();
            assert_eq!(snapshot.tokens_remaining, 1.0);
            assert!(snapshot.accepted);
        }

        let snapshot = store.refill_and_consume("test", params, t(0)).await.unwrap();
        assert!(snapshot.accepted);
        assert_eq!(snapshot.tokens_remaining, 0.0);
    }

    #[tokio::test]
    async fn test_corrupt_bucket_is_reset() {
        let store = MemoryStore::new();
        let params = BucketParams { rate: 1.0, burst: 3, cost: 1 };

        store.refill_and_consume("test", params, t(0)).await.unwrap();
        store.poison_bucket("test");

        let read = store.read_tokens("test", params, t(0)).await.unwrap();
        assert!(read.recovered);

        let snapshot = store.refill_and_consume("test", params, t(0)).await.unwrap();
        assert!(snapshot.recovered);
        assert!(snapshot.accepted);
        assert_eq!(snapshot.tokens_remaining, 2.0);

        let snapshot = store.refill_and_consume("test", params, t(0)).await.unwrap();
        assert!(!snapshot.recovered);
    }

    #[tokio::test]
    async fn test_reset() {
        let store = MemoryStore::new();
        let params = BucketParams { rate: 0.001, burst: 1, cost: 1 };

        store.refill_and_consume("test", params, t(0)).await.unwrap();
        let snapshot = store.refill_and_consume("test", params, t(0)).await.unwrap();
        assert!(!snapshot.accepted);

        store.reset("test").await.unwrap();

        let snapshot = store.refill_and_consume("test", params, t(0)).await.unwrap();
        assert!(snapshot.accepted);
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let store = MemoryStore::new();
        let params = BucketParams { rate: 10.0, burst: 10, cost: 1 };

        store.increment_window("w", MINUTE, t(0)).await.unwrap();
        store.refill_and_consume("b", params, t(0)).await.unwrap();
        assert_eq!(store.key_count(), 2);

        // Nothing has expired yet
        assert_eq!(store.purge_expired(t(1_000)), 0);

        // Bucket record lives 2s, window record lives two minutes
        assert_eq!(store.purge_expired(t(5_000)), 1);
        assert_eq!(store.purge_expired(t(120_000)), 1);
        assert_eq!(store.key_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_increments_are_not_lost() {
        let store = Arc::new(MemoryStore::new());

        let handles: Vec<_> = (0..200)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.increment_window("k", MINUTE, t(0)).await.unwrap().current })
            })
            .collect();

        let mut seen: Vec<u64> = futures::future::join_all(handles)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();
        seen.sort_unstable();

        // Every caller observed a distinct post-increment value
        assert_eq!(seen, (1..=200).collect::<Vec<_>>());
    }

    #[test]
    fn test_backend_name() {
        let store = MemoryStore::new();
        assert_eq!(store.backend_name(), "memory");
    }
}
