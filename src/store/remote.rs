//! Redis counter store
//!
//! Uses Redis so that counters are shared by every process pointed at the same
//! server. Each mutating primitive is a single Lua script, so the read, the
//! arithmetic and the write happen server-side with no other command
//! interleaved. Read-only primitives use a single `MGET`/`HMGET`.
//!
//! Key layout (`{prefix}` defaults to `sluice`):
//!
//! - `{prefix}:win:{key}` - hash with `start`, `window` (millis), `current`
//!   and `previous`, covering the aligned window at `start` and the one before
//! - `{prefix}:tb:{key}` - hash with `tokens` and `last_refill` (epoch millis)
//!
//! Every key maps to exactly two Redis keys, so a reset never scans.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::{debug, trace, warn};

use super::{
    refill, BucketParams, Store, TokenSnapshot, WindowPosition, WindowRecord, WindowSnapshot,
};
use crate::error::{Result, SluiceError};

/// Rolls the window hash forward to the current window and increments it.
///
/// KEYS[1] window hash
/// ARGV[1] now (ms), ARGV[2] current window start (ms), ARGV[3] window length (ms)
/// Returns {current, previous, recovered, start}
const INCREMENT_WINDOW_SCRIPT: &str = r#"
local now = tonumber(ARGV[1])
local pos_start = tonumber(ARGV[2])
local window = tonumber(ARGV[3])
local recovered = 0

local function int(n)
    return string.format('%.0f', n)
end

local data = redis.call('HMGET', KEYS[1], 'start', 'window', 'current', 'previous')
local start, len, current, previous
if data[1] or data[2] or data[3] or data[4] then
    if data[1] and data[2] and data[3] and data[4]
        and string.match(data[1], '^-?%d+$') and string.match(data[2], '^%d+$')
        and string.match(data[3], '^%d+$') and string.match(data[4], '^%d+$') then
        start = tonumber(data[1])
        len = tonumber(data[2])
        current = tonumber(data[3])
        previous = tonumber(data[4])
    else
        redis.call('DEL', KEYS[1])
        recovered = 1
    end
end

if not start or len ~= window or now >= start + 2 * len then
    start = pos_start
    current = 0
    previous = 0
elseif start < pos_start then
    if start + window == pos_start then
        previous = current
    else
        previous = 0
    end
    current = 0
    start = pos_start
end

current = current + 1

redis.call('HSET', KEYS[1], 'start', int(start), 'window', int(window), 'current', int(current), 'previous', int(previous))
redis.call('PEXPIRE', KEYS[1], int(math.max(1, start + 2 * window - now)))

return {current, previous, recovered, start}
"#;

/// Refills a token bucket and tries to consume from it.
///
/// KEYS[1] bucket hash
/// ARGV[1] rate (tokens/sec), ARGV[2] burst, ARGV[3] cost, ARGV[4] now (ms),
/// ARGV[5] expiry in milliseconds
/// Returns {accepted, tokens_remaining, tokens_before, recovered}
const REFILL_AND_CONSUME_SCRIPT: &str = r#"
local rate = tonumber(ARGV[1])
local burst = tonumber(ARGV[2])
local cost = tonumber(ARGV[3])
local now = tonumber(ARGV[4])
local recovered = 0

local data = redis.call('HMGET', KEYS[1], 'tokens', 'last_refill')
local tokens = tonumber(data[1])
local last_refill = tonumber(data[2])

if data[1] or data[2] then
    if not tokens or not last_refill or tokens ~= tokens or tokens < 0 then
        redis.call('DEL', KEYS[1])
        recovered = 1
        tokens = nil
        last_refill = nil
    end
end

if not tokens then
    tokens = burst
    last_refill = now
end

local elapsed = math.max(0, now - last_refill)
tokens = math.min(burst, tokens + (elapsed / 1000) * rate)
local before = tokens

local accepted = 0
if tokens >= cost then
    tokens = tokens - cost
    accepted = 1
end

redis.call('HSET', KEYS[1], 'tokens', tostring(tokens), 'last_refill', tostring(math.max(now, last_refill)))
redis.call('PEXPIRE', KEYS[1], ARGV[5])

return {accepted, tostring(tokens), tostring(before), recovered}
"#;

/// Redis-backed counter store
pub struct RedisStore {
    /// Redis connection manager
    conn: ConnectionManager,
    /// Key prefix
    prefix: String,
    increment_script: redis::Script,
    refill_script: redis::Script,
}

impl RedisStore {
    /// Create a new Redis store
    ///
    /// # Arguments
    ///
    /// * `url` - Redis connection URL (e.g., "redis://localhost:6379")
    ///
    /// # Errors
    ///
    /// Returns `Config` for a malformed URL and `StoreUnavailable` if the
    /// connection cannot be established.
    pub async fn new(url: &str) -> Result<Self> {
        Self::with_prefix(url, "sluice").await
    }

    /// Create a new Redis store with a custom prefix
    pub async fn with_prefix(url: &str, prefix: impl Into<String>) -> Result<Self> {
        debug!(url = %url, "Connecting to Redis counter store");

        let client = redis::Client::open(url)
            .map_err(|e| SluiceError::Config(format!("Invalid Redis URL {}: {}", url, e)))?;
        let conn = ConnectionManager::new(client).await.map_err(store_error)?;

        Ok(Self {
            conn,
            prefix: prefix.into(),
            increment_script: redis::Script::new(INCREMENT_WINDOW_SCRIPT),
            refill_script: redis::Script::new(REFILL_AND_CONSUME_SCRIPT),
        })
    }

    fn window_key(&self, key: &str) -> String {
        format!("{}:win:{}", self.prefix, key)
    }

    fn bucket_key(&self, key: &str) -> String {
        format!("{}:tb:{}", self.prefix, key)
    }
}

/// Classify a Redis failure. The core never retries, so every client-side
/// failure surfaces as the store being unavailable.
fn store_error(e: redis::RedisError) -> SluiceError {
    SluiceError::unavailable(e.to_string())
}

/// Window hash fields as read by `HMGET`: start, window, current, previous.
type WindowFields = (Option<String>, Option<String>, Option<String>, Option<String>);

/// Parse a stored window hash. `Ok(None)` means no record exists.
fn parse_window(fields: WindowFields) -> std::result::Result<Option<WindowRecord>, &'static str> {
    match fields {
        (None, None, None, None) => Ok(None),
        (Some(start), Some(window), Some(current), Some(previous)) => {
            let start = start.parse::<i64>().map_err(|_| "unparseable window start")?;
            let window = window
                .parse::<i64>()
                .ok()
                .filter(|w| *w > 0)
                .ok_or("unparseable window length")?;
            let current = current.parse::<u64>().map_err(|_| "unparseable current count")?;
            let previous = previous.parse::<u64>().map_err(|_| "unparseable previous count")?;
            Ok(Some(WindowRecord::stored(start, window, current, previous)))
        }
        _ => Err("incomplete window record"),
    }
}

fn parse_tokens(key: &str, raw: &str) -> Result<f64> {
    raw.parse::<f64>()
        .ok()
        .filter(|t| t.is_finite())
        .ok_or_else(|| SluiceError::corrupt(key, format!("unparseable token count {:?}", raw)))
}

#[async_trait]
impl Store for RedisStore {
    async fn increment_window(
        &self,
        key: &str,
        window: Duration,
        now: DateTime<Utc>,
    ) -> Result<WindowSnapshot> {
        let pos = WindowPosition::at(now, window);
        let now_ms = now.timestamp_millis();

        trace!(key = %key, window = ?window, index = pos.index(), "Redis increment window");

        let mut conn = self.conn.clone();
        let (current, previous, recovered, start): (u64, u64, i64, i64) = self
            .increment_script
            .key(self.window_key(key))
            .arg(now_ms)
            .arg(pos.start_ms)
            .arg(pos.window_ms)
            .invoke_async(&mut conn)
            .await
            .map_err(store_error)?;

        if recovered == 1 {
            warn!(key = %key, "Corrupt window counter in Redis, reset to zero");
        }

        let record = WindowRecord::stored(start, pos.window_ms, current, previous);
        Ok(WindowSnapshot {
            recovered: recovered == 1,
            ..record.snapshot(now_ms, window)
        })
    }

    async fn read_window_pair(
        &self,
        key: &str,
        window: Duration,
        now: DateTime<Utc>,
    ) -> Result<WindowSnapshot> {
        let pos = WindowPosition::at(now, window);
        let now_ms = now.timestamp_millis();

        let mut conn = self.conn.clone();
        let fields: WindowFields = redis::cmd("HMGET")
            .arg(self.window_key(key))
            .arg("start")
            .arg("window")
            .arg("current")
            .arg("previous")
            .query_async(&mut conn)
            .await
            .map_err(store_error)?;

        let (record, recovered) = match parse_window(fields) {
            Ok(Some(record)) => (record.rolled(pos, now_ms), false),
            Ok(None) => (WindowRecord::empty(pos), false),
            Err(reason) => {
                warn!(key = %key, reason, "Corrupt window counter in Redis, reading as zero");
                (WindowRecord::empty(pos), true)
            }
        };

        Ok(WindowSnapshot {
            recovered,
            ..record.snapshot(now_ms, window)
        })
    }

    async fn refill_and_consume(
        &self,
        key: &str,
        params: BucketParams,
        now: DateTime<Utc>,
    ) -> Result<TokenSnapshot> {
        let bucket_key = self.bucket_key(key);
        let ttl_ms = params.record_ttl_millis();

        trace!(key = %key, rate = params.rate, burst = params.burst, "Redis refill and consume");

        let mut conn = self.conn.clone();
        let (accepted, remaining, before, recovered): (i64, String, String, i64) = self
            .refill_script
            .key(&bucket_key)
            .arg(params.rate)
            .arg(params.burst)
            .arg(params.cost)
            .arg(now.timestamp_millis())
            .arg(ttl_ms)
            .invoke_async(&mut conn)
            .await
            .map_err(store_error)?;

        if recovered == 1 {
            warn!(key = %key, "Corrupt token bucket in Redis, reset to full");
        }

        Ok(TokenSnapshot {
            accepted: accepted == 1,
            tokens_before: parse_tokens(key, &before)?,
            tokens_remaining: parse_tokens(key, &remaining)?,
            recovered: recovered == 1,
        })
    }

    async fn read_tokens(
        &self,
        key: &str,
        params: BucketParams,
        now: DateTime<Utc>,
    ) -> Result<TokenSnapshot> {
        let bucket_key = self.bucket_key(key);

        let mut conn = self.conn.clone();
        let (tokens, last_refill): (Option<String>, Option<String>) = redis::cmd("HMGET")
            .arg(&bucket_key)
            .arg("tokens")
            .arg("last_refill")
            .query_async(&mut conn)
            .await
            .map_err(store_error)?;

        let full = params.burst as f64;
        let (level, recovered) = match (tokens, last_refill) {
            (None, None) => (full, false),
            (Some(tokens), Some(last_refill)) => {
                match (tokens.parse::<f64>(), last_refill.parse::<f64>()) {
                    (Ok(tokens), Ok(last_refill)) if tokens.is_finite() && tokens >= 0.0 => (
                        refill(tokens, last_refill as i64, now.timestamp_millis(), params.rate, params.burst),
                        false,
                    ),
                    _ => (full, true),
                }
            }
            _ => (full, true),
        };

        Ok(TokenSnapshot {
            accepted: level >= params.cost as f64,
            tokens_before: level,
            tokens_remaining: level,
            recovered,
        })
    }

    async fn reset(&self, key: &str) -> Result<()> {
        debug!(key = %key, "Resetting counter state in Redis");

        let mut conn = self.conn.clone();
        let _: () = conn
            .del(vec![self.window_key(key), self.bucket_key(key)])
            .await
            .map_err(store_error)?;

        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "redis"
    }
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("prefix", &self.prefix)
            .finish()
    }
}
