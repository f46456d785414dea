//! The outcome of a rate limit check.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};

use crate::error::ErrorCode;

/// Result of a `check` or `status` call. Constructed once, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Decision {
    /// Whether the request may proceed
    pub allowed: bool,
    /// Units left before requests are denied
    pub remaining: u64,
    /// When the limit next resets
    pub reset_at: DateTime<Utc>,
    /// How long to wait before retrying; present iff `allowed` is false.
    /// Serialized as whole milliseconds.
    #[serde(serialize_with = "serialize_millis")]
    pub retry_after: Option<Duration>,
    /// The configured limit
    pub limit: u64,
    /// A non-fatal condition encountered while deciding, e.g. corrupt state
    /// that was reset, or a store failure answered by the failure policy
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<ErrorCode>,
}

impl Decision {
    /// Create an allowing decision.
    pub fn allowed(limit: u64, remaining: u64, reset_at: DateTime<Utc>) -> Self {
        Self {
            allowed: true,
            remaining,
            reset_at,
            retry_after: None,
            limit,
            warning: None,
        }
    }

    /// Create a denying decision.
    pub fn denied(limit: u64, reset_at: DateTime<Utc>, retry_after: Duration) -> Self {
        Self {
            allowed: false,
            remaining: 0,
            reset_at,
            retry_after: Some(retry_after),
            limit,
            warning: None,
        }
    }

    /// Attach a warning code.
    pub fn with_warning(mut self, code: ErrorCode) -> Self {
        self.warning = Some(code);
        self
    }

    /// Standard rate limit response headers for this decision.
    ///
    /// `X-RateLimit-Reset` is a Unix timestamp in seconds; `Retry-After` is
    /// whole seconds, rounded up.
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        let mut headers = vec![
            ("X-RateLimit-Limit", self.limit.to_string()),
            ("X-RateLimit-Remaining", self.remaining.to_string()),
            ("X-RateLimit-Reset", ceil_unix_secs(self.reset_at).to_string()),
        ];

        if let Some(retry) = self.retry_after {
            headers.push(("Retry-After", ceil_secs(retry).to_string()));
        }

        headers
    }
}

fn ceil_secs(d: Duration) -> u64 {
    d.as_secs() + u64::from(d.subsec_nanos() > 0)
}

fn ceil_unix_secs(t: DateTime<Utc>) -> i64 {
    t.timestamp() + i64::from(t.timestamp_subsec_nanos() > 0)
}

fn serialize_millis<S: Serializer>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
    match value {
        Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
        None => serializer.serialize_none(),
    }
}
