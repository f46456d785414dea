//! Error types for the Sluice rate limiter.

use std::fmt;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

/// Main error type for Sluice operations.
#[derive(Error, Debug)]
pub enum SluiceError {
    /// A rule set was rejected before activation. Lists every offending rule.
    #[error("Invalid rule set: {}", violations.join("; "))]
    InvalidRule { violations: Vec<String> },

    /// No rule matched and no default rule is configured.
    #[error("Unknown rule: {0}")]
    UnknownRule(String),

    /// The storage backend could not be reached.
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// The store round-trip exceeded its deadline; the outcome is unknown.
    #[error("Store operation timed out after {0:?}")]
    StoreTimeout(Duration),

    /// Stored state for a key could not be parsed.
    #[error("Corrupt state for key {key}: {reason}")]
    StateCorrupt { key: String, reason: String },

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SluiceError {
    /// Create a store unavailable error.
    pub fn unavailable<S: Into<String>>(msg: S) -> Self {
        Self::StoreUnavailable(msg.into())
    }

    /// Create a state corruption error.
    pub fn corrupt<K: Into<String>, R: Into<String>>(key: K, reason: R) -> Self {
        Self::StateCorrupt {
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// The stable code for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidRule { .. } => ErrorCode::InvalidRule,
            Self::UnknownRule(_) => ErrorCode::UnknownRule,
            Self::StoreUnavailable(_) => ErrorCode::StoreUnavailable,
            Self::StoreTimeout(_) => ErrorCode::StoreTimeout,
            Self::StateCorrupt { .. } => ErrorCode::StateCorrupt,
            Self::Config(_) => ErrorCode::Config,
            Self::Io(_) => ErrorCode::Io,
        }
    }

    /// Whether the error came from the store being unreachable or slow.
    ///
    /// These are the errors a fail-open or fail-closed policy answers for.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::StoreUnavailable(_) | Self::StoreTimeout(_))
    }
}

/// Stable, copyable identifier for an error kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    InvalidRule,
    UnknownRule,
    StoreUnavailable,
    StoreTimeout,
    StateCorrupt,
    Config,
    Io,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidRule => "invalid_rule",
            ErrorCode::UnknownRule => "unknown_rule",
            ErrorCode::StoreUnavailable => "store_unavailable",
            ErrorCode::StoreTimeout => "store_timeout",
            ErrorCode::StateCorrupt => "state_corrupt",
            ErrorCode::Config => "config",
            ErrorCode::Io => "io",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result type alias for Sluice operations.
pub type Result<T> = std::result::Result<T, SluiceError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_rule_lists_every_violation() {
        let err = SluiceError::InvalidRule {
            violations: vec!["rule 'a': limit must be > 0".into(), "rule 'b': duplicate name".into()],
        };
        let msg = err.to_string();
        assert!(msg.contains("rule 'a'"));
        assert!(msg.contains("rule 'b'"));
        assert_eq!(err.code(), ErrorCode::InvalidRule);
    }

    #[test]
    fn test_transient_errors() {
        assert!(SluiceError::unavailable("connection refused").is_transient());
        assert!(SluiceError::StoreTimeout(Duration::from_millis(5)).is_transient());
        assert!(!SluiceError::UnknownRule("x".into()).is_transient());
        assert!(!SluiceError::corrupt("k", "bad").is_transient());
    }

    #[test]
    fn test_error_code_strings() {
        assert_eq!(ErrorCode::StoreTimeout.to_string(), "store_timeout");
        assert_eq!(
            SluiceError::corrupt("k", "nan tokens").code().as_str(),
            "state_corrupt"
        );
    }
}
