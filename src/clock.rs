//! Time sources for rate limit decisions.
//!
//! Algorithms never read the wall clock directly; the facade asks its
//! [`Clock`] once per call and threads that instant through the store.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

/// Clock abstraction so timing can be faked in tests.
pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock backed by `Utc::now()`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A manually driven clock. Clones share the same instant.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    /// Create a clock frozen at `start`.
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    /// Create a clock frozen at the Unix epoch.
    pub fn at_epoch() -> Self {
        Self::new(DateTime::<Utc>::UNIX_EPOCH)
    }

    /// Move the clock forward.
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        *now = add(*now, by);
    }

    /// Jump to an absolute instant.
    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock() = to;
    }

    /// Jump to `offset` after the Unix epoch.
    pub fn set_since_epoch(&self, offset: Duration) {
        self.set(at_offset(offset));
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

/// The instant `offset` after the Unix epoch.
pub fn at_offset(offset: Duration) -> DateTime<Utc> {
    add(DateTime::<Utc>::UNIX_EPOCH, offset)
}

/// `now + d`, saturating at the maximum representable instant.
pub(crate) fn add(now: DateTime<Utc>, d: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(d)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_advance_is_shared() {
        let clock = ManualClock::at_epoch();
        let other = clock.clone();

        clock.advance(Duration::from_millis(1500));

        assert_eq!(other.now().timestamp_millis(), 1500);
    }

    #[test]
    fn test_manual_clock_set_since_epoch() {
        let clock = ManualClock::at_epoch();
        clock.set_since_epoch(Duration::from_secs(90));
        assert_eq!(clock.now().timestamp(), 90);
    }

    #[test]
    fn test_system_clock_moves_forward() {
        let clock = SystemClock;
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
    }

    #[test]
    fn test_add_saturates() {
        let max = DateTime::<Utc>::MAX_UTC;
        assert_eq!(add(max, Duration::from_secs(1)), max);
    }
}
