//! Process-wide record of when the pipeline last announced new data.

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicI64, Ordering};

const ABSENT: i64 = i64::MIN;

/// Monotonic `lastRefreshAt`, stored as epoch milliseconds.
///
/// Readers do a single atomic load. Concurrent writers merge with `max`, so an
/// out-of-order trigger can never move the timestamp backwards.
#[derive(Debug)]
pub struct FreshnessState {
    last_refresh_ms: AtomicI64,
}

impl Default for FreshnessState {
    fn default() -> Self {
        Self {
            last_refresh_ms: AtomicI64::new(ABSENT),
        }
    }
}

impl FreshnessState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_refresh_at(&self) -> Option<DateTime<Utc>> {
        from_millis(self.last_refresh_ms.load(Ordering::Acquire))
    }

    /// Merge `at` into the state and return the resulting `lastRefreshAt`.
    ///
    /// An `at` older than the current value is clamped to the current value.
    pub fn advance(&self, at: DateTime<Utc>) -> DateTime<Utc> {
        let candidate = at.timestamp_millis();
        let previous = self.last_refresh_ms.fetch_max(candidate, Ordering::AcqRel);
        let current = previous.max(candidate);
        from_millis(current).unwrap_or(at)
    }
}

fn from_millis(ms: i64) -> Option<DateTime<Utc>> {
    if ms == ABSENT {
        return None;
    }
    DateTime::from_timestamp_millis(ms)
}
