//! Poll/cooldown state machine for one viewer.
//!
//! The session is fed one reading per poll tick and decides whether that
//! reading is a user-visible "data changed" event. It owns no timer: the
//! caller supplies `now`, which keeps cooldown behavior testable without a
//! runtime.
//!
//! ```text
//!            first read                change, cooldown open
//!   Idle ───────────────► Polling ─────────────────────────► CoolingDown
//!                            ▲                                   │
//!                            └──────── cooldown elapsed ─────────┘
//! ```
//!
//! A change seen while cooling down is absorbed silently: the baseline moves
//! so the same change is never reported later.

use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollState {
    /// Mounted, no successful read yet.
    Idle,
    Polling,
    /// A notification fired less than `cooldown` ago.
    CoolingDown,
}

/// One user-visible notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataChanged {
    /// The freshness timestamp that triggered the notification.
    pub refreshed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSettings {
    pub interval: Duration,
    pub cooldown: Duration,
}

impl Default for PollSettings {
    /// 5 minute poll, 15 minute cooldown.
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            cooldown: Duration::from_secs(900),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PollSession {
    settings: PollSettings,
    state: PollState,
    last_observed: Option<DateTime<Utc>>,
    last_notified_at: Option<Instant>,
    consecutive_failures: u32,
}

impl PollSession {
    pub fn new(settings: PollSettings) -> Self {
        Self {
            settings,
            state: PollState::Idle,
            last_observed: None,
            last_notified_at: None,
            consecutive_failures: 0,
        }
    }

    pub fn state(&self) -> PollState {
        self.state
    }

    pub fn last_observed(&self) -> Option<DateTime<Utc>> {
        self.last_observed
    }

    pub fn last_notified_at(&self) -> Option<Instant> {
        self.last_notified_at
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Feed a successful read of `lastRefresh` taken at `now`.
    ///
    /// Returns the notification to show, if any. The first read only sets the
    /// baseline; later reads notify when the timestamp is strictly newer and
    /// the cooldown since the previous notification has elapsed.
    pub fn observe(&mut self, latest: Option<DateTime<Utc>>, now: Instant) -> Option<DataChanged> {
        self.consecutive_failures = 0;

        if self.state == PollState::Idle {
            self.last_observed = latest;
            self.state = PollState::Polling;
            return None;
        }

        if self.state == PollState::CoolingDown && self.cooldown_elapsed(now) {
            self.state = PollState::Polling;
        }

        let refreshed_at = match latest {
            Some(at) if self.last_observed.is_none_or(|seen| at > seen) => at,
            _ => return None,
        };
        self.last_observed = Some(refreshed_at);

        if !self.cooldown_elapsed(now) {
            tracing::debug!(refreshed_at = %refreshed_at, "Change absorbed during cooldown");
            return None;
        }

        self.last_notified_at = Some(now);
        self.state = PollState::CoolingDown;
        Some(DataChanged { refreshed_at })
    }

    /// Record a failed read. The baseline is left untouched.
    pub fn record_failure(&mut self) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
    }

    fn cooldown_elapsed(&self, now: Instant) -> bool {
        self.last_notified_at
            .is_none_or(|at| now.saturating_duration_since(at) >= self.settings.cooldown)
    }
}
