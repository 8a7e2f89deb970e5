//! Viewer-side freshness monitor.
//!
//! Turns the BFF's `lastRefresh` timestamp into at most one "data changed"
//! notification per cooldown window, however often it is polled.

pub mod poller;
pub mod session;

pub use poller::{FreshnessSource, HttpFreshnessSource, PollError, PollHandle};
pub use session::{DataChanged, PollSession, PollSettings, PollState};

use std::env;
use std::time::Duration;

use crate::config::parse_var;

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub url: String,
    pub settings: PollSettings,
    pub request_timeout: Duration,
}

impl MonitorConfig {
    /// Load the monitor settings from environment variables.
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        let defaults = PollSettings::default();

        Self {
            url: env::var("MONITOR_URL")
                .unwrap_or_else(|_| "http://localhost:3000/api/refresh".to_string()),
            settings: PollSettings {
                interval: Duration::from_millis(parse_var(
                    "POLL_INTERVAL_MS",
                    u64::try_from(defaults.interval.as_millis()).unwrap_or(300_000),
                )),
                cooldown: Duration::from_millis(parse_var(
                    "POLL_COOLDOWN_MS",
                    u64::try_from(defaults.cooldown.as_millis()).unwrap_or(900_000),
                )),
            },
            request_timeout: Duration::from_secs(parse_var("MONITOR_TIMEOUT_SECONDS", 10)),
        }
    }
}
