//! Timer that drives a [`PollSession`] against a freshness source.

use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use std::future::Future;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};

use crate::monitor::session::{DataChanged, PollSession, PollSettings};
use crate::routes::refresh::LastRefresh;

#[derive(Debug, thiserror::Error)]
pub enum PollError {
    #[error("Request failed: {0}")]
    Request(String),

    #[error("Unexpected status {0}")]
    Status(StatusCode),

    #[error("Failed to parse response: {0}")]
    Decode(String),
}

/// Where a poll session reads `lastRefresh` from.
pub trait FreshnessSource: Send + Sync + 'static {
    fn last_refresh(&self) -> impl Future<Output = Result<Option<DateTime<Utc>>, PollError>> + Send;
}

/// Reads `GET /api/refresh` of a running BFF.
pub struct HttpFreshnessSource {
    http_client: Client,
    url: String,
}

impl HttpFreshnessSource {
    /// # Errors
    ///
    /// Returns `PollError::Request` if the HTTP client cannot be built.
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, PollError> {
        let http_client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PollError::Request(e.to_string()))?;
        Ok(Self {
            http_client,
            url: url.into(),
        })
    }
}

impl FreshnessSource for HttpFreshnessSource {
    async fn last_refresh(&self) -> Result<Option<DateTime<Utc>>, PollError> {
        let response = self
            .http_client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| PollError::Request(e.to_string()))?;

        if !response.status().is_success() {
            return Err(PollError::Status(response.status()));
        }

        let body: LastRefresh = response
            .json()
            .await
            .map_err(|e| PollError::Decode(e.to_string()))?;
        Ok(body.last_refresh)
    }
}

/// A mounted poll session.
///
/// Exactly one timer runs per handle. Disposing (or dropping) the handle
/// stops the timer; no event is delivered afterwards.
pub struct PollHandle {
    events: mpsc::Receiver<DataChanged>,
    shutdown: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl PollHandle {
    /// Mount a session: read immediately, then every `settings.interval`.
    pub fn spawn<S: FreshnessSource>(source: S, settings: PollSettings) -> Self {
        let (event_tx, events) = mpsc::channel(8);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(run_session(source, settings, event_tx, shutdown_rx));
        Self {
            events,
            shutdown,
            task: Some(task),
        }
    }

    /// Wait for the next notification. `None` once the session stopped.
    pub async fn next_event(&mut self) -> Option<DataChanged> {
        self.events.recv().await
    }

    /// Stop the timer and wait for the poll loop to exit.
    pub async fn dispose(mut self) {
        let _ = self.shutdown.send(true);
        self.events.close();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Poll task ended abnormally");
            }
        }
    }
}

impl Drop for PollHandle {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn run_session<S: FreshnessSource>(
    source: S,
    settings: PollSettings,
    events: mpsc::Sender<DataChanged>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut session = PollSession::new(settings);
    let mut ticker = interval(settings.interval.max(Duration::from_millis(1)));
    // A tick that fires while a read is still in flight is dropped, not queued.
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    tracing::debug!(
        interval_ms = settings.interval.as_millis(),
        cooldown_ms = settings.cooldown.as_millis(),
        "Poll session mounted"
    );

    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {}
        }

        let read = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            read = source.last_refresh() => read,
        };

        match read {
            Ok(latest) => {
                let Some(event) = session.observe(latest, Instant::now()) else {
                    continue;
                };
                tracing::debug!(refreshed_at = %event.refreshed_at, "Data change detected");
                let delivered = tokio::select! {
                    biased;
                    _ = shutdown.changed() => false,
                    sent = events.send(event) => sent.is_ok(),
                };
                if !delivered {
                    break;
                }
            }
            Err(e) => {
                session.record_failure();
                tracing::debug!(
                    error = %e,
                    failures = session.consecutive_failures(),
                    "Freshness poll failed, retrying next tick"
                );
            }
        }
    }

    tracing::debug!("Poll session disposed");
}
