//! Headless dashboard viewer: mounts one poll session against a running BFF
//! and logs each "data changed" notification.

use tokio::signal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use rankalpha_bff::monitor::{HttpFreshnessSource, MonitorConfig, PollHandle};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = MonitorConfig::from_env();
    tracing::info!(
        url = %config.url,
        interval_ms = config.settings.interval.as_millis(),
        cooldown_ms = config.settings.cooldown.as_millis(),
        "Watching data freshness"
    );

    let source = HttpFreshnessSource::new(config.url.clone(), config.request_timeout)?;
    let mut handle = PollHandle::spawn(source, config.settings);

    loop {
        tokio::select! {
            event = handle.next_event() => match event {
                Some(event) => tracing::info!(
                    refreshed_at = %event.refreshed_at,
                    "Data Updated: new data as of {}",
                    event.refreshed_at.to_rfc2822()
                ),
                None => break,
            },
            result = signal::ctrl_c() => {
                result?;
                tracing::info!("Received Ctrl+C, unmounting...");
                break;
            }
        }
    }

    handle.dispose().await;
    Ok(())
}
