use axum::body::Bytes;
use reqwest::{Client, Url};
use std::time::Duration;

use crate::config::Config;
use crate::error::{AppError, AppResult};

/// Read-only client for the origin analytics API.
pub struct OriginClient {
    http_client: Client,
    base_url: Url,
    timeout: Duration,
}

impl OriginClient {
    /// # Errors
    ///
    /// Returns `AppError::Internal` if the base URL is invalid or the HTTP
    /// client cannot be built.
    pub fn new(config: &Config) -> AppResult<Self> {
        let base_url = Url::parse(&config.origin_base_url)
            .map_err(|e| AppError::Internal(format!("Invalid ORIGIN_API_URL: {e}")))?;
        if base_url.cannot_be_a_base() {
            return Err(AppError::Internal(format!(
                "ORIGIN_API_URL cannot be a base URL: {base_url}"
            )));
        }

        let timeout = config.origin_timeout();
        let http_client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::Internal(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            http_client,
            base_url,
            timeout,
        })
    }

    #[must_use]
    pub fn base_url(&self) -> &str {
        self.base_url.as_str()
    }

    /// Build the origin URL for `segments` with `query` forwarded verbatim.
    ///
    /// Segments are percent-encoded, so a symbol cannot escape its path slot.
    pub fn url_for(&self, segments: &[&str], query: &[(String, String)]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        if !query.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (name, value) in query {
                pairs.append_pair(name, value);
            }
        }
        url
    }

    /// GET a JSON document from the origin and return its raw bytes.
    ///
    /// # Errors
    ///
    /// - `AppError::Upstream` with the origin's status if it answers non-2xx.
    /// - `AppError::OriginTimeout` if the request exceeds the client timeout.
    /// - `AppError::OriginUnreachable` on transport failure or a non-JSON body.
    pub async fn get_json(
        &self,
        segments: &[&str],
        query: &[(String, String)],
    ) -> AppResult<Bytes> {
        let url = self.url_for(segments, query);

        let response = self.http_client.get(url.clone()).send().await.map_err(|e| {
            if e.is_timeout() {
                AppError::OriginTimeout(self.timeout)
            } else {
                AppError::OriginUnreachable(format!("Request failed: {e}"))
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let details = response.text().await.unwrap_or_default();
            tracing::debug!(url = %url, status = %status, "Origin returned error status");
            return Err(AppError::Upstream { status, details });
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| AppError::OriginUnreachable(format!("Failed to read response: {e}")))?;

        serde_json::from_slice::<serde::de::IgnoredAny>(&body).map_err(|e| {
            tracing::error!(
                url = %url,
                error = %e,
                body_preview = %String::from_utf8_lossy(&body).chars().take(500).collect::<String>(),
                "Failed to parse origin response"
            );
            AppError::OriginUnreachable(format!("Failed to parse response: {e}"))
        })?;

        Ok(body)
    }
}
