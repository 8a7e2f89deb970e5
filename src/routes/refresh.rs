use axum::{body::Bytes, extract::State, Json};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::common::AppState;
use crate::error::{AppError, AppResult};
use crate::services::refresh::{RefreshError, RefreshScope};

/// Optional body of a refresh trigger. An empty body refreshes every domain.
#[derive(Debug, Default, Deserialize, ToSchema)]
pub struct RefreshRequest {
    /// Only bump tags of these invalidation domains
    #[serde(default)]
    pub domains: Option<Vec<String>>,
    /// Evict affected entries instead of serving them stale once more
    #[serde(default)]
    pub purge: bool,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct RefreshTriggered {
    pub status: String,
    pub message: String,
    /// New `lastRefresh` value
    pub timestamp: DateTime<Utc>,
    /// Tags whose generation advanced
    pub invalidated: Vec<String>,
    /// Tags whose bump failed and will be retried on the next trigger
    pub deferred: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct LastRefresh {
    /// When the pipeline last announced new data, null before the first trigger
    pub last_refresh: Option<DateTime<Utc>>,
}

fn parse_request(body: &[u8]) -> AppResult<RefreshRequest> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(RefreshRequest::default());
    }
    serde_json::from_slice(body).map_err(|e| AppError::BadRequest(format!("Invalid refresh body: {e}")))
}

/// Announce that new pipeline data is ready
///
/// Called by the pipeline scheduler after a data load. Bumps the declared
/// invalidation tags and advances the freshness timestamp.
#[utoipa::path(
    post,
    path = "/api/refresh",
    request_body(content = RefreshRequest, description = "Optional scope; may be empty"),
    responses(
        (status = 200, description = "Refresh recorded", body = RefreshTriggered),
        (status = 400, description = "Malformed body or unknown domain"),
    ),
    tag = "refresh"
)]
pub async fn trigger_refresh(
    State(state): State<AppState>,
    body: Bytes,
) -> AppResult<Json<RefreshTriggered>> {
    let request = parse_request(&body)?;
    let scope = RefreshScope {
        domains: request.domains,
        purge: request.purge,
    };

    let outcome = state.refresh.trigger(&scope).map_err(|e| match e {
        RefreshError::UnknownDomain(_) => AppError::BadRequest(e.to_string()),
    })?;

    Ok(Json(RefreshTriggered {
        status: "success".to_string(),
        message: "Data refresh triggered".to_string(),
        timestamp: outcome.last_refresh_at,
        invalidated: outcome.invalidated,
        deferred: outcome.deferred,
    }))
}

/// Read the freshness timestamp without implying a refresh
#[utoipa::path(
    get,
    path = "/api/refresh",
    responses(
        (status = 200, description = "Current freshness state", body = LastRefresh),
    ),
    tag = "refresh"
)]
pub async fn last_refresh(State(state): State<AppState>) -> Json<LastRefresh> {
    Json(LastRefresh {
        last_refresh: state.refresh.last_refresh_at(),
    })
}
