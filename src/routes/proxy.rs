//! Cached passthrough reads against the origin API.
//!
//! Each route forwards its query string untouched, caches the origin's JSON
//! under the route's tags and reports the cache decision in `X-Cache`.

use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{header, HeaderMap, HeaderValue},
    response::Response,
};
use std::sync::Arc;
use utoipa::IntoParams;

use crate::common::AppState;
use crate::error::{AppError, AppResult};
use crate::services::cache::{cache_key, canonical_query, CachePolicy, CacheRead};

/// Origin path and freshness domains of one proxied read.
#[derive(Debug)]
pub struct ProxyRoute {
    pub upstream: &'static [&'static str],
    pub tags: &'static [&'static str],
}

pub const GRADES: ProxyRoute = ProxyRoute {
    upstream: &["api", "v1", "grading", "grades"],
    tags: &["grading", "grades"],
};

pub const GRADE: ProxyRoute = ProxyRoute {
    upstream: &["api", "v1", "grading", "grades"],
    tags: &["grading", "grade"],
};

pub const ASSET: ProxyRoute = ProxyRoute {
    upstream: &["api", "v1", "grading", "asset"],
    tags: &["grading", "asset"],
};

pub const SECTORS: ProxyRoute = ProxyRoute {
    upstream: &["api", "v1", "grading", "sectors"],
    tags: &["grading", "grades"],
};

pub const PIPELINE_HEALTH: ProxyRoute = ProxyRoute {
    upstream: &["api", "v1", "pipeline", "health"],
    tags: &["pipeline", "health"],
};

pub const AI_ANALYSES: ProxyRoute = ProxyRoute {
    upstream: &["api", "v1", "ai-analysis"],
    tags: &["ai-analysis"],
};

pub const SCREENER_CONSENSUS: ProxyRoute = ProxyRoute {
    upstream: &["api", "v1", "screener", "consensus"],
    tags: &["screener"],
};

/// Common list parameters. Every query parameter is forwarded, these are
/// only the ones the origin documents for its collections.
#[derive(Debug, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct ListParams {
    /// Rows to skip
    pub skip: Option<u32>,
    /// Page size
    pub limit: Option<u32>,
    /// Column to sort by
    pub sort_by: Option<String>,
    /// `asc` or `desc`
    pub sort_order: Option<String>,
}

/// Grade leaderboard
#[utoipa::path(
    get,
    path = "/api/grading/grades",
    params(ListParams),
    responses(
        (status = 200, description = "Origin payload, cached under grading/grades"),
        (status = 502, description = "Origin unreachable"),
    ),
    tag = "grading"
)]
pub async fn grades(
    State(state): State<AppState>,
    Query(query): Query<Vec<(String, String)>>,
    headers: HeaderMap,
) -> AppResult<Response> {
    forward(&state, &GRADES, None, query, &headers).await
}

/// Grade of one symbol
#[utoipa::path(
    get,
    path = "/api/grading/grades/{symbol}",
    params(("symbol" = String, Path, description = "Ticker symbol")),
    responses(
        (status = 200, description = "Origin payload, cached under grading/grade"),
        (status = 404, description = "Unknown symbol (origin status preserved)"),
    ),
    tag = "grading"
)]
pub async fn grade(
    State(state): State<AppState>,
    Path(symbol): Path<String>,
    Query(query): Query<Vec<(String, String)>>,
    headers: HeaderMap,
) -> AppResult<Response> {
    forward(&state, &GRADE, Some(symbol), query, &headers).await
}

/// Asset detail of one symbol
#[utoipa::path(
    get,
    path = "/api/grading/asset/{symbol}",
    params(("symbol" = String, Path, description = "Ticker symbol")),
    responses(
        (status = 200, description = "Origin payload, cached under grading/asset"),
        (status = 404, description = "Unknown symbol (origin status preserved)"),
    ),
    tag = "grading"
)]
pub async fn asset(
    State(state): State<AppState>,
    Path(symbol): Path<String>,
    Query(query): Query<Vec<(String, String)>>,
    headers: HeaderMap,
) -> AppResult<Response> {
    forward(&state, &ASSET, Some(symbol), query, &headers).await
}

/// Sector names
#[utoipa::path(
    get,
    path = "/api/grading/sectors",
    responses((status = 200, description = "Origin payload, cached under grading/grades")),
    tag = "grading"
)]
pub async fn sectors(
    State(state): State<AppState>,
    Query(query): Query<Vec<(String, String)>>,
    headers: HeaderMap,
) -> AppResult<Response> {
    forward(&state, &SECTORS, None, query, &headers).await
}

/// Pipeline health
#[utoipa::path(
    get,
    path = "/api/pipeline/health",
    responses(
        (status = 200, description = "Origin payload, cached under pipeline/health"),
        (status = 502, description = "Origin unreachable"),
    ),
    tag = "pipeline"
)]
pub async fn pipeline_health(
    State(state): State<AppState>,
    Query(query): Query<Vec<(String, String)>>,
    headers: HeaderMap,
) -> AppResult<Response> {
    forward(&state, &PIPELINE_HEALTH, None, query, &headers).await
}

/// AI analyses
#[utoipa::path(
    get,
    path = "/api/ai-analysis",
    params(ListParams),
    responses((status = 200, description = "Origin payload, cached under ai-analysis")),
    tag = "ai-analysis"
)]
pub async fn ai_analyses(
    State(state): State<AppState>,
    Query(query): Query<Vec<(String, String)>>,
    headers: HeaderMap,
) -> AppResult<Response> {
    forward(&state, &AI_ANALYSES, None, query, &headers).await
}

/// Latest AI analysis of one symbol
#[utoipa::path(
    get,
    path = "/api/ai-analysis/{symbol}",
    params(("symbol" = String, Path, description = "Ticker symbol")),
    responses((status = 200, description = "Origin payload, cached under ai-analysis")),
    tag = "ai-analysis"
)]
pub async fn ai_analysis(
    State(state): State<AppState>,
    Path(symbol): Path<String>,
    Query(query): Query<Vec<(String, String)>>,
    headers: HeaderMap,
) -> AppResult<Response> {
    forward(&state, &AI_ANALYSES, Some(symbol), query, &headers).await
}

/// Screener consensus
#[utoipa::path(
    get,
    path = "/api/screener/consensus",
    params(ListParams),
    responses((status = 200, description = "Origin payload, cached under screener")),
    tag = "screener"
)]
pub async fn screener_consensus(
    State(state): State<AppState>,
    Query(query): Query<Vec<(String, String)>>,
    headers: HeaderMap,
) -> AppResult<Response> {
    forward(&state, &SCREENER_CONSENSUS, None, query, &headers).await
}

async fn forward(
    state: &AppState,
    route: &'static ProxyRoute,
    symbol: Option<String>,
    query: Vec<(String, String)>,
    headers: &HeaderMap,
) -> AppResult<Response> {
    let mut segments: Vec<String> = route.upstream.iter().map(ToString::to_string).collect();
    segments.extend(symbol);

    let path = segments.join("/");
    let query_key = canonical_query(&query);
    let key = cache_key("GET", &[path.as_str(), query_key.as_str()]);
    let policy = state.cache_policy;
    let origin = Arc::clone(&state.origin);
    let fetcher = move || async move {
        let segments: Vec<&str> = segments.iter().map(String::as_str).collect();
        origin.get_json(&segments, &query).await
    };

    let read = if bypass_requested(headers) {
        state.cache.refetch(&key, route.tags, policy, fetcher).await?
    } else {
        state.cache.get_or_fetch(&key, route.tags, policy, fetcher).await?
    };

    json_response(read, policy)
}

/// `Cache-Control: no-cache` from the client skips the cached read.
fn bypass_requested(headers: &HeaderMap) -> bool {
    headers
        .get(header::CACHE_CONTROL)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.to_ascii_lowercase().contains("no-cache"))
}

/// Build a JSON response carrying the cache decision and the declared TTLs.
///
/// # Headers
///
/// - `Content-Type: application/json`
/// - `X-Cache: HIT`, `STALE` or `MISS`
/// - `Cache-Control: s-maxage=<fresh>, stale-while-revalidate=<stale>`
fn json_response(read: CacheRead, policy: CachePolicy) -> AppResult<Response> {
    Response::builder()
        .header(header::CONTENT_TYPE, HeaderValue::from_static("application/json"))
        .header("X-Cache", HeaderValue::from_static(read.status.as_header()))
        .header(
            header::CACHE_CONTROL,
            format!(
                "s-maxage={}, stale-while-revalidate={}",
                policy.fresh_ttl.as_secs(),
                policy.stale_ttl.as_secs()
            ),
        )
        .body(Body::from(read.payload))
        .map_err(|e| AppError::Internal(e.to_string()))
}
