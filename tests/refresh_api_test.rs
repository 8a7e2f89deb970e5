//! End-to-end tests of the refresh endpoints and the cached proxy routes.
//!
//! A throwaway axum server plays the origin API so the real HTTP client,
//! cache and router are exercised together.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    extract::{RawQuery, State},
    http::{header, Request, StatusCode},
    response::Response,
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tower::ServiceExt;

use rankalpha_bff::common::AppState;
use rankalpha_bff::config::Config;
use rankalpha_bff::origin::OriginClient;
use rankalpha_bff::routes::build_router;
use rankalpha_bff::services::cache::TaggedCache;
use rankalpha_bff::services::freshness::FreshnessState;
use rankalpha_bff::services::invalidation::{BusError, GenerationStore, InvalidationBus, InvalidationTable};
use rankalpha_bff::services::refresh::{RefreshScope, RefreshService};

struct Harness {
    app: Router,
    state: AppState,
    origin_hits: Arc<AtomicUsize>,
}

async fn grades(State(hits): State<Arc<AtomicUsize>>, RawQuery(query): RawQuery) -> Json<Value> {
    let version = hits.fetch_add(1, Ordering::SeqCst) + 1;
    Json(json!({ "version": version, "query": query }))
}

async fn spawn_origin() -> (String, Arc<AtomicUsize>) {
    let hits = Arc::new(AtomicUsize::new(0));
    let origin = Router::new()
        .route("/api/v1/grading/grades", get(grades))
        .route(
            "/api/v1/pipeline/health",
            get(|| async { (StatusCode::SERVICE_UNAVAILABLE, "pipeline is loading") }),
        )
        .with_state(Arc::clone(&hits));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, origin).await.unwrap();
    });

    (format!("http://{addr}"), hits)
}

fn test_config(origin_base_url: String) -> Config {
    Config {
        origin_base_url,
        origin_timeout_seconds: 2,
        disable_rate_limiting: true,
        ..Config::default()
    }
}

async fn harness() -> Harness {
    let (base_url, origin_hits) = spawn_origin().await;
    let config = test_config(base_url);
    let origin = OriginClient::new(&config).unwrap();
    let state = AppState::new(config, origin);
    Harness {
        app: build_router(state.clone()),
        state,
        origin_hits,
    }
}

async fn send(app: &Router, request: Request<Body>) -> Response {
    app.clone().oneshot(request).await.unwrap()
}

fn get_req(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post_req(uri: &str, body: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn json_body(response: Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn x_cache(response: &Response) -> &str {
    response
        .headers()
        .get("X-Cache")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
}

async fn settle(cache: &TaggedCache) {
    while cache.revalidations_in_flight() > 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn last_refresh_is_null_until_first_trigger() {
    let h = harness().await;

    let before = json_body(send(&h.app, get_req("/api/refresh")).await).await;
    assert_eq!(before, json!({ "lastRefresh": null }));

    let response = send(&h.app, post_req("/api/refresh", "")).await;
    assert_eq!(response.status(), StatusCode::OK);
    let triggered = json_body(response).await;
    assert_eq!(triggered["status"], "success");
    assert_eq!(triggered["message"], "Data refresh triggered");
    let t1: DateTime<Utc> = serde_json::from_value(triggered["timestamp"].clone()).unwrap();

    let after = json_body(send(&h.app, get_req("/api/refresh")).await).await;
    let seen: DateTime<Utc> = serde_json::from_value(after["lastRefresh"].clone()).unwrap();
    assert_eq!(seen, t1);
}

#[tokio::test]
async fn refresh_data_alias_shares_state() {
    let h = harness().await;

    send(&h.app, post_req("/api/refresh-data", "")).await;
    let via_alias = json_body(send(&h.app, get_req("/api/refresh-data")).await).await;
    let via_main = json_body(send(&h.app, get_req("/api/refresh")).await).await;

    assert!(!via_main["lastRefresh"].is_null());
    assert_eq!(via_alias, via_main);
}

#[tokio::test]
async fn repeated_triggers_keep_timestamp_monotonic() {
    let h = harness().await;

    let mut previous: Option<DateTime<Utc>> = None;
    for _ in 0..5 {
        let triggered = json_body(send(&h.app, post_req("/api/refresh", "")).await).await;
        let at: DateTime<Utc> = serde_json::from_value(triggered["timestamp"].clone()).unwrap();
        if let Some(previous) = previous {
            assert!(at >= previous);
        }
        previous = Some(at);
    }
}

#[tokio::test]
async fn trigger_reports_bumped_tags() {
    let h = harness().await;

    let triggered = json_body(send(&h.app, post_req("/api/refresh", "")).await).await;
    let mut invalidated: Vec<String> = serde_json::from_value(triggered["invalidated"].clone()).unwrap();
    invalidated.sort();
    assert_eq!(invalidated, ["asset", "grade", "grades", "health", "pipeline"]);
    assert_eq!(triggered["deferred"], json!([]));

    let scoped = json_body(
        send(&h.app, post_req("/api/refresh", r#"{"domains":["pipeline"]}"#)).await,
    )
    .await;
    assert_eq!(scoped["invalidated"], json!(["health", "pipeline"]));
}

#[tokio::test]
async fn unknown_domain_is_rejected_without_side_effects() {
    let h = harness().await;

    let response = send(&h.app, post_req("/api/refresh", r#"{"domains":["weather"]}"#)).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = json_body(response).await;
    assert_eq!(body["error"], "Bad request");

    let state = json_body(send(&h.app, get_req("/api/refresh")).await).await;
    assert!(state["lastRefresh"].is_null());
}

#[tokio::test]
async fn malformed_body_is_rejected() {
    let h = harness().await;

    let response = send(&h.app, post_req("/api/refresh", "{not json")).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn second_read_is_served_from_cache() {
    let h = harness().await;

    let first = send(&h.app, get_req("/api/grading/grades?limit=50&skip=0")).await;
    assert_eq!(first.status(), StatusCode::OK);
    assert_eq!(x_cache(&first), "MISS");
    let cache_control = first
        .headers()
        .get(header::CACHE_CONTROL)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    assert_eq!(cache_control, "s-maxage=60, stale-while-revalidate=120");

    // Same parameters, different order
    let second = send(&h.app, get_req("/api/grading/grades?skip=0&limit=50")).await;
    assert_eq!(x_cache(&second), "HIT");
    assert_eq!(json_body(second).await["version"], 1);
    assert_eq!(h.origin_hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn query_string_is_forwarded_to_origin() {
    let h = harness().await;

    let body = json_body(send(&h.app, get_req("/api/grading/grades?limit=5&sort_by=grade")).await).await;
    assert_eq!(body["query"], "limit=5&sort_by=grade");
}

#[tokio::test]
async fn distinct_queries_are_cached_separately() {
    let h = harness().await;

    send(&h.app, get_req("/api/grading/grades?limit=5")).await;
    let other = send(&h.app, get_req("/api/grading/grades?limit=10")).await;

    assert_eq!(x_cache(&other), "MISS");
    assert_eq!(h.origin_hits.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn refresh_serves_stale_then_new_payload() {
    let h = harness().await;

    send(&h.app, get_req("/api/grading/grades")).await;
    send(&h.app, post_req("/api/refresh", "")).await;

    let stale = send(&h.app, get_req("/api/grading/grades")).await;
    assert_eq!(x_cache(&stale), "STALE");
    assert_eq!(json_body(stale).await["version"], 1);

    settle(&h.state.cache).await;
    assert_eq!(h.origin_hits.load(Ordering::SeqCst), 2);

    let fresh = send(&h.app, get_req("/api/grading/grades")).await;
    assert_eq!(x_cache(&fresh), "HIT");
    assert_eq!(json_body(fresh).await["version"], 2);
}

#[tokio::test]
async fn purge_trigger_forces_fetch() {
    let h = harness().await;

    send(&h.app, get_req("/api/grading/grades")).await;
    send(&h.app, post_req("/api/refresh", r#"{"purge":true}"#)).await;

    let read = send(&h.app, get_req("/api/grading/grades")).await;
    assert_eq!(x_cache(&read), "MISS");
    assert_eq!(json_body(read).await["version"], 2);
}

#[tokio::test]
async fn no_cache_request_bypasses_cache() {
    let h = harness().await;

    send(&h.app, get_req("/api/grading/grades")).await;
    let request = Request::builder()
        .uri("/api/grading/grades")
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::empty())
        .unwrap();
    let bypass = send(&h.app, request).await;
    assert_eq!(x_cache(&bypass), "MISS");
    assert_eq!(json_body(bypass).await["version"], 2);

    // The bypassing read refreshed the entry for everyone else
    let cached = send(&h.app, get_req("/api/grading/grades")).await;
    assert_eq!(x_cache(&cached), "HIT");
    assert_eq!(json_body(cached).await["version"], 2);
}

#[tokio::test]
async fn origin_error_status_is_preserved() {
    let h = harness().await;

    let response = send(&h.app, get_req("/api/pipeline/health")).await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body = json_body(response).await;
    assert_eq!(
        body,
        json!({ "error": "Upstream error", "details": "pipeline is loading" })
    );

    // Failures are never cached
    let again = send(&h.app, get_req("/api/pipeline/health")).await;
    assert_eq!(again.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn unreachable_origin_answers_bad_gateway() {
    // Grab a free port, then close it so nothing listens there
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let config = test_config(format!("http://{addr}"));
    let origin = OriginClient::new(&config).unwrap();
    let app = build_router(AppState::new(config, origin));

    let response = send(&app, get_req("/api/grading/grades")).await;
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    let body = json_body(response).await;
    assert_eq!(body["error"], "Failed to reach API");
}

#[tokio::test]
async fn rate_limited_client_recovers_at_configured_rate() {
    let (base_url, _hits) = spawn_origin().await;
    let config = Config {
        disable_rate_limiting: false,
        rate_limit_per_second: 10,
        rate_limit_burst: 2,
        ..test_config(base_url)
    };
    let origin = OriginClient::new(&config).unwrap();
    let app = build_router(AppState::new(config, origin));

    let mut statuses = Vec::new();
    for _ in 0..3 {
        statuses.push(send(&app, get_req("/api/grading/grades")).await.status());
    }
    assert_eq!(
        statuses,
        [StatusCode::OK, StatusCode::OK, StatusCode::TOO_MANY_REQUESTS]
    );

    // 10/s puts a token back every 100ms
    tokio::time::sleep(Duration::from_millis(300)).await;
    let response = send(&app, get_req("/api/grading/grades")).await;
    assert_eq!(response.status(), StatusCode::OK);

    // Refresh endpoints sit outside the limiter
    let refresh = send(&app, post_req("/api/refresh", "")).await;
    assert_eq!(refresh.status(), StatusCode::OK);
}

#[tokio::test]
async fn healthz_is_independent_of_origin() {
    let h = harness().await;

    let response = send(&h.app, get_req("/healthz")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(h.origin_hits.load(Ordering::SeqCst), 0);
}

/// Store whose bumps fail for `asset` while `failing` is set.
struct FlakyStore {
    inner: InvalidationBus,
    failing: std::sync::atomic::AtomicBool,
}

impl GenerationStore for FlakyStore {
    fn bump(&self, tag: &str) -> Result<u64, BusError> {
        if self.failing.load(Ordering::SeqCst) && tag == "asset" {
            return Err(BusError::Unavailable("store offline".to_string()));
        }
        self.inner.bump(tag)
    }

    fn generation_of(&self, tag: &str) -> u64 {
        self.inner.generation_of(tag)
    }
}

#[tokio::test]
async fn failed_bump_is_deferred_and_retried() {
    let store = Arc::new(FlakyStore {
        inner: InvalidationBus::new(),
        failing: std::sync::atomic::AtomicBool::new(true),
    });
    let cache = TaggedCache::new(store.clone(), 1024 * 1024);
    let service = RefreshService::new(
        InvalidationTable::default(),
        Arc::new(FreshnessState::new()),
        store.clone(),
        cache,
    );

    let scope = RefreshScope {
        domains: Some(vec!["pipeline".to_string()]),
        purge: false,
    };
    let first = service
        .trigger(&RefreshScope {
            domains: None,
            purge: false,
        })
        .unwrap();
    assert_eq!(first.deferred, ["asset"]);
    assert!(!first.invalidated.contains(&"asset".to_string()));
    assert_eq!(service.last_refresh_at(), Some(first.last_refresh_at));

    store.failing.store(false, Ordering::SeqCst);
    let second = service.trigger(&scope).unwrap();
    assert!(second.deferred.is_empty());
    assert_eq!(second.invalidated, ["asset", "health", "pipeline"]);
    assert_eq!(store.generation_of("asset"), 1);
}
