pub mod health;
pub mod proxy;
pub mod refresh;

use axum::{routing::get, Router};
use std::sync::Arc;
use tower_governor::{governor::GovernorConfigBuilder, GovernorLayer};
use tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
    limit::RequestBodyLimitLayer,
    trace::TraceLayer,
};
use utoipa::OpenApi;
use utoipa_scalar::{Scalar, Servable};

use crate::common::AppState;
use crate::services::rate_limit::ClientIpKeyExtractor;

#[derive(OpenApi)]
#[openapi(
    paths(
        health::healthz,
        refresh::trigger_refresh,
        refresh::last_refresh,
        proxy::grades,
        proxy::grade,
        proxy::asset,
        proxy::sectors,
        proxy::pipeline_health,
        proxy::ai_analyses,
        proxy::ai_analysis,
        proxy::screener_consensus,
    ),
    components(
        schemas(
            refresh::RefreshRequest,
            refresh::RefreshTriggered,
            refresh::LastRefresh,
        )
    ),
    tags(
        (name = "health", description = "Health check endpoints"),
        (name = "refresh", description = "Data-freshness trigger and state"),
        (name = "grading", description = "Cached grading reads"),
        (name = "pipeline", description = "Cached pipeline reads"),
        (name = "ai-analysis", description = "Cached AI analysis reads"),
        (name = "screener", description = "Cached screener reads"),
    ),
    info(
        title = "RankAlpha BFF",
        description = "Backend-for-frontend with tag-scoped caching and data-freshness notifications",
        version = "0.1.0"
    )
)]
struct ApiDoc;

/// Interval after which one token returns to a client's bucket, for a
/// sustained rate of `per_second` requests.
fn replenish_interval_ms(per_second: u64) -> u64 {
    (1000 / per_second.max(1)).max(1)
}

pub fn build_router(state: AppState) -> Router {
    let config = &state.config;

    if config.disable_rate_limiting {
        tracing::warn!("Rate limiting DISABLED");
    } else {
        tracing::info!(
            proxy_rate = %format!("{}/s burst {}", config.rate_limit_per_second, config.rate_limit_burst),
            replenish_ms = replenish_interval_ms(config.rate_limit_per_second),
            "Rate limiting configured"
        );
    }

    let proxy_routes_base = Router::new()
        .route("/grading/grades", get(proxy::grades))
        .route("/grading/grades/{symbol}", get(proxy::grade))
        .route("/grading/asset/{symbol}", get(proxy::asset))
        .route("/grading/sectors", get(proxy::sectors))
        .route("/pipeline/health", get(proxy::pipeline_health))
        .route("/ai-analysis", get(proxy::ai_analyses))
        .route("/ai-analysis/{symbol}", get(proxy::ai_analysis))
        .route("/screener/consensus", get(proxy::screener_consensus));

    let proxy_routes = if config.disable_rate_limiting {
        proxy_routes_base
    } else {
        let limiter = GovernorConfigBuilder::default()
            .key_extractor(ClientIpKeyExtractor)
            .per_millisecond(replenish_interval_ms(config.rate_limit_per_second))
            .burst_size(config.rate_limit_burst)
            .finish()
            .expect("Failed to create proxy rate limiter");

        proxy_routes_base.layer(GovernorLayer {
            config: Arc::new(limiter),
        })
    };

    // Pipeline and pollers hit these; never rate-limited.
    // `/refresh-data` is the path the pipeline scheduler already calls.
    let refresh_routes = Router::new()
        .route(
            "/refresh",
            get(refresh::last_refresh).post(refresh::trigger_refresh),
        )
        .route(
            "/refresh-data",
            get(refresh::last_refresh).post(refresh::trigger_refresh),
        );

    let api_routes = Router::new()
        .merge(proxy_routes)
        .merge(refresh_routes)
        .layer(RequestBodyLimitLayer::new(1024 * 1024)); // 1MB body limit

    let health_routes = Router::new().route("/healthz", get(health::healthz));

    let docs_routes = Router::new().merge(Scalar::with_url("/docs", ApiDoc::openapi()));

    Router::new()
        .nest("/api", api_routes)
        .merge(health_routes)
        .merge(docs_routes)
        .layer(CompressionLayer::new())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replenish_interval_follows_rate() {
        assert_eq!(replenish_interval_ms(10), 100);
        assert_eq!(replenish_interval_ms(1), 1000);
        assert_eq!(replenish_interval_ms(0), 1000);
        assert_eq!(replenish_interval_ms(5000), 1);
    }
}
