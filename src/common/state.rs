use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::origin::OriginClient;
use crate::services::cache::{CachePolicy, TaggedCache};
use crate::services::freshness::FreshnessState;
use crate::services::invalidation::{GenerationStore, InvalidationBus};
use crate::services::refresh::RefreshService;

/// Shared service objects, constructed once at startup and injected into
/// every handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub origin: Arc<OriginClient>,
    pub cache: TaggedCache,
    pub refresh: Arc<RefreshService>,
    pub cache_policy: CachePolicy,
}

impl AppState {
    pub fn new(config: Config, origin: OriginClient) -> Self {
        let bus = InvalidationBus::with_tags(config.invalidation_table.tags());
        Self::with_generation_store(config, origin, Arc::new(bus))
    }

    /// Build the state around an explicit generation store.
    pub fn with_generation_store(
        config: Config,
        origin: OriginClient,
        generations: Arc<dyn GenerationStore>,
    ) -> Self {
        let cache = TaggedCache::new(Arc::clone(&generations), config.cache_max_bytes);
        let refresh = RefreshService::new(
            config.invalidation_table.clone(),
            Arc::new(FreshnessState::new()),
            generations,
            cache.clone(),
        );
        let cache_policy = CachePolicy::new(
            Duration::from_secs(config.cache_fresh_ttl_seconds),
            Duration::from_secs(config.cache_stale_ttl_seconds),
            config.origin_timeout(),
        );

        Self {
            config: Arc::new(config),
            origin: Arc::new(origin),
            cache,
            refresh: Arc::new(refresh),
            cache_policy,
        }
    }
}
