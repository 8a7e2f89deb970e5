//! Tag-scoped response caching with stale-while-revalidate.
//!
//! Every entry is stored under its request identity together with the
//! freshness domains (tags) it belongs to and the generation of each tag at
//! the moment its fetch started.
//!
//! # Lookup
//!
//! | Entry state | Result |
//! |-------------|--------|
//! | `age < fresh_ttl`, no tag bumped | `HIT`, no origin call |
//! | `age < stale_ttl`, expired or a tag bumped | `STALE` payload now, one background re-fetch |
//! | absent, purged, or `age >= stale_ttl` | `MISS`, synchronous fetch |
//!
//! `stale_ttl` is measured from `stored_at`, so no payload is ever served
//! more than `stale_ttl` after it was fetched. A failed fetch never touches
//! the stored entry: still-servable stale data survives for later callers.
//!
//! # Usage
//!
//! ```text
//! let read = state
//!     .cache
//!     .get_or_fetch(&key, &["grading", "grades"], policy, move || async move {
//!         origin.get_json(&segments, &query).await
//!     })
//!     .await?;
//! ```

use axum::body::Bytes;
use moka::future::Cache;
use moka::Expiry;
use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

use crate::error::{AppError, AppResult};
use crate::services::invalidation::GenerationStore;

/// TTLs and fetch bound applied to one cached read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachePolicy {
    pub fresh_ttl: Duration,
    pub stale_ttl: Duration,
    pub fetch_timeout: Duration,
}

impl CachePolicy {
    /// `stale_ttl` shorter than `fresh_ttl` is raised to `fresh_ttl`.
    #[must_use]
    pub fn new(fresh_ttl: Duration, stale_ttl: Duration, fetch_timeout: Duration) -> Self {
        Self {
            fresh_ttl,
            stale_ttl: stale_ttl.max(fresh_ttl),
            fetch_timeout,
        }
    }
}

/// One stored origin response. Replaced on re-fetch, never mutated.
#[derive(Debug)]
pub struct CacheEntry {
    pub payload: Bytes,
    pub tags: Vec<String>,
    /// Generation of `tags[i]` captured before the fetch ran.
    generations: Vec<u64>,
    pub stored_at: Instant,
    pub fresh_ttl: Duration,
    pub stale_ttl: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Usability {
    Fresh,
    Stale,
    Unusable,
}

impl CacheEntry {
    /// True once any tag advanced past the generation captured for this entry.
    pub fn is_invalidated(&self, store: &dyn GenerationStore) -> bool {
        self.tags
            .iter()
            .zip(&self.generations)
            .any(|(tag, captured)| store.generation_of(tag) > *captured)
    }

    fn usability(&self, now: Instant, store: &dyn GenerationStore) -> Usability {
        let age = now.saturating_duration_since(self.stored_at);
        if age >= self.stale_ttl {
            Usability::Unusable
        } else if age < self.fresh_ttl && !self.is_invalidated(store) {
            Usability::Fresh
        } else {
            Usability::Stale
        }
    }
}

/// How a read was answered, surfaced as the `X-Cache` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    Hit,
    Stale,
    Miss,
}

impl CacheStatus {
    #[must_use]
    pub fn as_header(self) -> &'static str {
        match self {
            Self::Hit => "HIT",
            Self::Stale => "STALE",
            Self::Miss => "MISS",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheRead {
    /// Shares the stored buffer; cloning only bumps a reference count.
    pub payload: Bytes,
    pub status: CacheStatus,
}

/// Evicts each entry once its own stale window has passed.
struct StaleHorizon;

impl Expiry<String, Arc<CacheEntry>> for StaleHorizon {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &Arc<CacheEntry>,
        _created_at: std::time::Instant,
    ) -> Option<Duration> {
        Some(value.stale_ttl)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &Arc<CacheEntry>,
        _updated_at: std::time::Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.stale_ttl)
    }
}

/// Marks a key as being revalidated; the mark is cleared on drop, including
/// when the revalidation task panics or is cancelled.
struct InFlight {
    keys: Arc<Mutex<HashSet<String>>>,
    key: String,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.keys
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.key);
    }
}

#[derive(Clone)]
pub struct TaggedCache {
    entries: Cache<String, Arc<CacheEntry>>,
    generations: Arc<dyn GenerationStore>,
    revalidating: Arc<Mutex<HashSet<String>>>,
}

impl TaggedCache {
    /// Build a cache weighted by payload size, holding at most `max_bytes`.
    pub fn new(generations: Arc<dyn GenerationStore>, max_bytes: u64) -> Self {
        let entries = Cache::builder()
            .weigher(|_key: &String, entry: &Arc<CacheEntry>| -> u32 {
                entry.payload.len().try_into().unwrap_or(u32::MAX)
            })
            .max_capacity(max_bytes)
            .expire_after(StaleHorizon)
            .support_invalidation_closures()
            .build();

        Self {
            entries,
            generations,
            revalidating: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Serve `key` from cache or fetch it from the origin.
    ///
    /// `fetcher` runs at most once: synchronously on a miss, detached on a
    /// stale hit (deduplicated per key), never on a fresh hit.
    ///
    /// # Errors
    ///
    /// On a miss, returns the fetcher's error, or `AppError::OriginTimeout`
    /// when it exceeds `policy.fetch_timeout`.
    pub async fn get_or_fetch<F, Fut>(
        &self,
        key: &str,
        tags: &[&str],
        policy: CachePolicy,
        fetcher: F,
    ) -> AppResult<CacheRead>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = AppResult<Bytes>> + Send + 'static,
    {
        if let Some(entry) = self.entries.get(key).await {
            match entry.usability(Instant::now(), self.generations.as_ref()) {
                Usability::Fresh => {
                    tracing::debug!(cache_key = %key, "cache_hit");
                    return Ok(CacheRead {
                        payload: entry.payload.clone(),
                        status: CacheStatus::Hit,
                    });
                }
                Usability::Stale => {
                    tracing::debug!(
                        cache_key = %key,
                        invalidated = entry.is_invalidated(self.generations.as_ref()),
                        "cache_stale"
                    );
                    self.spawn_revalidation(key, tags, policy, fetcher);
                    return Ok(CacheRead {
                        payload: entry.payload.clone(),
                        status: CacheStatus::Stale,
                    });
                }
                Usability::Unusable => {}
            }
        }

        tracing::debug!(cache_key = %key, "cache_miss");
        let payload = self
            .fetch_and_store(key.to_string(), owned_tags(tags), policy, fetcher)
            .await?;
        Ok(CacheRead {
            payload,
            status: CacheStatus::Miss,
        })
    }

    /// Fetch synchronously and replace whatever is stored under `key`.
    ///
    /// # Errors
    ///
    /// Same as the miss path of [`TaggedCache::get_or_fetch`].
    pub async fn refetch<F, Fut>(
        &self,
        key: &str,
        tags: &[&str],
        policy: CachePolicy,
        fetcher: F,
    ) -> AppResult<CacheRead>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = AppResult<Bytes>> + Send + 'static,
    {
        tracing::debug!(cache_key = %key, "cache_bypass");
        let payload = self
            .fetch_and_store(key.to_string(), owned_tags(tags), policy, fetcher)
            .await?;
        Ok(CacheRead {
            payload,
            status: CacheStatus::Miss,
        })
    }

    /// Evict every entry carrying `tag`; the next read for it is a miss.
    pub fn purge_tag(&self, tag: &str) {
        let tag_owned = tag.to_string();
        match self
            .entries
            .invalidate_entries_if(move |_key, entry| entry.tags.iter().any(|t| *t == tag_owned))
        {
            Ok(_) => tracing::debug!(tag = %tag, "cache_tag_purged"),
            Err(e) => tracing::warn!(tag = %tag, error = %e, "Failed to purge cache tag"),
        }
    }

    pub async fn entry(&self, key: &str) -> Option<Arc<CacheEntry>> {
        self.entries.get(key).await
    }

    /// Number of background re-fetches currently running.
    pub fn revalidations_in_flight(&self) -> usize {
        self.revalidating
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn claim_revalidation(&self, key: &str) -> Option<InFlight> {
        let mut keys = self
            .revalidating
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if !keys.insert(key.to_string()) {
            return None;
        }
        Some(InFlight {
            keys: Arc::clone(&self.revalidating),
            key: key.to_string(),
        })
    }

    fn spawn_revalidation<F, Fut>(&self, key: &str, tags: &[&str], policy: CachePolicy, fetcher: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = AppResult<Bytes>> + Send + 'static,
    {
        let Some(in_flight) = self.claim_revalidation(key) else {
            tracing::debug!(cache_key = %key, "revalidation_in_flight");
            return;
        };

        tracing::debug!(cache_key = %key, "revalidation_started");
        let cache = self.clone();
        let key = key.to_string();
        let tags = owned_tags(tags);
        tokio::spawn(async move {
            let _in_flight = in_flight;
            if let Err(e) = cache.fetch_and_store(key.clone(), tags, policy, fetcher).await {
                tracing::warn!(cache_key = %key, error = %e, "revalidation_failed");
            }
        });
    }

    async fn fetch_and_store<F, Fut>(
        &self,
        key: String,
        tags: Vec<String>,
        policy: CachePolicy,
        fetcher: F,
    ) -> AppResult<Bytes>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = AppResult<Bytes>>,
    {
        // Captured before fetching: a bump landing mid-fetch leaves the new entry stale.
        let generations = self.generations.snapshot(&tags);

        let payload = tokio::time::timeout(policy.fetch_timeout, fetcher())
            .await
            .map_err(|_| AppError::OriginTimeout(policy.fetch_timeout))??;

        let size = payload.len();
        let entry = CacheEntry {
            payload: payload.clone(),
            tags,
            generations,
            stored_at: Instant::now(),
            fresh_ttl: policy.fresh_ttl,
            stale_ttl: policy.stale_ttl,
        };
        self.entries.insert(key.clone(), Arc::new(entry)).await;

        tracing::debug!(cache_key = %key, size_bytes = size, "cache_stored");
        Ok(payload)
    }
}

fn owned_tags(tags: &[&str]) -> Vec<String> {
    tags.iter().map(ToString::to_string).collect()
}

/// Build a cache key from a prefix and components.
///
/// Components are joined with `:` separator. Empty components are included
/// to ensure different queries produce different keys.
pub fn cache_key(prefix: &str, components: &[&str]) -> String {
    let mut key = prefix.to_string();
    for c in components {
        key.push(':');
        key.push_str(c);
    }
    key
}

/// Stable rendering of query pairs, sorted by name then value, so parameter
/// order does not split the cache.
pub fn canonical_query(pairs: &[(String, String)]) -> String {
    let mut sorted: Vec<&(String, String)> = pairs.iter().collect();
    sorted.sort();
    sorted
        .iter()
        .map(|(name, value)| format!("{}={}", escape(name), escape(value)))
        .collect::<Vec<_>>()
        .join("&")
}

fn escape(component: &str) -> String {
    component
        .replace('%', "%25")
        .replace('&', "%26")
        .replace('=', "%3D")
        .replace(':', "%3A")
}
