//! Refresh trigger: fan a "new data is ready" signal out to the cache.

use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, PoisonError};

use crate::services::cache::TaggedCache;
use crate::services::freshness::FreshnessState;
use crate::services::invalidation::{GenerationStore, InvalidationTable};

/// Tags to bump for one trigger.
#[derive(Debug, Clone, Default)]
pub struct RefreshScope {
    /// Restrict the bump to these domains; `None` means the whole table.
    pub domains: Option<Vec<String>>,
    /// Also evict entries carrying a bumped tag.
    pub purge: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshOutcome {
    pub last_refresh_at: DateTime<Utc>,
    pub invalidated: Vec<String>,
    /// Tags whose bump failed; retried on the next trigger.
    pub deferred: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum RefreshError {
    #[error("Unknown invalidation domain: {0}")]
    UnknownDomain(String),
}

/// Single writer of the freshness state and the tag generations.
pub struct RefreshService {
    table: InvalidationTable,
    freshness: Arc<FreshnessState>,
    generations: Arc<dyn GenerationStore>,
    cache: TaggedCache,
    pending: Mutex<BTreeSet<String>>,
}

impl RefreshService {
    pub fn new(
        table: InvalidationTable,
        freshness: Arc<FreshnessState>,
        generations: Arc<dyn GenerationStore>,
        cache: TaggedCache,
    ) -> Self {
        Self {
            table,
            freshness,
            generations,
            cache,
            pending: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn last_refresh_at(&self) -> Option<DateTime<Utc>> {
        self.freshness.last_refresh_at()
    }

    /// Bump every tag in `scope`, then publish a new `lastRefreshAt`.
    ///
    /// Tags are bumped before the timestamp moves, so a viewer that sees the
    /// new timestamp can no longer be answered with a pre-refresh entry as
    /// fresh (`HIT`). Without `purge`, such an entry is still served once
    /// more as `STALE` while its background re-fetch runs, so a reload right
    /// after the notification may show pre-refresh data. With `purge` the
    /// entry is evicted and the next read waits for the origin.
    ///
    /// Individual bump failures are logged and deferred, never fatal.
    ///
    /// # Errors
    ///
    /// Returns `RefreshError::UnknownDomain` before touching any state if the
    /// scope names a domain the table does not declare.
    pub fn trigger(&self, scope: &RefreshScope) -> Result<RefreshOutcome, RefreshError> {
        let now = Utc::now();
        let selected = self
            .table
            .select(scope.domains.as_deref())
            .map_err(RefreshError::UnknownDomain)?;

        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        let mut tags: BTreeSet<String> = std::mem::take(&mut *pending);
        if !tags.is_empty() {
            tracing::info!(count = tags.len(), "Retrying deferred tag bumps");
        }
        tags.extend(selected);

        let mut invalidated = Vec::with_capacity(tags.len());
        let mut deferred = Vec::new();
        for tag in tags {
            match self.generations.bump(&tag) {
                Ok(generation) => {
                    tracing::debug!(tag = %tag, generation, "Tag bumped");
                    if scope.purge {
                        self.cache.purge_tag(&tag);
                    }
                    invalidated.push(tag);
                }
                Err(e) => {
                    tracing::warn!(tag = %tag, error = %e, "Tag bump failed, deferring to next trigger");
                    pending.insert(tag.clone());
                    deferred.push(tag);
                }
            }
        }
        drop(pending);

        let last_refresh_at = self.freshness.advance(now);
        tracing::info!(
            last_refresh_at = %last_refresh_at,
            invalidated = invalidated.len(),
            deferred = deferred.len(),
            purge = scope.purge,
            "Data refresh triggered"
        );

        Ok(RefreshOutcome {
            last_refresh_at,
            invalidated,
            deferred,
        })
    }
}
