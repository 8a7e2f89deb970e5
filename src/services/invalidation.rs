//! Tag generations and the declared invalidation table.
//!
//! Every cache entry remembers the generation of each of its tags at the
//! moment its fetch started. Bumping a tag makes every entry carrying it
//! logically stale without touching stored bytes: validity is a plain
//! inequality check between the captured and the current generation.
//!
//! The in-memory [`InvalidationBus`] is process-local. Deployments with more
//! than one BFF instance need a [`GenerationStore`] backed by a shared store.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

/// Failure to advance a tag generation.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Generation store unavailable: {0}")]
    Unavailable(String),
}

/// Source of truth for per-tag generation counters.
pub trait GenerationStore: Send + Sync {
    /// Advance `tag` by exactly one, creating it at generation 1 if absent.
    ///
    /// # Errors
    ///
    /// Returns `BusError` if the store cannot record the bump.
    fn bump(&self, tag: &str) -> Result<u64, BusError>;

    /// Current generation of `tag`, `0` if it was never bumped.
    fn generation_of(&self, tag: &str) -> u64;

    /// Generations of `tags`, in the given order.
    fn snapshot(&self, tags: &[String]) -> Vec<u64> {
        tags.iter().map(|tag| self.generation_of(tag)).collect()
    }
}

/// In-memory generation counters.
///
/// Lookups take a shared read lock plus one atomic load; the write lock is
/// only held to register a tag seen for the first time.
#[derive(Debug, Default)]
pub struct InvalidationBus {
    generations: RwLock<HashMap<String, Arc<AtomicU64>>>,
}

impl InvalidationBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a bus with `tags` pre-registered at generation 0.
    pub fn with_tags<'a>(tags: impl IntoIterator<Item = &'a str>) -> Self {
        let generations = tags
            .into_iter()
            .map(|tag| (tag.to_string(), Arc::new(AtomicU64::new(0))))
            .collect();
        Self {
            generations: RwLock::new(generations),
        }
    }

    fn counter(&self, tag: &str) -> Result<Arc<AtomicU64>, BusError> {
        {
            let generations = self
                .generations
                .read()
                .map_err(|_| BusError::Unavailable("generation table poisoned".to_string()))?;
            if let Some(counter) = generations.get(tag) {
                return Ok(Arc::clone(counter));
            }
        }

        let mut generations = self
            .generations
            .write()
            .map_err(|_| BusError::Unavailable("generation table poisoned".to_string()))?;
        Ok(Arc::clone(
            generations
                .entry(tag.to_string())
                .or_insert_with(|| Arc::new(AtomicU64::new(0))),
        ))
    }
}

impl GenerationStore for InvalidationBus {
    fn bump(&self, tag: &str) -> Result<u64, BusError> {
        let counter = self.counter(tag)?;
        Ok(counter.fetch_add(1, Ordering::AcqRel) + 1)
    }

    fn generation_of(&self, tag: &str) -> u64 {
        self.generations
            .read()
            .ok()
            .and_then(|generations| generations.get(tag).map(|c| c.load(Ordering::Acquire)))
            .unwrap_or(0)
    }
}

/// Declared `{tag: invalidation-domain}` table.
///
/// The refresh trigger bumps every tag in the table, or only the tags of the
/// domains it names. Adding a freshness domain is a configuration change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidationTable {
    entries: Vec<(String, String)>,
}

/// Domains the upstream pipeline run can affect.
const PIPELINE_TAGS: [(&str, &str); 5] = [
    ("grades", "grading"),
    ("grade", "grading"),
    ("asset", "grading"),
    ("pipeline", "pipeline"),
    ("health", "pipeline"),
];

impl Default for InvalidationTable {
    fn default() -> Self {
        Self {
            entries: PIPELINE_TAGS
                .iter()
                .map(|(tag, domain)| ((*tag).to_string(), (*domain).to_string()))
                .collect(),
        }
    }
}

impl InvalidationTable {
    /// Parse `tag=domain` pairs separated by commas.
    ///
    /// A bare `tag` is its own domain. Whitespace around items is ignored and
    /// duplicate tags keep their first domain.
    ///
    /// # Errors
    ///
    /// Returns a description of the first malformed item.
    pub fn parse(raw: &str) -> Result<Self, String> {
        let mut entries: Vec<(String, String)> = Vec::new();
        for item in raw.split(',').map(str::trim).filter(|item| !item.is_empty()) {
            let (tag, domain) = match item.split_once('=') {
                Some((tag, domain)) => (tag.trim(), domain.trim()),
                None => (item, item),
            };
            if tag.is_empty() || domain.is_empty() {
                return Err(format!("malformed entry '{item}'"));
            }
            if !entries.iter().any(|(known, _)| known == tag) {
                entries.push((tag.to_string(), domain.to_string()));
            }
        }
        if entries.is_empty() {
            return Err("table declares no tags".to_string());
        }
        Ok(Self { entries })
    }

    pub fn tags(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(tag, _)| tag.as_str())
    }

    pub fn domains(&self) -> BTreeSet<&str> {
        self.entries.iter().map(|(_, domain)| domain.as_str()).collect()
    }

    /// Tags belonging to any of `domains`, or every tag when `domains` is `None`.
    ///
    /// # Errors
    ///
    /// Returns the first requested domain that the table does not declare.
    pub fn select(&self, domains: Option<&[String]>) -> Result<Vec<String>, String> {
        let Some(domains) = domains else {
            return Ok(self.tags().map(ToString::to_string).collect());
        };

        let known = self.domains();
        if let Some(unknown) = domains.iter().find(|d| !known.contains(d.as_str())) {
            return Err(unknown.clone());
        }

        Ok(self
            .entries
            .iter()
            .filter(|(_, domain)| domains.iter().any(|d| d == domain))
            .map(|(tag, _)| tag.clone())
            .collect())
    }
}
