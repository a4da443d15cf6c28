//! Count cache with per-entry expiry, backed by `moka`.

use std::fmt;
use std::time::Duration;

use moka::future::Cache;

/// Upper bound on cached `(doc, keyword)` pairs
pub const DEFAULT_MAX_ENTRIES: u64 = 100_000;

/// Cache key for word counts. The keyword is lowercased so that case
/// variants of one query share an entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    doc: String,
    keyword: String,
}

impl CacheKey {
    pub fn new(doc: &str, keyword: &str) -> Self {
        Self {
            doc: doc.to_string(),
            keyword: keyword.to_lowercase(),
        }
    }

    pub fn doc(&self) -> &str {
        &self.doc
    }

    pub fn keyword(&self) -> &str {
        &self.keyword
    }
}

/// Word counts keyed by [`CacheKey`].
///
/// Entries live for `ttl` after insertion. Expired entries miss immediately
/// and are evicted by moka's housekeeping, so keys that are never looked up
/// again do not accumulate.
#[derive(Clone)]
pub struct CountCache {
    cache: Cache<CacheKey, u64>,
    ttl: Duration,
}

impl CountCache {
    pub fn new(ttl: Duration, max_entries: u64) -> Self {
        let cache = Cache::builder()
            .max_capacity(max_entries)
            .time_to_live(ttl)
            .build();

        Self { cache, ttl }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub async fn get(&self, key: &CacheKey) -> Option<u64> {
        self.cache.get(key).await
    }

    pub async fn insert(&self, key: CacheKey, count: u64) {
        self.cache.insert(key, count).await;
    }

    /// Approximate number of live entries. Call [`CountCache::sync`] first
    /// for an exact figure.
    pub fn entry_count(&self) -> u64 {
        self.cache.entry_count()
    }

    /// Run pending evictions and expirations.
    pub async fn sync(&self) {
        self.cache.run_pending_tasks().await;
    }
}

impl fmt::Debug for CountCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CountCache")
            .field("ttl", &self.ttl)
            .field("entries", &self.cache.entry_count())
            .finish()
    }
}
