//! Cache entries and per-kind cache collections.
//!
//! A [`CacheCollection`] maps [`CompositeKey`]s to [`CacheEntry`]s on top of
//! [`moka`]'s concurrent cache. Collections are built without a capacity
//! bound or time-to-live: entries are never evicted by size, and an old
//! entry is refreshed by the cache manager on its next read rather than
//! dropped from memory.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use moka::future::Cache;
use serde_json::Value;
use tokio::time::Instant;
use tracing::debug;

use crate::key::{CompositeKey, EntityKind};

// ── cache stats ──────────────────────────────────────────────────────

/// Counters tracking cache effectiveness.
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    refreshes: AtomicU64,
}

impl CacheStats {
    fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    fn record_refresh(&self) {
        self.refreshes.fetch_add(1, Ordering::Relaxed);
    }

    /// Lookups answered by a fresh entry.
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Lookups that found no entry.
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Lookups that found an entry past its staleness window.
    pub fn refreshes(&self) -> u64 {
        self.refreshes.load(Ordering::Relaxed)
    }

    /// Total lookups.
    pub fn total(&self) -> u64 {
        self.hits() + self.misses() + self.refreshes()
    }

    /// Hit rate between 0.0 and 1.0 (0.0 if no lookups).
    pub fn hit_rate(&self) -> f64 {
        let total = self.total();
        if total == 0 {
            return 0.0;
        }
        self.hits() as f64 / total as f64
    }

    /// Reset all counters to zero.
    pub fn reset(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.refreshes.store(0, Ordering::Relaxed);
    }
}

impl fmt::Display for CacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "hits={} misses={} refreshes={} rate={:.2}%",
            self.hits(),
            self.misses(),
            self.refreshes(),
            self.hit_rate() * 100.0,
        )
    }
}

// ── cache entry ──────────────────────────────────────────────────────

/// One mirrored document and when it was fetched.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    /// Key the document was fetched under.
    pub key: CompositeKey,
    /// Last known value; may lag the remote store.
    pub data: Value,
    pub fetched_at: Instant,
}

impl CacheEntry {
    pub fn new(key: CompositeKey, data: Value) -> Self {
        Self {
            key,
            data,
            fetched_at: Instant::now(),
        }
    }

    pub fn age(&self) -> Duration {
        self.fetched_at.elapsed()
    }

    /// True once more than `max_age` has passed since the fetch.
    pub fn is_stale(&self, max_age: Duration) -> bool {
        self.age() > max_age
    }
}

/// Result of [`CacheCollection::lookup`].
#[derive(Debug, Clone)]
pub enum Lookup {
    Fresh(Arc<CacheEntry>),
    Stale(Arc<CacheEntry>),
    Missing,
}

// ── cache collection ─────────────────────────────────────────────────

/// Composite key → entry map for one [`EntityKind`].
///
/// Cheap to clone; clones share the same entries and stats.
#[derive(Clone)]
pub struct CacheCollection {
    kind: EntityKind,
    inner: Cache<CompositeKey, Arc<CacheEntry>>,
    stats: Arc<CacheStats>,
}

impl CacheCollection {
    pub fn new(kind: EntityKind) -> Self {
        let inner = Cache::builder().name(kind.as_str()).build();
        debug!(kind = %kind, "cache collection created");
        Self {
            kind,
            inner,
            stats: Arc::new(CacheStats::default()),
        }
    }

    pub fn kind(&self) -> EntityKind {
        self.kind
    }

    /// The entry for `key`, fresh or not.
    pub async fn get(&self, key: &CompositeKey) -> Option<Arc<CacheEntry>> {
        self.inner.get(key).await
    }

    /// Classify the entry for `key` against `max_age` and count the outcome.
    pub async fn lookup(&self, key: &CompositeKey, max_age: Duration) -> Lookup {
        match self.inner.get(key).await {
            Some(entry) if entry.is_stale(max_age) => {
                self.stats.record_refresh();
                debug!(cache = %self.kind, key = %key, "cache stale");
                Lookup::Stale(entry)
            }
            Some(entry) => {
                self.stats.record_hit();
                debug!(cache = %self.kind, key = %key, "cache hit");
                Lookup::Fresh(entry)
            }
            None => {
                self.stats.record_miss();
                debug!(cache = %self.kind, key = %key, "cache miss");
                Lookup::Missing
            }
        }
    }

    /// Create or overwrite the entry for `key`, resetting its fetch time.
    pub async fn set(&self, key: CompositeKey, data: Value) -> Arc<CacheEntry> {
        let entry = Arc::new(CacheEntry::new(key.clone(), data));
        debug!(cache = %self.kind, key = %key, "cache set");
        self.inner.insert(key, Arc::clone(&entry)).await;
        entry
    }

    /// Drop the entry for `key`, reporting whether one existed.
    pub async fn delete(&self, key: &CompositeKey) -> bool {
        let removed = self.inner.remove(key).await.is_some();
        debug!(cache = %self.kind, key = %key, removed, "cache delete");
        removed
    }

    /// Snapshot of the keys currently held.
    pub fn keys(&self) -> Vec<CompositeKey> {
        self.inner.iter().map(|(key, _)| (*key).clone()).collect()
    }

    /// Number of entries currently held.
    pub fn len(&self) -> usize {
        self.inner.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every entry.
    pub async fn clear(&self) {
        for key in self.keys() {
            self.inner.invalidate(&key).await;
        }
        debug!(cache = %self.kind, "cache cleared");
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }
}

impl fmt::Debug for CacheCollection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheCollection")
            .field("kind", &self.kind)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

// ── tests ────────────────────────────────────────────────────────────
