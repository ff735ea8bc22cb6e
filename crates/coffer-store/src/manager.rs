//! Write-through cache over a remote document database.
//!
//! [`CacheManager`] keeps one [`CacheCollection`] per [`EntityKind`] in
//! front of a [`RemoteStore`]:
//!
//! - **Reads** are served from a fresh cache entry. A missing or stale
//!   entry costs exactly one remote fetch, after which the entry is
//!   replaced. A failed fetch is returned to the caller; stale data is
//!   never served as a fallback.
//! - **Writes** go to the remote store first. Only after it acknowledges
//!   is the cache entry overwritten, with the document the remote returned.
//!   A later read in this process therefore sees its own write even inside
//!   the staleness window.
//! - Operations on the same composite key are serialized by a per-key
//!   async mutex. Different keys proceed concurrently.
//! - Every remote call has a deadline and can be cancelled, either through
//!   a caller-supplied [`CancellationToken`] or by [`CacheManager::shutdown`].
//!
//! Mirroring is best-effort across processes: a writer elsewhere can change
//! a document without this cache noticing until the entry goes stale or is
//! [invalidated](CacheManager::invalidate).

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::cache::{CacheCollection, CacheStats, Lookup};
use crate::config::CacheConfig;
use crate::document::{self, Mutation};
use crate::error::{ErrorCode, StoreError, StoreResult};
use crate::events::{EventBus, StoreEvent};
use crate::key::{CompositeKey, EntityKind};
use crate::path::DotPath;
use crate::remote::RemoteStore;

/// Per-call options.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Free-text reason attached to the emitted event (writes only).
    pub reason: Option<String>,
    /// Aborts the call when cancelled.
    pub cancel: Option<CancellationToken>,
}

impl CallOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

/// Cache manager handle. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct CacheManager {
    inner: Arc<Inner>,
}

struct Inner {
    remote: Arc<dyn RemoteStore>,
    collections: HashMap<EntityKind, CacheCollection>,
    locks: DashMap<(EntityKind, CompositeKey), Arc<Mutex<()>>>,
    max_age: Duration,
    remote_timeout: Duration,
    shutdown: CancellationToken,
    events: Option<EventBus>,
}

impl CacheManager {
    /// Manager with default settings and no event bus.
    pub fn new(remote: Arc<dyn RemoteStore>) -> Self {
        Self::builder(remote).build()
    }

    pub fn builder(remote: Arc<dyn RemoteStore>) -> CacheManagerBuilder {
        CacheManagerBuilder {
            remote,
            config: CacheConfig::default(),
            events: None,
        }
    }

    /// The collection mirroring documents of `kind`.
    pub fn collection(&self, kind: EntityKind) -> &CacheCollection {
        // Every kind is populated by the builder.
        &self.inner.collections[&kind]
    }

    pub fn stats(&self, kind: EntityKind) -> &CacheStats {
        self.collection(kind).stats()
    }

    // ── whole-document operations ────────────────────────────────────

    /// Read a document, from cache when fresh.
    pub async fn read(&self, kind: EntityKind, key: &CompositeKey) -> StoreResult<Option<Value>> {
        self.read_with(kind, key, &CallOptions::default()).await
    }

    /// [`read`](Self::read) with per-call options.
    #[instrument(skip(self, key, opts), fields(key = %key))]
    pub async fn read_with(
        &self,
        kind: EntityKind,
        key: &CompositeKey,
        opts: &CallOptions,
    ) -> StoreResult<Option<Value>> {
        let collection = self.collection(kind);
        if let Lookup::Fresh(entry) = collection.lookup(key, self.inner.max_age).await {
            return Ok(Some(entry.data.clone()));
        }

        let _guard = self.acquire(kind, key, opts).await?;

        // Another caller may have refreshed the entry while we waited.
        if let Some(entry) = collection.get(key).await {
            if !entry.is_stale(self.inner.max_age) {
                return Ok(Some(entry.data.clone()));
            }
        }

        let fetched = self
            .call("fetch", opts, self.inner.remote.fetch(kind, key))
            .await?;
        match fetched {
            Some(document) => {
                collection.set(key.clone(), document.clone()).await;
                Ok(Some(document))
            }
            None => {
                collection.delete(key).await;
                Ok(None)
            }
        }
    }

    /// Read a document and deserialize it into `T`.
    pub async fn read_as<T: DeserializeOwned>(
        &self,
        kind: EntityKind,
        key: &CompositeKey,
    ) -> StoreResult<Option<T>> {
        match self.read(kind, key).await? {
            Some(document) => Ok(Some(serde_json::from_value(document)?)),
            None => Ok(None),
        }
    }

    /// Apply `mutation` at `path` inside a document (the whole document when
    /// `path` is `None`) and return the slot's new value.
    pub async fn write(
        &self,
        kind: EntityKind,
        key: &CompositeKey,
        path: Option<&str>,
        mutation: Mutation,
    ) -> StoreResult<Value> {
        self.write_with(kind, key, path, mutation, &CallOptions::default())
            .await
    }

    /// [`write`](Self::write) with per-call options.
    #[instrument(skip(self, key, mutation, opts), fields(key = %key, op = %mutation.change_kind()))]
    pub async fn write_with(
        &self,
        kind: EntityKind,
        key: &CompositeKey,
        path: Option<&str>,
        mutation: Mutation,
        opts: &CallOptions,
    ) -> StoreResult<Value> {
        let path = path.map(DotPath::parse).transpose()?;
        mutation.validate(path.as_ref())?;

        let collection = self.collection(kind);
        let _guard = self.acquire(kind, key, opts).await?;

        let applied = self
            .call(
                "apply",
                opts,
                self.inner.remote.apply(kind, key, path.as_ref(), &mutation),
            )
            .await;
        let applied = match applied {
            Ok(applied) => applied,
            Err(err) => {
                if err.code() == ErrorCode::StorageIo {
                    // The write may or may not have landed remotely.
                    collection.delete(key).await;
                }
                return Err(err);
            }
        };

        if applied.document.is_null() {
            collection.delete(key).await;
        } else {
            collection.set(key.clone(), applied.document.clone()).await;
        }
        debug!(kind = %kind, key = %key, "write acknowledged, cache updated");

        if let Some(bus) = &self.inner.events {
            bus.publish(StoreEvent {
                change: mutation.change_kind(),
                guild_id: key.guild_id.clone(),
                member_id: key.member_id.clone(),
                path: path.as_ref().map(DotPath::to_string).unwrap_or_default(),
                amount: mutation.amount(),
                value: applied.value.clone(),
                reason: opts.reason.clone(),
                timestamp: Utc::now(),
            });
        }
        Ok(applied.value)
    }

    /// Delete a document remotely and drop it from the cache.
    pub async fn remove(&self, kind: EntityKind, key: &CompositeKey) -> StoreResult<bool> {
        self.remove_with(kind, key, &CallOptions::default()).await
    }

    /// [`remove`](Self::remove) with per-call options. The cache entry is
    /// dropped whether or not the remote call succeeded.
    #[instrument(skip(self, key, opts), fields(key = %key))]
    pub async fn remove_with(
        &self,
        kind: EntityKind,
        key: &CompositeKey,
        opts: &CallOptions,
    ) -> StoreResult<bool> {
        let _guard = self.acquire(kind, key, opts).await?;
        let result = self
            .call("remove", opts, self.inner.remote.remove(kind, key))
            .await;
        self.collection(kind).delete(key).await;
        result
    }

    // ── dot-path operations ──────────────────────────────────────────

    /// Value at `path` inside a document, or `None`.
    pub async fn fetch(
        &self,
        kind: EntityKind,
        key: &CompositeKey,
        path: &str,
    ) -> StoreResult<Option<Value>> {
        let path = DotPath::parse(path)?;
        let current = self.read(kind, key).await?;
        Ok(current.and_then(|doc| document::read(&doc, Some(&path)).cloned()))
    }

    pub async fn set(
        &self,
        kind: EntityKind,
        key: &CompositeKey,
        path: &str,
        value: Value,
    ) -> StoreResult<Value> {
        self.write(kind, key, Some(path), Mutation::Set { value }).await
    }

    pub async fn add(
        &self,
        kind: EntityKind,
        key: &CompositeKey,
        path: &str,
        amount: f64,
    ) -> StoreResult<Value> {
        self.write(kind, key, Some(path), Mutation::Add { amount }).await
    }

    pub async fn subtract(
        &self,
        kind: EntityKind,
        key: &CompositeKey,
        path: &str,
        amount: f64,
    ) -> StoreResult<Value> {
        self.write(kind, key, Some(path), Mutation::Subtract { amount })
            .await
    }

    pub async fn push(
        &self,
        kind: EntityKind,
        key: &CompositeKey,
        path: &str,
        item: Value,
    ) -> StoreResult<Value> {
        self.write(kind, key, Some(path), Mutation::Push { item }).await
    }

    pub async fn pull(
        &self,
        kind: EntityKind,
        key: &CompositeKey,
        path: &str,
        value: Value,
    ) -> StoreResult<Value> {
        self.write(kind, key, Some(path), Mutation::Pull { value }).await
    }

    pub async fn delete(
        &self,
        kind: EntityKind,
        key: &CompositeKey,
        path: &str,
    ) -> StoreResult<bool> {
        let removed = self.write(kind, key, Some(path), Mutation::Delete).await?;
        Ok(removed.as_bool().unwrap_or(false))
    }

    // ── invalidation & lifecycle ─────────────────────────────────────

    /// Force the next read of `key` to go to the remote store.
    ///
    /// Waits for any in-flight operation on `key` first, so a fetch that
    /// started before the call cannot put its older result back afterwards.
    pub async fn invalidate(&self, kind: EntityKind, key: &CompositeKey) -> bool {
        let _guard = self.key_lock(kind, key).lock_owned().await;
        self.collection(kind).delete(key).await
    }

    /// Drop every cached document of `kind`.
    pub async fn invalidate_kind(&self, kind: EntityKind) {
        self.drain(|k| k == kind).await;
        self.collection(kind).clear().await;
    }

    /// Drop every cached document.
    pub async fn invalidate_all(&self) {
        self.drain(|_| true).await;
        for collection in self.inner.collections.values() {
            collection.clear().await;
        }
    }

    /// Abort in-flight remote calls and refuse new ones.
    pub fn shutdown(&self) {
        info!("cache manager shutting down");
        self.inner.shutdown.cancel();
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    // ── internals ────────────────────────────────────────────────────

    fn key_lock(&self, kind: EntityKind, key: &CompositeKey) -> Arc<Mutex<()>> {
        Arc::clone(
            self.inner
                .locks
                .entry((kind, key.clone()))
                .or_default()
                .value(),
        )
    }

    async fn acquire(
        &self,
        kind: EntityKind,
        key: &CompositeKey,
        opts: &CallOptions,
    ) -> StoreResult<OwnedMutexGuard<()>> {
        let lock = self.key_lock(kind, key);
        self.cancellable("lock", opts, async { Ok(lock.lock_owned().await) })
            .await
    }

    /// Wait until no operation holds a key lock of a matching kind. Locks
    /// are taken one at a time and released at once. Remote calls are
    /// bounded by the deadline, so this always finishes.
    async fn drain(&self, matches: impl Fn(EntityKind) -> bool) {
        let locks: Vec<Arc<Mutex<()>>> = self
            .inner
            .locks
            .iter()
            .filter(|entry| matches(entry.key().0))
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for lock in locks {
            drop(lock.lock().await);
        }
    }

    /// Run a remote call under the configured deadline and the cancellation
    /// tokens.
    async fn call<T, F>(&self, operation: &'static str, opts: &CallOptions, fut: F) -> StoreResult<T>
    where
        F: Future<Output = StoreResult<T>>,
    {
        let after = self.inner.remote_timeout;
        self.cancellable(operation, opts, async move {
            match tokio::time::timeout(after, fut).await {
                Ok(result) => result,
                Err(_) => {
                    warn!(operation, ?after, "remote call timed out");
                    Err(StoreError::Timeout { operation, after })
                }
            }
        })
        .await
    }

    async fn cancellable<T, F>(
        &self,
        operation: &'static str,
        opts: &CallOptions,
        fut: F,
    ) -> StoreResult<T>
    where
        F: Future<Output = StoreResult<T>>,
    {
        let caller = async {
            match &opts.cancel {
                Some(token) => token.cancelled().await,
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            biased;
            _ = self.inner.shutdown.cancelled() => Err(StoreError::Cancelled { operation }),
            _ = caller => Err(StoreError::Cancelled { operation }),
            result = fut => result,
        }
    }
}

impl std::fmt::Debug for CacheManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheManager")
            .field("max_age", &self.inner.max_age)
            .field("remote_timeout", &self.inner.remote_timeout)
            .field("shut_down", &self.is_shut_down())
            .finish_non_exhaustive()
    }
}

// ── builder ──────────────────────────────────────────────────────────

/// Builder for [`CacheManager`].
pub struct CacheManagerBuilder {
    remote: Arc<dyn RemoteStore>,
    config: CacheConfig,
    events: Option<EventBus>,
}

impl CacheManagerBuilder {
    pub fn config(mut self, config: CacheConfig) -> Self {
        self.config = config;
        self
    }

    /// Publish a [`StoreEvent`] on `bus` after every acknowledged write.
    pub fn events(mut self, bus: EventBus) -> Self {
        self.events = Some(bus);
        self
    }

    pub fn build(self) -> CacheManager {
        let collections = EntityKind::ALL
            .into_iter()
            .map(|kind| (kind, CacheCollection::new(kind)))
            .collect();

        debug!(
            max_age_ms = self.config.max_age_ms,
            remote_timeout_ms = self.config.remote_timeout_ms,
            "cache manager created"
        );

        CacheManager {
            inner: Arc::new(Inner {
                remote: self.remote,
                collections,
                locks: DashMap::new(),
                max_age: self.config.max_age(),
                remote_timeout: self.config.remote_timeout(),
                shutdown: CancellationToken::new(),
                events: self.events,
            }),
        }
    }
}

// ── tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::{Applied, MemoryRemote};
    use async_trait::async_trait;
    use serde::Deserialize;
    use serde_json::json;

    /// Reads the document when the request arrives and answers after
    /// `delay`, like a remote whose response is still on the wire.
    struct SnapshotRemote {
        inner: Arc<MemoryRemote>,
        delay: Duration,
    }

    #[async_trait]
    impl RemoteStore for SnapshotRemote {
        async fn fetch(&self, kind: EntityKind, key: &CompositeKey) -> StoreResult<Option<Value>> {
            let snapshot = self.inner.peek(kind, key);
            tokio::time::sleep(self.delay).await;
            Ok(snapshot)
        }

        async fn apply(
            &self,
            kind: EntityKind,
            key: &CompositeKey,
            path: Option<&DotPath>,
            mutation: &Mutation,
        ) -> StoreResult<Applied> {
            self.inner.apply(kind, key, path, mutation).await
        }

        async fn remove(&self, kind: EntityKind, key: &CompositeKey) -> StoreResult<bool> {
            self.inner.remove(kind, key).await
        }
    }

    fn snapshot_setup() -> (Arc<MemoryRemote>, CacheManager) {
        let remote = Arc::new(MemoryRemote::new());
        let slow = Arc::new(SnapshotRemote {
            inner: remote.clone(),
            delay: Duration::from_millis(100),
        });
        let manager = CacheManager::builder(slow)
            .config(
                CacheConfig::new()
                    .with_max_age(MAX_AGE)
                    .with_remote_timeout(Duration::from_millis(500)),
            )
            .build();
        (remote, manager)
    }

    const MAX_AGE: Duration = Duration::from_secs(60);

    fn setup() -> (Arc<MemoryRemote>, CacheManager) {
        let remote = Arc::new(MemoryRemote::new());
        let manager = CacheManager::builder(remote.clone())
            .config(
                CacheConfig::new()
                    .with_max_age(MAX_AGE)
                    .with_remote_timeout(Duration::from_millis(500)),
            )
            .build();
        (remote, manager)
    }

    fn alice() -> CompositeKey {
        CompositeKey::member("g1", "alice")
    }

    #[tokio::test(start_paused = true)]
    async fn read_miss_fetches_once_then_hits() {
        let (remote, manager) = setup();
        remote.put(EntityKind::Balances, alice(), json!({"money": 100}));

        let first = manager.read(EntityKind::Balances, &alice()).await.unwrap();
        let second = manager.read(EntityKind::Balances, &alice()).await.unwrap();

        assert_eq!(first, Some(json!({"money": 100})));
        assert_eq!(first, second);
        assert_eq!(remote.fetch_count(), 1);
        assert_eq!(manager.stats(EntityKind::Balances).hits(), 1);
        assert_eq!(manager.stats(EntityKind::Balances).misses(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_document_is_none_and_not_cached() {
        let (remote, manager) = setup();
        assert!(manager.read(EntityKind::Bank, &alice()).await.unwrap().is_none());
        assert!(manager.read(EntityKind::Bank, &alice()).await.unwrap().is_none());
        assert_eq!(remote.fetch_count(), 2);
        assert!(manager.collection(EntityKind::Bank).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn write_caches_the_acknowledged_document() {
        let (remote, manager) = setup();
        remote.put(EntityKind::Balances, alice(), json!({"money": 100}));
        manager.read(EntityKind::Balances, &alice()).await.unwrap();

        // Another process changes the balance; our cache still says 100.
        remote.put(EntityKind::Balances, alice(), json!({"money": 500}));

        let money = manager
            .add(EntityKind::Balances, &alice(), "money", 50.0)
            .await
            .unwrap();
        assert_eq!(money, json!(550));

        let cached = manager.read(EntityKind::Balances, &alice()).await.unwrap();
        assert_eq!(cached, Some(json!({"money": 550})));
        assert_eq!(remote.fetch_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_entry_refetches_exactly_once() {
        let (remote, manager) = setup();
        remote.put(EntityKind::Users, alice(), json!({"name": "Alice"}));
        manager.read(EntityKind::Users, &alice()).await.unwrap();
        let before = manager
            .collection(EntityKind::Users)
            .get(&alice())
            .await
            .unwrap()
            .fetched_at;

        tokio::time::advance(MAX_AGE + Duration::from_secs(1)).await;
        remote.put(EntityKind::Users, alice(), json!({"name": "Alicia"}));

        let refreshed = manager.read(EntityKind::Users, &alice()).await.unwrap();
        manager.read(EntityKind::Users, &alice()).await.unwrap();

        assert_eq!(refreshed, Some(json!({"name": "Alicia"})));
        assert_eq!(remote.fetch_count(), 2);
        let after = manager
            .collection(EntityKind::Users)
            .get(&alice())
            .await
            .unwrap()
            .fetched_at;
        assert!(after > before);
        assert_eq!(manager.stats(EntityKind::Users).refreshes(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_refresh_is_an_error_not_stale_data() {
        let (remote, manager) = setup();
        remote.put(EntityKind::Guilds, CompositeKey::guild("g1"), json!({}));
        manager
            .read(EntityKind::Guilds, &CompositeKey::guild("g1"))
            .await
            .unwrap();

        tokio::time::advance(MAX_AGE * 2).await;
        remote.set_offline(true);

        let err = manager
            .read(EntityKind::Guilds, &CompositeKey::guild("g1"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::StorageIo);
    }

    #[tokio::test(start_paused = true)]
    async fn invalidate_bypasses_fresh_entry() {
        let (remote, manager) = setup();
        remote.put(EntityKind::Shop, CompositeKey::guild("g1"), json!({"items": []}));
        let key = CompositeKey::guild("g1");
        manager.read(EntityKind::Shop, &key).await.unwrap();

        remote.put(EntityKind::Shop, key.clone(), json!({"items": ["potion"]}));
        assert!(manager.invalidate(EntityKind::Shop, &key).await);

        let doc = manager.read(EntityKind::Shop, &key).await.unwrap();
        assert_eq!(doc, Some(json!({"items": ["potion"]})));
        assert_eq!(remote.fetch_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn invalidate_waits_for_in_flight_read() {
        let (remote, manager) = snapshot_setup();
        let key = CompositeKey::guild("g1");
        remote.put(EntityKind::Settings, key.clone(), json!({"prefix": "!"}));

        let reader = manager.clone();
        let read_key = key.clone();
        let in_flight =
            tokio::spawn(async move { reader.read(EntityKind::Settings, &read_key).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        remote.put(EntityKind::Settings, key.clone(), json!({"prefix": "?"}));
        manager.invalidate(EntityKind::Settings, &key).await;

        // The fetch that was already on the wire still answers with the old document.
        let old = in_flight.await.unwrap().unwrap();
        assert_eq!(old, Some(json!({"prefix": "!"})));

        let next = manager.read(EntityKind::Settings, &key).await.unwrap();
        assert_eq!(next, Some(json!({"prefix": "?"})));
    }

    #[tokio::test(start_paused = true)]
    async fn invalidate_kind_waits_for_in_flight_reads() {
        let (remote, manager) = snapshot_setup();
        remote.put(EntityKind::Users, alice(), json!({"name": "Alice"}));

        let reader = manager.clone();
        let in_flight = tokio::spawn(async move { reader.read(EntityKind::Users, &alice()).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        remote.put(EntityKind::Users, alice(), json!({"name": "Alicia"}));
        manager.invalidate_kind(EntityKind::Users).await;
        in_flight.await.unwrap().unwrap();

        assert!(manager.collection(EntityKind::Users).is_empty());
        let next = manager.read(EntityKind::Users, &alice()).await.unwrap();
        assert_eq!(next, Some(json!({"name": "Alicia"})));
    }

    #[tokio::test(start_paused = true)]
    async fn sub_second_max_age() {
        let remote = Arc::new(MemoryRemote::new());
        let manager = CacheManager::builder(remote.clone())
            .config(CacheConfig::new().with_max_age(Duration::from_millis(500)))
            .build();
        remote.put(EntityKind::Bank, alice(), json!({"vault": 1}));

        manager.read(EntityKind::Bank, &alice()).await.unwrap();
        tokio::time::advance(Duration::from_millis(400)).await;
        manager.read(EntityKind::Bank, &alice()).await.unwrap();
        assert_eq!(remote.fetch_count(), 1);

        tokio::time::advance(Duration::from_millis(200)).await;
        manager.read(EntityKind::Bank, &alice()).await.unwrap();
        assert_eq!(remote.fetch_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_amount_fails_before_io() {
        let (remote, manager) = setup();
        let err = manager
            .add(EntityKind::Balances, &alice(), "money", f64::INFINITY)
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidType);
        assert_eq!(remote.apply_count(), 0);

        let err = manager
            .set(EntityKind::Balances, &alice(), "a..b", json!(1))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidPath);
        assert_eq!(remote.apply_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_write_keeps_cache() {
        let (remote, manager) = setup();
        remote.put(EntityKind::Balances, alice(), json!({"money": "n/a"}));
        manager.read(EntityKind::Balances, &alice()).await.unwrap();

        let err = manager
            .subtract(EntityKind::Balances, &alice(), "money", 1.0)
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidType);
        assert!(manager.collection(EntityKind::Balances).get(&alice()).await.is_some());
        assert_eq!(
            manager.fetch(EntityKind::Balances, &alice(), "money").await.unwrap(),
            Some(json!("n/a"))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn hung_remote_times_out() {
        let (remote, manager) = setup();
        remote.set_latency(Duration::from_secs(3600));

        let err = manager.read(EntityKind::History, &alice()).await.unwrap_err();
        assert!(matches!(err, StoreError::Timeout { operation: "fetch", .. }));
        assert_eq!(err.code(), ErrorCode::StorageIo);
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_write_drops_cache_entry() {
        let (remote, manager) = setup();
        remote.put(EntityKind::Balances, alice(), json!({"money": 1}));
        manager.read(EntityKind::Balances, &alice()).await.unwrap();

        remote.set_latency(Duration::from_secs(3600));
        let err = manager
            .add(EntityKind::Balances, &alice(), "money", 1.0)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Timeout { .. }));
        assert!(manager.collection(EntityKind::Balances).get(&alice()).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn caller_token_cancels_in_flight_call() {
        let (remote, manager) = setup();
        remote.set_latency(Duration::from_millis(400));
        let token = CancellationToken::new();

        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            canceller.cancel();
        });

        let opts = CallOptions::new().with_cancel(token);
        let err = manager
            .read_with(EntityKind::Inventory, &alice(), &opts)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Cancelled { operation: "fetch" }));
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_refuses_new_calls() {
        let (_remote, manager) = setup();
        manager.shutdown();
        assert!(manager.is_shut_down());

        let err = manager.read(EntityKind::Users, &alice()).await.unwrap_err();
        assert!(matches!(err, StoreError::Cancelled { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_same_key_writes_are_serialized() {
        let (remote, manager) = setup();
        remote.set_latency(Duration::from_millis(5));

        let mut handles = Vec::new();
        for _ in 0..20 {
            let manager = manager.clone();
            handles.push(tokio::spawn(async move {
                manager
                    .add(EntityKind::Balances, &alice(), "money", 1.0)
                    .await
                    .unwrap()
            }));
        }
        let mut results = Vec::new();
        for handle in handles {
            results.push(handle.await.unwrap().as_i64().unwrap());
        }
        results.sort_unstable();
        assert_eq!(results, (1..=20).collect::<Vec<_>>());

        let cached = manager.collection(EntityKind::Balances).get(&alice()).await.unwrap();
        assert_eq!(cached.data, json!({"money": 20}));
        assert_eq!(remote.peek(EntityKind::Balances, &alice()), Some(json!({"money": 20})));
    }

    #[tokio::test(start_paused = true)]
    async fn writes_publish_events_with_reason() {
        let remote = Arc::new(MemoryRemote::new());
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        let manager = CacheManager::builder(remote).events(bus).build();

        let opts = CallOptions::new().with_reason("sold a sword");
        manager
            .write_with(
                EntityKind::Balances,
                &alice(),
                Some("money"),
                Mutation::Add { amount: 75.0 },
                &opts,
            )
            .await
            .unwrap();

        let event = rx.recv().await.unwrap();
        assert_eq!(event.guild_id, "g1");
        assert_eq!(event.member_id.as_deref(), Some("alice"));
        assert_eq!(event.path, "money");
        assert_eq!(event.value, json!(75));
        assert_eq!(event.reason.as_deref(), Some("sold a sword"));
    }

    #[tokio::test(start_paused = true)]
    async fn remove_deletes_remote_and_cache() {
        let (remote, manager) = setup();
        remote.put(EntityKind::Cooldowns, alice(), json!({"daily": 1}));
        manager.read(EntityKind::Cooldowns, &alice()).await.unwrap();

        assert!(manager.remove(EntityKind::Cooldowns, &alice()).await.unwrap());
        assert!(remote.peek(EntityKind::Cooldowns, &alice()).is_none());
        assert!(manager.collection(EntityKind::Cooldowns).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn remove_with_honours_caller_token() {
        let (remote, manager) = setup();
        remote.put(EntityKind::Cooldowns, alice(), json!({"daily": 1}));
        manager.read(EntityKind::Cooldowns, &alice()).await.unwrap();

        remote.set_latency(Duration::from_millis(400));
        let token = CancellationToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            canceller.cancel();
        });

        let opts = CallOptions::new().with_cancel(token);
        let err = manager
            .remove_with(EntityKind::Cooldowns, &alice(), &opts)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Cancelled { operation: "remove" }));
        // The outcome is unknown, so the cached copy is gone either way.
        assert!(manager.collection(EntityKind::Cooldowns).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn read_as_deserializes() {
        #[derive(Debug, Deserialize, PartialEq)]
        struct Balance {
            money: i64,
            bank: i64,
        }

        let (remote, manager) = setup();
        remote.put(EntityKind::Balances, alice(), json!({"money": 3, "bank": 9}));
        let balance: Option<Balance> = manager
            .read_as(EntityKind::Balances, &alice())
            .await
            .unwrap();
        assert_eq!(balance, Some(Balance { money: 3, bank: 9 }));
    }

    #[tokio::test(start_paused = true)]
    async fn invalidate_all_clears_every_kind() {
        let (remote, manager) = setup();
        remote.put(EntityKind::Balances, alice(), json!({}));
        remote.put(EntityKind::Inventory, alice(), json!({}));
        manager.read(EntityKind::Balances, &alice()).await.unwrap();
        manager.read(EntityKind::Inventory, &alice()).await.unwrap();

        manager.invalidate_all().await;
        assert!(manager.collection(EntityKind::Balances).is_empty());
        assert!(manager.collection(EntityKind::Inventory).is_empty());
    }
}
