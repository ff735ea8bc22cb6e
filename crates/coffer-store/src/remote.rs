//! The remote document database seam.
//!
//! [`RemoteStore`] is what the cache manager talks to. The remote side is
//! the source of truth: every mutation returns the document as the remote
//! store holds it after the write, and that value, not a locally computed
//! guess, is what gets cached.
//!
//! Two implementations ship with the crate: [`MemoryRemote`] (in-process,
//! with call counters and fault injection for tests) and
//! [`SqliteRemote`](crate::sqlite_remote::SqliteRemote).

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde_json::Value;
use tracing::debug;

use crate::document::{self, Mutation};
use crate::error::{StoreError, StoreResult};
use crate::key::{CompositeKey, EntityKind};
use crate::path::DotPath;

/// Outcome of a remote mutation.
#[derive(Debug, Clone, PartialEq)]
pub struct Applied {
    /// The whole document after the write (`Null` once it no longer exists).
    pub document: Value,
    /// The value of the mutated slot (for delete, whether a key was removed).
    pub value: Value,
}

/// A document database addressed by entity kind and composite key.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Read one document. `Ok(None)` means it does not exist.
    async fn fetch(&self, kind: EntityKind, key: &CompositeKey) -> StoreResult<Option<Value>>;

    /// Apply `mutation` to the slot at `path` inside the document (the whole
    /// document when `path` is `None`), creating the document if needed.
    async fn apply(
        &self,
        kind: EntityKind,
        key: &CompositeKey,
        path: Option<&DotPath>,
        mutation: &Mutation,
    ) -> StoreResult<Applied>;

    /// Delete one document, reporting whether it existed.
    async fn remove(&self, kind: EntityKind, key: &CompositeKey) -> StoreResult<bool>;
}

// ═══════════════════════════════════════════════════════════════════════
//  In-process implementation
// ═══════════════════════════════════════════════════════════════════════

type DocId = (EntityKind, CompositeKey);

/// In-process document database.
///
/// Besides embedding, it is the test double for the cache manager: it
/// counts calls, can add latency to every call, and can be switched
/// offline to make every call fail.
#[derive(Debug, Default)]
pub struct MemoryRemote {
    docs: DashMap<DocId, Value>,
    fetches: AtomicU64,
    applies: AtomicU64,
    offline: AtomicBool,
    latency_ms: AtomicU64,
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write a document directly, bypassing any cache in front of this
    /// store. Stands in for a writer in another process.
    pub fn put(&self, kind: EntityKind, key: CompositeKey, document: Value) {
        self.docs.insert((kind, key), document);
    }

    /// Read a document directly, without counting a fetch.
    pub fn peek(&self, kind: EntityKind, key: &CompositeKey) -> Option<Value> {
        self.docs
            .get(&(kind, key.clone()))
            .map(|doc| doc.value().clone())
    }

    /// Make every subsequent call fail with [`StoreError::Remote`].
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Delay every subsequent call by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        let ms = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);
        self.latency_ms.store(ms, Ordering::SeqCst);
    }

    /// Number of `fetch` calls served.
    pub fn fetch_count(&self) -> u64 {
        self.fetches.load(Ordering::SeqCst)
    }

    /// Number of `apply` calls served.
    pub fn apply_count(&self) -> u64 {
        self.applies.load(Ordering::SeqCst)
    }

    async fn enter(&self) -> StoreResult<()> {
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Remote("remote store is offline".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteStore for MemoryRemote {
    async fn fetch(&self, kind: EntityKind, key: &CompositeKey) -> StoreResult<Option<Value>> {
        self.enter().await?;
        self.fetches.fetch_add(1, Ordering::SeqCst);
        debug!(kind = %kind, key = %key, "memory remote fetch");
        Ok(self.peek(kind, key))
    }

    async fn apply(
        &self,
        kind: EntityKind,
        key: &CompositeKey,
        path: Option<&DotPath>,
        mutation: &Mutation,
    ) -> StoreResult<Applied> {
        self.enter().await?;
        self.applies.fetch_add(1, Ordering::SeqCst);
        debug!(kind = %kind, key = %key, op = %mutation.change_kind(), "memory remote apply");

        match self.docs.entry((kind, key.clone())) {
            Entry::Occupied(mut slot) => {
                let mut next = slot.get().clone();
                let value = document::apply(&mut next, path, mutation)?;
                if next.is_null() {
                    slot.remove();
                } else {
                    *slot.get_mut() = next.clone();
                }
                Ok(Applied {
                    document: next,
                    value,
                })
            }
            Entry::Vacant(slot) => {
                let mut next = Value::Null;
                let value = document::apply(&mut next, path, mutation)?;
                if !next.is_null() {
                    slot.insert(next.clone());
                }
                Ok(Applied {
                    document: next,
                    value,
                })
            }
        }
    }

    async fn remove(&self, kind: EntityKind, key: &CompositeKey) -> StoreResult<bool> {
        self.enter().await?;
        Ok(self.docs.remove(&(kind, key.clone())).is_some())
    }
}

// ── tests ────────────────────────────────────────────────────────────
