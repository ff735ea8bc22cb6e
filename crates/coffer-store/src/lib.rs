//! # coffer-store
//!
//! Storage engine for coffer.
//!
//! Two independent layers share one document model. Documents are JSON
//! trees addressed by dot-separated paths (`"inventory.items"`), and every
//! mutation (set, add, subtract, push, pull, delete) goes through
//! [`document::apply`] no matter where the tree lives.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │  FileStore      (one JSON file, atomic save)  │
//! ├──────────────────────────────────────────────┤
//! │  CacheManager   (write-through, per-key lock) │
//! │  CacheCollection × EntityKind (moka)          │
//! ├──────────────────────────────────────────────┤
//! │  RemoteStore    MemoryRemote | SqliteRemote   │
//! │  Database       (rusqlite WAL + mmap)         │
//! │  Migrations     (versioned, transactional)    │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! ## Quick start
//!
//! ```ignore
//! use coffer_store::{CacheManager, CompositeKey, Database, EntityKind, FileStore, SqliteRemote};
//!
//! let store = FileStore::open(&FileStoreConfig::new("data/coffer.json"))?;
//! store.add("guild1.alice.money", 100.0)?;
//!
//! let db = Database::open_and_migrate("data/coffer.db").await?;
//! let manager = CacheManager::new(Arc::new(SqliteRemote::new(db)));
//! let key = CompositeKey::member("guild1", "alice");
//! manager.add(EntityKind::Balances, &key, "money", 50.0).await?;
//! ```

pub mod cache;
pub mod config;
pub mod db;
pub mod document;
pub mod error;
pub mod events;
pub mod file_store;
pub mod key;
pub mod manager;
pub mod migration;
pub mod path;
pub mod remote;
pub mod sqlite_remote;

// ── re-exports ───────────────────────────────────────────────────────

pub use cache::{CacheCollection, CacheEntry, CacheStats, Lookup};
pub use config::{CacheConfig, EventsConfig, FileStoreConfig, SqliteConfig, StoreConfig};
pub use db::Database;
pub use document::Mutation;
pub use error::{ErrorCode, StoreError, StoreResult};
pub use events::{ChangeKind, EventBus, StoreEvent};
pub use file_store::FileStore;
pub use key::{CompositeKey, EntityKind};
pub use manager::{CacheManager, CacheManagerBuilder, CallOptions};
pub use path::DotPath;
pub use remote::{Applied, MemoryRemote, RemoteStore};
pub use sqlite_remote::SqliteRemote;
