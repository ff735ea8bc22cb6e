//! Flat-file document store.
//!
//! The whole dataset is one JSON object held in memory and rewritten to a
//! single file after every mutation. Reads are served from memory.
//!
//! Top-level keys are owner scopes (guild ids), second-level keys entity
//! scopes (member ids), and everything below is free-form:
//!
//! ```text
//! {
//!   "g1": {
//!     "u1": { "money": 150, "inventory": [{ "id": 2 }] }
//!   }
//! }
//! ```
//!
//! Mutations are serialized by an internal mutex. Each one is applied to a
//! scratch copy of the tree, the copy is written to disk, and only then does
//! it replace the live tree, so memory never runs ahead of the file.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::Utc;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::config::FileStoreConfig;
use crate::document::{self, Mutation};
use crate::error::{StoreError, StoreResult};
use crate::events::{ChangeKind, EventBus, StoreEvent};
use crate::path::{self, DotPath};

/// JSON document persisted to a single file.
///
/// Owned explicitly: construct one per data file and share it by reference
/// or `Arc`. Tests get isolated instances by pointing each at a temp file.
pub struct FileStore {
    path: PathBuf,
    pretty: bool,
    tree: Mutex<Value>,
    events: Option<EventBus>,
}

impl FileStore {
    /// Load the document at `config.path`, creating it when missing.
    ///
    /// A file that is not valid JSON, or whose top level is not an object,
    /// is moved to `<file>.corrupt` and replaced by an empty document when
    /// `repair_corrupt` is set; otherwise opening fails with
    /// [`StoreError::Corrupt`].
    pub fn open(config: &FileStoreConfig) -> StoreResult<Self> {
        let path = config.path.clone();
        info!(path = %path.display(), "opening flat-file store");

        let store = Self {
            tree: Mutex::new(Value::Object(Map::new())),
            path,
            pretty: config.pretty,
            events: None,
        };

        if !store.path.exists() {
            if let Some(parent) = store.path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent)?;
            }
            store.persist(&Value::Object(Map::new()))?;
            debug!(path = %store.path.display(), "created empty data file");
            return Ok(store);
        }

        let text = fs::read_to_string(&store.path)?;
        if text.trim().is_empty() {
            store.persist(&Value::Object(Map::new()))?;
            return Ok(store);
        }

        match parse_tree(&text) {
            Ok(tree) => {
                *store.lock()? = tree;
                Ok(store)
            }
            Err(reason) if config.repair_corrupt => {
                let backup = sidecar(&store.path, "corrupt");
                warn!(
                    path = %store.path.display(),
                    backup = %backup.display(),
                    %reason,
                    "data file is corrupt, starting from an empty document"
                );
                fs::rename(&store.path, &backup)?;
                store.persist(&Value::Object(Map::new()))?;
                Ok(store)
            }
            Err(reason) => Err(StoreError::Corrupt {
                path: store.path.clone(),
                reason,
            }),
        }
    }

    /// Publish a [`StoreEvent`] on `bus` after every mutation.
    pub fn with_events(mut self, bus: EventBus) -> Self {
        self.events = Some(bus);
        self
    }

    /// Location of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Value at `path`, or `None` when any segment is missing or the value
    /// is `null`.
    pub fn fetch(&self, path: &str) -> StoreResult<Option<Value>> {
        let path = DotPath::parse(path)?;
        let tree = self.lock()?;
        Ok(document::read(&tree, Some(&path)).cloned())
    }

    /// Assign `value` at `path` and return it.
    pub fn set(&self, path: &str, value: Value) -> StoreResult<Value> {
        self.apply(path, Mutation::Set { value })
    }

    /// Add `amount` to the number at `path` (absent counts as zero).
    pub fn add(&self, path: &str, amount: f64) -> StoreResult<Value> {
        self.apply(path, Mutation::Add { amount })
    }

    /// Subtract `amount` from the number at `path`. No floor is applied.
    pub fn subtract(&self, path: &str, amount: f64) -> StoreResult<Value> {
        self.apply(path, Mutation::Subtract { amount })
    }

    /// Append `item` to the array at `path` and return the new array.
    pub fn push(&self, path: &str, item: Value) -> StoreResult<Value> {
        self.apply(path, Mutation::Push { item })
    }

    /// Remove the first element equal to `value` and return the new array.
    pub fn pull(&self, path: &str, value: Value) -> StoreResult<Value> {
        self.apply(path, Mutation::Pull { value })
    }

    /// Remove every element matching `predicate` and return the new array.
    pub fn pull_where<F>(&self, path: &str, predicate: F) -> StoreResult<Value>
    where
        F: Fn(&Value) -> bool,
    {
        let path = DotPath::parse(path)?;
        let mut tree = self.lock()?;
        let mut next = tree.clone();
        let out = document::pull_where(&mut next, Some(&path), predicate)?;
        self.persist(&next)?;
        *tree = next;
        drop(tree);

        self.emit(ChangeKind::Pull, &path, None, &out, None);
        Ok(out)
    }

    /// Remove the key at `path`, reporting whether anything was removed.
    pub fn delete(&self, path: &str) -> StoreResult<bool> {
        let out = self.apply(path, Mutation::Delete)?;
        Ok(out.as_bool().unwrap_or(false))
    }

    /// Deep copy of the entire document.
    ///
    /// Callers get a snapshot; mutating it does not touch the store.
    pub fn all(&self) -> StoreResult<Value> {
        Ok(self.lock()?.clone())
    }

    /// Run `mutation` at `path`.
    pub fn apply(&self, path: &str, mutation: Mutation) -> StoreResult<Value> {
        self.apply_with_reason(path, mutation, None)
    }

    /// Run `mutation` at `path`, attaching `reason` to the emitted event.
    pub fn apply_with_reason(
        &self,
        path: &str,
        mutation: Mutation,
        reason: Option<&str>,
    ) -> StoreResult<Value> {
        let path = DotPath::parse(path)?;
        mutation.validate(Some(&path))?;

        let mut tree = self.lock()?;
        let mut next = tree.clone();
        let out = document::apply(&mut next, Some(&path), &mutation)?;

        if mutation == Mutation::Delete && out == Value::Bool(false) {
            debug!(path = %path, "delete matched nothing, skipping write");
            return Ok(out);
        }

        self.persist(&next)?;
        *tree = next;
        drop(tree);

        debug!(path = %path, op = %mutation.change_kind(), "file store mutation");
        self.emit(mutation.change_kind(), &path, mutation.amount(), &out, reason);
        Ok(out)
    }

    // ── internals ────────────────────────────────────────────────────

    fn lock(&self) -> StoreResult<MutexGuard<'_, Value>> {
        self.tree
            .lock()
            .map_err(|_| StoreError::LockPoisoned { what: "document tree" })
    }

    /// Write the full tree to `<file>.tmp`, flush it, then rename over the
    /// data file.
    fn persist(&self, tree: &Value) -> StoreResult<()> {
        let bytes = if self.pretty {
            serde_json::to_vec_pretty(tree)?
        } else {
            serde_json::to_vec(tree)?
        };

        let tmp = sidecar(&self.path, "tmp");
        {
            let mut file = File::create(&tmp)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        debug!(path = %self.path.display(), bytes = bytes.len(), "data file written");
        Ok(())
    }

    fn emit(
        &self,
        change: ChangeKind,
        path: &DotPath,
        amount: Option<f64>,
        value: &Value,
        reason: Option<&str>,
    ) {
        let Some(bus) = &self.events else {
            return;
        };
        let segments = path.segments();
        bus.publish(StoreEvent {
            change,
            guild_id: segments[0].clone(),
            member_id: segments.get(1).cloned(),
            path: path.to_string(),
            amount,
            value: value.clone(),
            reason: reason.map(str::to_owned),
            timestamp: Utc::now(),
        });
    }
}

impl std::fmt::Debug for FileStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileStore")
            .field("path", &self.path)
            .field("pretty", &self.pretty)
            .finish_non_exhaustive()
    }
}

fn parse_tree(text: &str) -> Result<Value, String> {
    match serde_json::from_str::<Value>(text) {
        Ok(tree @ Value::Object(_)) => Ok(tree),
        Ok(other) => Err(format!(
            "top-level value is {}, expected an object",
            path::kind_name(&other)
        )),
        Err(e) => Err(e.to_string()),
    }
}

/// `data.json` -> `data.json.<suffix>`
fn sidecar(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".");
    name.push(suffix);
    path.with_file_name(name)
}

// ── tests ────────────────────────────────────────────────────────────
