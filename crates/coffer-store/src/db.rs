//! SQLite handle backing [`SqliteRemote`](crate::sqlite_remote::SqliteRemote).
//!
//! One connection sits behind a mutex; every call is shipped to tokio's
//! blocking pool so the async caller never waits on file I/O directly.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use rusqlite::Connection;
use tracing::{debug, info};

use crate::error::{StoreError, StoreResult};
use crate::migration;

/// Cloneable handle to a SQLite document database.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
    path: Option<PathBuf>,
}

impl Database {
    /// Open or create the database file at `path`, creating missing parent
    /// directories. Blocks on file I/O.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        info!(path = %path.display(), "opening document database");
        Self::from_connection(Connection::open(path)?, Some(path.to_path_buf()))
    }

    /// Private in-memory database.
    pub fn open_in_memory() -> StoreResult<Self> {
        debug!("opening in-memory document database");
        Self::from_connection(Connection::open_in_memory()?, None)
    }

    /// [`open`](Self::open) on the blocking pool, then [`migrate`](Self::migrate).
    pub async fn open_and_migrate(path: impl AsRef<Path> + Send + 'static) -> StoreResult<Self> {
        let db = tokio::task::spawn_blocking(move || Self::open(path)).await??;
        db.migrate().await?;
        Ok(db)
    }

    /// Upgrade the schema, returning the resulting version.
    pub async fn migrate(&self) -> StoreResult<u32> {
        self.execute_mut(migration::upgrade).await
    }

    /// File backing this database; `None` when in memory.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Run `f` against the connection on the blocking pool.
    ///
    /// ```ignore
    /// let n: i64 = db
    ///     .execute(|conn| Ok(conn.query_row("SELECT count(*) FROM documents", [], |r| r.get(0))?))
    ///     .await?;
    /// ```
    pub async fn execute<F, T>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&Connection) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        self.execute_mut(move |conn| f(conn)).await
    }

    /// Like [`execute`](Self::execute), for closures that open transactions.
    pub async fn execute_mut<F, T>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&mut Connection) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| StoreError::LockPoisoned { what: "sqlite connection" })?;
            f(&mut guard)
        })
        .await?
    }

    fn from_connection(conn: Connection, path: Option<PathBuf>) -> StoreResult<Self> {
        tune(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path,
        })
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").field("path", &self.path).finish()
    }
}

/// Connection pragmas. Documents are small and re-read often, so reads are
/// served from mmap and the page cache; other processes sharing the file
/// wait on the lock instead of failing.
fn tune(conn: &Connection) -> StoreResult<()> {
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "mmap_size", 64_i64 * 1024 * 1024)?;
    // Negative means KiB.
    conn.pragma_update(None, "cache_size", -16_000_i32)?;
    conn.pragma_update(None, "temp_store", "MEMORY")?;
    conn.pragma_update(None, "busy_timeout", 5_000_i32)?;
    debug!("connection pragmas applied");
    Ok(())
}
