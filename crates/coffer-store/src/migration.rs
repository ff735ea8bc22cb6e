//! Versioned schema for the document database.
//!
//! The applied version lives in SQLite's `user_version` header field. Each
//! step runs in its own `IMMEDIATE` transaction together with the version
//! bump, so a crash mid-upgrade leaves the file at the last complete step
//! and two processes opening the same file cannot both apply a step.

use rusqlite::{Connection, TransactionBehavior};
use tracing::{debug, info, warn};

use crate::error::{StoreError, StoreResult};

struct Step {
    version: u32,
    description: &'static str,
    sql: &'static str,
}

/// Schema steps, oldest first. Append only.
static STEPS: &[Step] = &[Step {
    version: 1,
    description: "documents keyed by kind, guild, scope and member",
    sql: r#"
        CREATE TABLE documents (
            kind       TEXT NOT NULL CHECK(kind IN (
                'balances','bank','cooldowns','currencies','guilds',
                'history','inventory','settings','shop','users'
            )),
            guild_id   TEXT NOT NULL,
            scoped     INTEGER NOT NULL DEFAULT 0 CHECK(scoped IN (0, 1)),
            member_id  TEXT NOT NULL DEFAULT '',
            data       TEXT NOT NULL,
            updated_at INTEGER NOT NULL,
            PRIMARY KEY (kind, guild_id, scoped, member_id)
        );
        CREATE INDEX idx_documents_guild ON documents(guild_id);
    "#,
}];

/// Version the schema ends at once every step is applied.
pub fn latest_version() -> u32 {
    STEPS.last().map_or(0, |step| step.version)
}

/// Version recorded in the database file (0 for a fresh file).
pub fn current_version(conn: &Connection) -> StoreResult<u32> {
    conn.pragma_query_value(None, "user_version", |row| row.get(0))
        .map_err(|e| failed(0, "read user_version", e))
}

/// Bring the schema up to [`latest_version`], returning the final version.
///
/// Blocking; [`Database`](crate::db::Database) calls it on the blocking pool.
pub fn upgrade(conn: &mut Connection) -> StoreResult<u32> {
    let from = current_version(conn)?;
    let latest = latest_version();

    if from > latest {
        return Err(StoreError::Migration {
            version: from,
            message: format!("database schema v{from} is newer than this build (v{latest})"),
        });
    }
    if from == latest {
        debug!(version = from, "schema up to date");
        return Ok(from);
    }

    info!(from, to = latest, "upgrading schema");
    for step in STEPS.iter().filter(|step| step.version > from) {
        apply_step(conn, step)?;
    }
    Ok(latest)
}

fn apply_step(conn: &mut Connection, step: &Step) -> StoreResult<()> {
    let version = step.version;
    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .map_err(|e| failed(version, "begin", e))?;

    // Another process may have finished this step while we waited.
    if current_version(&tx)? >= version {
        debug!(version, "step already applied elsewhere");
        return Ok(());
    }

    if let Err(e) = tx.execute_batch(step.sql) {
        warn!(version, error = %e, "schema step failed, rolling back");
        return Err(failed(version, step.description, e));
    }
    tx.pragma_update(None, "user_version", version)
        .map_err(|e| failed(version, "bump user_version", e))?;
    tx.commit().map_err(|e| failed(version, "commit", e))?;

    info!(version, description = step.description, "schema step applied");
    Ok(())
}

fn failed(version: u32, context: &str, err: rusqlite::Error) -> StoreError {
    StoreError::Migration {
        version,
        message: format!("{context}: {err}"),
    }
}
