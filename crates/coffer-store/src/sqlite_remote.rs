//! SQLite-backed document database.
//!
//! Each document is one JSON row in the `documents` table, keyed by
//! `(kind, guild_id, scoped, member_id)`. Guild-wide documents store
//! `scoped = 0` and an empty member id, so they never collide with a member
//! whose id is the empty string. Mutations run read-modify-write inside an
//! `IMMEDIATE` transaction, so two processes sharing the file cannot
//! interleave on the same row. The row as committed is returned to the caller.

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{OptionalExtension, TransactionBehavior};
use serde_json::Value;
use tracing::{debug, instrument};

use crate::db::Database;
use crate::document::{self, Mutation};
use crate::error::StoreResult;
use crate::key::{CompositeKey, EntityKind};
use crate::path::DotPath;
use crate::remote::{Applied, RemoteStore};

/// [`RemoteStore`] over a local SQLite database.
#[derive(Clone)]
pub struct SqliteRemote {
    db: Database,
}

impl SqliteRemote {
    /// Wrap an already migrated database.
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Number of stored documents of `kind`.
    pub async fn count(&self, kind: EntityKind) -> StoreResult<u64> {
        self.db
            .execute(move |conn| {
                let n: i64 = conn.query_row(
                    "SELECT count(*) FROM documents WHERE kind = ?1",
                    rusqlite::params![kind.as_str()],
                    |row| row.get(0),
                )?;
                Ok(u64::try_from(n).unwrap_or(0))
            })
            .await
    }
}

fn select(
    conn: &rusqlite::Connection,
    kind: EntityKind,
    key: &CompositeKey,
) -> StoreResult<Option<Value>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT data FROM documents WHERE kind = ?1 AND guild_id = ?2 AND scoped = ?3 AND member_id = ?4",
            rusqlite::params![
                kind.as_str(),
                key.guild_id,
                key.is_member_scoped(),
                key.member_or_empty()
            ],
            |row| row.get(0),
        )
        .optional()?;
    match raw {
        Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        None => Ok(None),
    }
}

#[async_trait]
impl RemoteStore for SqliteRemote {
    #[instrument(skip(self, key), fields(key = %key))]
    async fn fetch(&self, kind: EntityKind, key: &CompositeKey) -> StoreResult<Option<Value>> {
        let key = key.clone();
        self.db.execute(move |conn| select(conn, kind, &key)).await
    }

    #[instrument(skip(self, key, path, mutation), fields(key = %key, op = %mutation.change_kind()))]
    async fn apply(
        &self,
        kind: EntityKind,
        key: &CompositeKey,
        path: Option<&DotPath>,
        mutation: &Mutation,
    ) -> StoreResult<Applied> {
        let key = key.clone();
        let path = path.cloned();
        let mutation = mutation.clone();

        self.db
            .execute_mut(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

                let mut next = select(&tx, kind, &key)?.unwrap_or(Value::Null);
                // An Err here drops `tx`, which rolls back.
                let value = document::apply(&mut next, path.as_ref(), &mutation)?;

                if next.is_null() {
                    tx.execute(
                        "DELETE FROM documents WHERE kind = ?1 AND guild_id = ?2 AND scoped = ?3 AND member_id = ?4",
                        rusqlite::params![
                            kind.as_str(),
                            key.guild_id,
                            key.is_member_scoped(),
                            key.member_or_empty()
                        ],
                    )?;
                } else {
                    tx.execute(
                        "INSERT INTO documents (kind, guild_id, scoped, member_id, data, updated_at) \
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
                         ON CONFLICT(kind, guild_id, scoped, member_id) DO UPDATE SET \
                         data = excluded.data, updated_at = excluded.updated_at",
                        rusqlite::params![
                            kind.as_str(),
                            key.guild_id,
                            key.is_member_scoped(),
                            key.member_or_empty(),
                            serde_json::to_string(&next)?,
                            Utc::now().timestamp_millis(),
                        ],
                    )?;
                }
                tx.commit()?;

                debug!(kind = %kind, key = %key, "document committed");
                Ok(Applied {
                    document: next,
                    value,
                })
            })
            .await
    }

    #[instrument(skip(self, key), fields(key = %key))]
    async fn remove(&self, kind: EntityKind, key: &CompositeKey) -> StoreResult<bool> {
        let key = key.clone();
        self.db
            .execute(move |conn| {
                let deleted = conn.execute(
                    "DELETE FROM documents WHERE kind = ?1 AND guild_id = ?2 AND scoped = ?3 AND member_id = ?4",
                    rusqlite::params![
                        kind.as_str(),
                        key.guild_id,
                        key.is_member_scoped(),
                        key.member_or_empty()
                    ],
                )?;
                Ok(deleted > 0)
            })
            .await
    }
}

// ── tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use serde_json::json;

    async fn setup() -> SqliteRemote {
        let db = Database::open_in_memory().unwrap();
        db.migrate().await.unwrap();
        SqliteRemote::new(db)
    }

    fn p(raw: &str) -> DotPath {
        DotPath::parse(raw).unwrap()
    }

    #[tokio::test]
    async fn fetch_missing_returns_none() {
        let remote = setup().await;
        let doc = remote
            .fetch(EntityKind::Balances, &CompositeKey::member("g1", "u1"))
            .await
            .unwrap();
        assert!(doc.is_none());
    }

    #[tokio::test]
    async fn apply_upserts_and_returns_committed_document() {
        let remote = setup().await;
        let key = CompositeKey::member("g1", "u1");

        let first = remote
            .apply(EntityKind::Balances, &key, Some(&p("money")), &Mutation::Add { amount: 100.0 })
            .await
            .unwrap();
        assert_eq!(first.document, json!({"money": 100}));

        let second = remote
            .apply(EntityKind::Balances, &key, Some(&p("money")), &Mutation::Subtract { amount: 30.0 })
            .await
            .unwrap();
        assert_eq!(second.value, json!(70));
        assert_eq!(
            remote.fetch(EntityKind::Balances, &key).await.unwrap(),
            Some(json!({"money": 70}))
        );
        assert_eq!(remote.count(EntityKind::Balances).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn guild_documents_are_not_member_documents() {
        let remote = setup().await;
        let key = CompositeKey::guild("g1");
        remote
            .apply(EntityKind::Settings, &key, Some(&p("prefix")), &Mutation::Set { value: json!("!") })
            .await
            .unwrap();

        assert_eq!(
            remote.fetch(EntityKind::Settings, &key).await.unwrap(),
            Some(json!({"prefix": "!"}))
        );
        assert!(
            remote
                .fetch(EntityKind::Settings, &CompositeKey::member("g1", "u1"))
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn empty_member_id_is_not_the_guild_document() {
        let remote = setup().await;
        let guild = CompositeKey::guild("g1");
        let blank = CompositeKey::member("g1", "");
        remote
            .apply(EntityKind::Settings, &guild, Some(&p("prefix")), &Mutation::Set { value: json!("!") })
            .await
            .unwrap();
        remote
            .apply(EntityKind::Settings, &blank, Some(&p("prefix")), &Mutation::Set { value: json!("?") })
            .await
            .unwrap();

        assert_eq!(
            remote.fetch(EntityKind::Settings, &guild).await.unwrap(),
            Some(json!({"prefix": "!"}))
        );
        assert_eq!(
            remote.fetch(EntityKind::Settings, &blank).await.unwrap(),
            Some(json!({"prefix": "?"}))
        );
        assert_eq!(remote.count(EntityKind::Settings).await.unwrap(), 2);

        assert!(remote.remove(EntityKind::Settings, &blank).await.unwrap());
        assert!(remote.fetch(EntityKind::Settings, &guild).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn failed_mutation_rolls_back() {
        let remote = setup().await;
        let key = CompositeKey::member("g1", "u1");
        remote
            .apply(EntityKind::Inventory, &key, Some(&p("items")), &Mutation::Set { value: json!("oops") })
            .await
            .unwrap();

        let err = remote
            .apply(EntityKind::Inventory, &key, Some(&p("items")), &Mutation::Push { item: json!(1) })
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidType);
        assert_eq!(
            remote.fetch(EntityKind::Inventory, &key).await.unwrap(),
            Some(json!({"items": "oops"}))
        );
    }

    #[tokio::test]
    async fn whole_document_delete_removes_row() {
        let remote = setup().await;
        let key = CompositeKey::member("g1", "u1");
        remote
            .apply(EntityKind::Cooldowns, &key, None, &Mutation::Set { value: json!({"daily": 1}) })
            .await
            .unwrap();

        let applied = remote
            .apply(EntityKind::Cooldowns, &key, None, &Mutation::Delete)
            .await
            .unwrap();
        assert_eq!(applied.value, json!(true));
        assert!(applied.document.is_null());
        assert_eq!(remote.count(EntityKind::Cooldowns).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn remove_reports_existence() {
        let remote = setup().await;
        let key = CompositeKey::member("g1", "u1");
        remote
            .apply(EntityKind::History, &key, Some(&p("log")), &Mutation::Push { item: json!("x") })
            .await
            .unwrap();

        assert!(remote.remove(EntityKind::History, &key).await.unwrap());
        assert!(!remote.remove(EntityKind::History, &key).await.unwrap());
    }
}
