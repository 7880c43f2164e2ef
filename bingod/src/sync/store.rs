use std::{fs, path::Path, path::PathBuf};

use bingo_core::{MutationKind, Payload, UnknownKind};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteRow};
use sqlx::{Row, SqlitePool, migrate::Migrator};
use thiserror::Error;

use super::queue::{FailedItem, InvalidState, ItemState, QueueItem};

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

const ITEM_COLUMNS: &str = "id, kind, domain_key, payload, created_at, attempts, last_attempt_at, next_attempt_at, last_error, revision, state";
const FAILED_COLUMNS: &str =
    "id, kind, domain_key, payload, revision, created_at, attempts, last_attempt_at, failed_at, reason";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("payload encoding error: {0}")]
    Payload(#[from] serde_json::Error),
    #[error("XDG data directory is unavailable")]
    MissingDataDir,
    #[error(transparent)]
    InvalidKind(#[from] UnknownKind),
    #[error(transparent)]
    InvalidState(#[from] InvalidState),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StorageStats {
    pub pending: usize,
    pub synced: usize,
    pub failed: usize,
}

/// Result of moving a failed item back into the live queue.
#[derive(Debug, Clone, PartialEq)]
pub enum Requeue {
    Queued(QueueItem),
    NotFound,
    /// A newer edit of the same record is already pending; the failed item
    /// was left where it is.
    Superseded { pending_id: String },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncMeta {
    pub last_drain_at: Option<i64>,
    pub last_success_at: Option<i64>,
}

/// Durable home of queued mutations. Live items sit in `queue_items` in
/// insertion order; items that gave up are moved to `failed_items`.
#[derive(Clone)]
pub struct LocalStore {
    pool: SqlitePool,
}

impl LocalStore {
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(options).await?;
        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    pub async fn init(&self) -> Result<(), StoreError> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    pub async fn put(&self, item: &QueueItem) -> Result<(), StoreError> {
        upsert_item(&self.pool, item).await
    }

    /// Looks in the live table first, then in the failed-store.
    pub async fn get(&self, id: &str) -> Result<Option<QueueItem>, StoreError> {
        let sql = format!("SELECT {ITEM_COLUMNS} FROM queue_items WHERE id = ?1");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        if let Some(row) = row {
            return Ok(Some(item_from_row(&row)?));
        }
        Ok(self.get_failed(id).await?.map(FailedItem::into_queue_item))
    }

    pub async fn list_pending(&self) -> Result<Vec<QueueItem>, StoreError> {
        let sql = format!(
            "SELECT {ITEM_COLUMNS} FROM queue_items WHERE state = 'pending' ORDER BY seq ASC"
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(item_from_row).collect()
    }

    pub async fn remove(&self, id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM queue_items WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn find_pending_by_domain_key(
        &self,
        kind: MutationKind,
        domain_key: &str,
    ) -> Result<Option<QueueItem>, StoreError> {
        let sql = format!(
            "SELECT {ITEM_COLUMNS} FROM queue_items
             WHERE kind = ?1 AND domain_key = ?2 AND state = 'pending'
             ORDER BY seq ASC
             LIMIT 1"
        );
        let row = sqlx::query(&sql)
            .bind(kind.as_str())
            .bind(domain_key)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(item_from_row).transpose()
    }

    /// Swaps in a newer payload for a still-pending item and bumps its revision.
    pub async fn replace_payload(&self, id: &str, payload: &Payload) -> Result<bool, StoreError> {
        let encoded = serde_json::to_string(payload)?;
        let result = sqlx::query(
            "UPDATE queue_items SET payload = ?2, revision = revision + 1
             WHERE id = ?1 AND state = 'pending'",
        )
        .bind(id)
        .bind(encoded)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn record_attempt(
        &self,
        id: &str,
        attempts: u32,
        attempted_at: i64,
        next_attempt_at: Option<i64>,
        last_error: Option<&str>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE queue_items
             SET attempts = MAX(attempts, ?2), last_attempt_at = ?3, next_attempt_at = ?4, last_error = ?5
             WHERE id = ?1 AND state = 'pending'",
        )
        .bind(id)
        .bind(attempts)
        .bind(attempted_at)
        .bind(next_attempt_at)
        .bind(last_error)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Marks the item synced only if its payload is still the one that was
    /// delivered (`revision`).
    pub async fn mark_synced(
        &self,
        id: &str,
        revision: i64,
        attempts: u32,
        synced_at: i64,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE queue_items
             SET state = 'synced', attempts = MAX(attempts, ?3), last_attempt_at = ?4,
                 next_attempt_at = NULL, last_error = NULL
             WHERE id = ?1 AND revision = ?2 AND state = 'pending'",
        )
        .bind(id)
        .bind(revision)
        .bind(attempts)
        .bind(synced_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Moves a pending item to the failed-store in one transaction.
    pub async fn archive_failed(
        &self,
        id: &str,
        attempts: u32,
        failed_at: i64,
        reason: &str,
    ) -> Result<Option<FailedItem>, StoreError> {
        let mut tx = self.pool.begin().await?;
        let sql = format!(
            "SELECT {ITEM_COLUMNS} FROM queue_items WHERE id = ?1 AND state = 'pending'"
        );
        let Some(row) = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
        else {
            return Ok(None);
        };
        let item = item_from_row(&row)?;
        let failed = FailedItem {
            id: item.id,
            kind: item.kind,
            domain_key: item.domain_key,
            payload: item.payload,
            revision: item.revision,
            created_at: item.created_at,
            attempts: item.attempts.max(attempts),
            last_attempt_at: Some(failed_at),
            failed_at,
            reason: reason.to_string(),
        };

        sqlx::query(
            "INSERT OR REPLACE INTO failed_items (id, kind, domain_key, payload, revision, created_at, attempts, last_attempt_at, failed_at, reason)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        )
        .bind(&failed.id)
        .bind(failed.kind.as_str())
        .bind(&failed.domain_key)
        .bind(serde_json::to_string(&failed.payload)?)
        .bind(failed.revision)
        .bind(failed.created_at)
        .bind(failed.attempts)
        .bind(failed.last_attempt_at)
        .bind(failed.failed_at)
        .bind(&failed.reason)
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM queue_items WHERE id = ?1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok(Some(failed))
    }

    pub async fn get_failed(&self, id: &str) -> Result<Option<FailedItem>, StoreError> {
        let sql = format!("SELECT {FAILED_COLUMNS} FROM failed_items WHERE id = ?1");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(failed_from_row).transpose()
    }

    pub async fn list_failed(&self) -> Result<Vec<FailedItem>, StoreError> {
        let sql = format!("SELECT {FAILED_COLUMNS} FROM failed_items ORDER BY failed_at ASC, id ASC");
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(failed_from_row).collect()
    }

    /// Removes a failed item and hands it back for resubmission.
    pub async fn take_failed(&self, id: &str) -> Result<Option<FailedItem>, StoreError> {
        let Some(failed) = self.get_failed(id).await? else {
            return Ok(None);
        };
        sqlx::query("DELETE FROM failed_items WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(Some(failed))
    }

    /// Moves a failed item back into the live queue as a fresh pending item,
    /// unless a newer edit of the same record is already pending. The insert
    /// and the removal from `failed_items` commit together.
    pub async fn requeue_failed(&self, id: &str, now: i64) -> Result<Requeue, StoreError> {
        let mut tx = self.pool.begin().await?;
        let sql = format!("SELECT {FAILED_COLUMNS} FROM failed_items WHERE id = ?1");
        let Some(row) = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
        else {
            return Ok(Requeue::NotFound);
        };
        let failed = failed_from_row(&row)?;

        if let Some(key) = failed.domain_key.as_deref() {
            let pending_id: Option<String> = sqlx::query_scalar(
                "SELECT id FROM queue_items
                 WHERE kind = ?1 AND domain_key = ?2 AND state = 'pending'
                 ORDER BY seq ASC
                 LIMIT 1",
            )
            .bind(failed.kind.as_str())
            .bind(key)
            .fetch_optional(&mut *tx)
            .await?;
            if let Some(pending_id) = pending_id {
                return Ok(Requeue::Superseded { pending_id });
            }
        }

        let mut item = QueueItem::new(failed.kind, failed.payload, now);
        item.domain_key = failed.domain_key;
        upsert_item(&mut *tx, &item).await?;
        sqlx::query("DELETE FROM failed_items WHERE id = ?1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok(Requeue::Queued(item))
    }

    pub async fn clear_failed(&self) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM failed_items")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn purge_synced(&self) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM queue_items WHERE state = 'synced'")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Earliest time any pending item is due. An item without a backoff
    /// schedule counts as due at `0`.
    pub async fn next_due_at(&self) -> Result<Option<i64>, StoreError> {
        let due: Option<i64> = sqlx::query_scalar(
            "SELECT MIN(COALESCE(next_attempt_at, 0)) FROM queue_items WHERE state = 'pending'",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(due)
    }

    /// Claims the database-wide drain lease for `owner` until `expires_at`.
    /// Succeeds when the lease is free, expired, or already held by `owner`.
    pub async fn acquire_drain_lease(
        &self,
        owner: &str,
        now: i64,
        expires_at: i64,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "INSERT INTO drain_lease (id, owner, acquired_at, expires_at) VALUES (1, ?1, ?2, ?3)
             ON CONFLICT(id) DO UPDATE SET
                owner = excluded.owner,
                acquired_at = excluded.acquired_at,
                expires_at = excluded.expires_at
             WHERE drain_lease.owner = excluded.owner OR drain_lease.expires_at <= excluded.acquired_at",
        )
        .bind(owner)
        .bind(now)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn renew_drain_lease(&self, owner: &str, expires_at: i64) -> Result<bool, StoreError> {
        let result = sqlx::query("UPDATE drain_lease SET expires_at = ?2 WHERE id = 1 AND owner = ?1")
            .bind(owner)
            .bind(expires_at)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn release_drain_lease(&self, owner: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM drain_lease WHERE id = 1 AND owner = ?1")
            .bind(owner)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn storage_stats(&self) -> Result<StorageStats, StoreError> {
        let rows = sqlx::query("SELECT state, COUNT(*) AS count FROM queue_items GROUP BY state")
            .fetch_all(&self.pool)
            .await?;
        let mut stats = StorageStats::default();
        for row in rows {
            let state: String = row.try_get("state")?;
            let count: i64 = row.try_get("count")?;
            let count = usize::try_from(count).unwrap_or_default();
            match ItemState::parse(&state)? {
                ItemState::Pending => stats.pending += count,
                ItemState::Synced => stats.synced += count,
                ItemState::Failed => stats.failed += count,
            }
        }
        let failed: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM failed_items")
            .fetch_one(&self.pool)
            .await?;
        stats.failed += usize::try_from(failed).unwrap_or_default();
        Ok(stats)
    }

    pub async fn record_drain(
        &self,
        drained_at: i64,
        any_synced: bool,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO sync_meta (id, last_drain_at, last_success_at) VALUES (1, ?1, ?2)
             ON CONFLICT(id) DO UPDATE SET
                last_drain_at = excluded.last_drain_at,
                last_success_at = COALESCE(excluded.last_success_at, sync_meta.last_success_at)",
        )
        .bind(drained_at)
        .bind(any_synced.then_some(drained_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn sync_meta(&self) -> Result<SyncMeta, StoreError> {
        let row = sqlx::query("SELECT last_drain_at, last_success_at FROM sync_meta WHERE id = 1")
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(SyncMeta::default());
        };
        Ok(SyncMeta {
            last_drain_at: row.try_get("last_drain_at")?,
            last_success_at: row.try_get("last_success_at")?,
        })
    }

    #[cfg(test)]
    pub(crate) async fn in_memory() -> Self {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let store = Self::from_pool(pool);
        store.init().await.unwrap();
        store
    }
}

async fn upsert_item<'e, E>(executor: E, item: &QueueItem) -> Result<(), StoreError>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    let payload = serde_json::to_string(&item.payload)?;
    sqlx::query(
        "INSERT INTO queue_items (id, kind, domain_key, payload, created_at, attempts, last_attempt_at, next_attempt_at, last_error, revision, state)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
         ON CONFLICT(id) DO UPDATE SET
            kind = excluded.kind,
            domain_key = excluded.domain_key,
            payload = excluded.payload,
            created_at = excluded.created_at,
            attempts = excluded.attempts,
            last_attempt_at = excluded.last_attempt_at,
            next_attempt_at = excluded.next_attempt_at,
            last_error = excluded.last_error,
            revision = excluded.revision,
            state = excluded.state",
    )
    .bind(&item.id)
    .bind(item.kind.as_str())
    .bind(&item.domain_key)
    .bind(payload)
    .bind(item.created_at)
    .bind(item.attempts)
    .bind(item.last_attempt_at)
    .bind(item.next_attempt_at)
    .bind(&item.last_error)
    .bind(item.revision)
    .bind(item.state.as_str())
    .execute(executor)
    .await?;
    Ok(())
}

fn item_from_row(row: &SqliteRow) -> Result<QueueItem, StoreError> {
    let kind: String = row.try_get("kind")?;
    let payload: String = row.try_get("payload")?;
    let state: String = row.try_get("state")?;
    Ok(QueueItem {
        id: row.try_get("id")?,
        kind: MutationKind::parse(&kind)?,
        payload: serde_json::from_str(&payload)?,
        created_at: row.try_get("created_at")?,
        attempts: row.try_get("attempts")?,
        last_attempt_at: row.try_get("last_attempt_at")?,
        state: ItemState::parse(&state)?,
        domain_key: row.try_get("domain_key")?,
        next_attempt_at: row.try_get("next_attempt_at")?,
        last_error: row.try_get("last_error")?,
        revision: row.try_get("revision")?,
    })
}

fn failed_from_row(row: &SqliteRow) -> Result<FailedItem, StoreError> {
    let kind: String = row.try_get("kind")?;
    let payload: String = row.try_get("payload")?;
    Ok(FailedItem {
        id: row.try_get("id")?,
        kind: MutationKind::parse(&kind)?,
        domain_key: row.try_get("domain_key")?,
        payload: serde_json::from_str(&payload)?,
        revision: row.try_get("revision")?,
        created_at: row.try_get("created_at")?,
        attempts: row.try_get("attempts")?,
        last_attempt_at: row.try_get("last_attempt_at")?,
        failed_at: row.try_get("failed_at")?,
        reason: row.try_get("reason")?,
    })
}

pub fn default_db_path() -> Result<PathBuf, StoreError> {
    let mut path = dirs::data_dir().ok_or(StoreError::MissingDataDir)?;
    path.push("bingod");
    path.push("queue.db");
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn item(kind: MutationKind, value: serde_json::Value, now: i64) -> QueueItem {
        QueueItem::new(kind, value.as_object().cloned().unwrap(), now)
    }

    #[tokio::test]
    async fn put_and_get_round_trip() {
        let store = LocalStore::in_memory().await;
        let item = item(
            MutationKind::Occasion,
            json!({"id": "OCC_1", "totalPlayers": 80}),
            100,
        );

        store.put(&item).await.unwrap();
        let fetched = store.get(&item.id).await.unwrap().unwrap();

        assert_eq!(fetched, item);
        assert!(store.get("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn put_overwrites_by_id_and_keeps_position() {
        let store = LocalStore::in_memory().await;
        let mut first = item(MutationKind::Occasion, json!({"id": "A"}), 1);
        let second = item(MutationKind::Occasion, json!({"id": "B"}), 2);
        store.put(&first).await.unwrap();
        store.put(&second).await.unwrap();

        first.attempts = 2;
        first.last_error = Some("timeout".into());
        store.put(&first).await.unwrap();

        let pending = store.list_pending().await.unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].id, first.id);
        assert_eq!(pending[0].attempts, 2);
        assert_eq!(pending[1].id, second.id);
    }

    #[tokio::test]
    async fn list_pending_is_fifo_and_skips_terminal_items() {
        let store = LocalStore::in_memory().await;
        let a = item(MutationKind::Games, json!({"occasionId": "1"}), 1);
        let mut b = item(MutationKind::Games, json!({"occasionId": "2"}), 2);
        let c = item(MutationKind::Games, json!({"occasionId": "3"}), 3);
        b.state = ItemState::Synced;
        for item in [&a, &b, &c] {
            store.put(item).await.unwrap();
        }

        let ids: Vec<_> = store
            .list_pending()
            .await
            .unwrap()
            .into_iter()
            .map(|item| item.id)
            .collect();
        assert_eq!(ids, vec![a.id, c.id]);
    }

    #[tokio::test]
    async fn remove_deletes_live_item() {
        let store = LocalStore::in_memory().await;
        let item = item(MutationKind::Photo, json!({"id": "P1"}), 1);
        store.put(&item).await.unwrap();

        assert!(store.remove(&item.id).await.unwrap());
        assert!(!store.remove(&item.id).await.unwrap());
        assert!(store.get(&item.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn replace_payload_bumps_revision_only_while_pending() {
        let store = LocalStore::in_memory().await;
        let item = item(MutationKind::Occasion, json!({"id": "OCC_1", "v": 1}), 1);
        store.put(&item).await.unwrap();

        let newer = json!({"id": "OCC_1", "v": 2}).as_object().cloned().unwrap();
        assert!(store.replace_payload(&item.id, &newer).await.unwrap());
        let fetched = store
            .find_pending_by_domain_key(MutationKind::Occasion, "OCC_1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fetched.revision, 1);
        assert_eq!(fetched.payload, newer);

        assert!(store.mark_synced(&item.id, 1, 1, 5).await.unwrap());
        assert!(!store.replace_payload(&item.id, &newer).await.unwrap());
    }

    #[tokio::test]
    async fn mark_synced_requires_matching_revision() {
        let store = LocalStore::in_memory().await;
        let item = item(MutationKind::Occasion, json!({"id": "OCC_1"}), 1);
        store.put(&item).await.unwrap();
        store.replace_payload(&item.id, &item.payload).await.unwrap();

        assert!(!store.mark_synced(&item.id, 0, 1, 10).await.unwrap());
        let fetched = store.get(&item.id).await.unwrap().unwrap();
        assert_eq!(fetched.state, ItemState::Pending);

        assert!(store.mark_synced(&item.id, 1, 1, 10).await.unwrap());
        let fetched = store.get(&item.id).await.unwrap().unwrap();
        assert_eq!(fetched.state, ItemState::Synced);
        assert_eq!(fetched.attempts, 1);
    }

    #[tokio::test]
    async fn record_attempt_never_lowers_attempts() {
        let store = LocalStore::in_memory().await;
        let item = item(MutationKind::MoneyCount, json!({"occasionId": "1"}), 1);
        store.put(&item).await.unwrap();

        store
            .record_attempt(&item.id, 3, 50, Some(90), Some("timeout"))
            .await
            .unwrap();
        store
            .record_attempt(&item.id, 1, 60, None, None)
            .await
            .unwrap();

        let fetched = store.get(&item.id).await.unwrap().unwrap();
        assert_eq!(fetched.attempts, 3);
        assert_eq!(fetched.last_attempt_at, Some(60));
    }

    #[tokio::test]
    async fn archive_failed_moves_item_and_preserves_payload() {
        let store = LocalStore::in_memory().await;
        let item = item(
            MutationKind::Occasion,
            json!({"id": "OCC_1", "date": ""}),
            1,
        );
        store.put(&item).await.unwrap();

        let failed = store
            .archive_failed(&item.id, 1, 20, "date is required")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(failed.payload, item.payload);
        assert_eq!(failed.attempts, 1);

        assert!(store.list_pending().await.unwrap().is_empty());
        let fetched = store.get(&item.id).await.unwrap().unwrap();
        assert_eq!(fetched.state, ItemState::Failed);
        assert_eq!(fetched.last_error.as_deref(), Some("date is required"));
        assert_eq!(store.list_failed().await.unwrap().len(), 1);

        assert!(
            store
                .archive_failed(&item.id, 2, 30, "again")
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn take_and_clear_failed() {
        let store = LocalStore::in_memory().await;
        let a = item(MutationKind::Photo, json!({"id": "P1"}), 1);
        let b = item(MutationKind::Photo, json!({"id": "P2"}), 2);
        for item in [&a, &b] {
            store.put(item).await.unwrap();
            store.archive_failed(&item.id, 1, 5, "bad").await.unwrap();
        }

        let taken = store.take_failed(&a.id).await.unwrap().unwrap();
        assert_eq!(taken.id, a.id);
        assert!(store.take_failed(&a.id).await.unwrap().is_none());

        assert_eq!(store.clear_failed().await.unwrap(), 1);
        assert!(store.list_failed().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn storage_stats_and_purge_synced() {
        let store = LocalStore::in_memory().await;
        let pending = item(MutationKind::Games, json!({"occasionId": "1"}), 1);
        let mut synced = item(MutationKind::Games, json!({"occasionId": "2"}), 2);
        synced.state = ItemState::Synced;
        let failed = item(MutationKind::Games, json!({"occasionId": "3"}), 3);
        for item in [&pending, &synced, &failed] {
            store.put(item).await.unwrap();
        }
        store.archive_failed(&failed.id, 5, 9, "gave up").await.unwrap();

        assert_eq!(
            store.storage_stats().await.unwrap(),
            StorageStats {
                pending: 1,
                synced: 1,
                failed: 1
            }
        );
        assert_eq!(store.purge_synced().await.unwrap(), 1);
        assert_eq!(store.storage_stats().await.unwrap().synced, 0);
    }

    #[tokio::test]
    async fn record_drain_keeps_last_success() {
        let store = LocalStore::in_memory().await;
        assert_eq!(store.sync_meta().await.unwrap(), SyncMeta::default());

        store.record_drain(10, true).await.unwrap();
        store.record_drain(20, false).await.unwrap();

        let meta = store.sync_meta().await.unwrap();
        assert_eq!(meta.last_drain_at, Some(20));
        assert_eq!(meta.last_success_at, Some(10));
    }

    #[tokio::test]
    async fn reopening_file_database_keeps_pending_items() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("queue.db");
        let first = item(MutationKind::Occasion, json!({"id": "OCC_1"}), 1);
        let second = item(MutationKind::Occasion, json!({"id": "OCC_2"}), 2);

        let store = LocalStore::open(&path).await.unwrap();
        store.put(&first).await.unwrap();
        store.put(&second).await.unwrap();
        store.mark_synced(&second.id, 0, 1, 3).await.unwrap();
        store.close().await;

        let reopened = LocalStore::open(&path).await.unwrap();
        let pending = reopened.list_pending().await.unwrap();
        assert_eq!(pending, vec![first]);
    }

    #[tokio::test]
    async fn failed_items_keep_domain_key_and_revision() {
        let store = LocalStore::in_memory().await;
        let item = item(MutationKind::Occasion, json!({"id": "OCC_1", "v": 1}), 1);
        store.put(&item).await.unwrap();
        let newer = json!({"id": "OCC_1", "v": 2}).as_object().cloned().unwrap();
        store.replace_payload(&item.id, &newer).await.unwrap();
        store.archive_failed(&item.id, 1, 5, "rejected").await.unwrap();

        let failed = store.get_failed(&item.id).await.unwrap().unwrap();
        assert_eq!(failed.domain_key.as_deref(), Some("OCC_1"));
        assert_eq!(failed.revision, 1);

        let fetched = store.get(&item.id).await.unwrap().unwrap();
        assert_eq!(fetched.domain_key.as_deref(), Some("OCC_1"));
        assert_eq!(fetched.revision, 1);
    }

    #[tokio::test]
    async fn requeue_failed_moves_item_back_atomically() {
        let store = LocalStore::in_memory().await;
        let item = item(MutationKind::Occasion, json!({"id": "OCC_1", "date": ""}), 1);
        store.put(&item).await.unwrap();
        store.archive_failed(&item.id, 1, 5, "date is required").await.unwrap();

        let Requeue::Queued(requeued) = store.requeue_failed(&item.id, 50).await.unwrap() else {
            panic!("expected the failed item to be queued again");
        };
        assert_ne!(requeued.id, item.id);
        assert_eq!(requeued.created_at, 50);
        assert_eq!(requeued.domain_key.as_deref(), Some("OCC_1"));
        assert_eq!(requeued.payload, item.payload);

        assert!(store.get_failed(&item.id).await.unwrap().is_none());
        assert_eq!(store.list_pending().await.unwrap(), vec![requeued]);
        assert_eq!(
            store.requeue_failed(&item.id, 60).await.unwrap(),
            Requeue::NotFound
        );
    }

    #[tokio::test]
    async fn requeue_failed_leaves_newer_pending_edit_alone() {
        let store = LocalStore::in_memory().await;
        let stale = item(MutationKind::Occasion, json!({"id": "OCC_1", "v": 1}), 1);
        store.put(&stale).await.unwrap();
        store.archive_failed(&stale.id, 1, 5, "rejected").await.unwrap();
        let newer = item(MutationKind::Occasion, json!({"id": "OCC_1", "v": 3}), 10);
        store.put(&newer).await.unwrap();

        assert_eq!(
            store.requeue_failed(&stale.id, 20).await.unwrap(),
            Requeue::Superseded {
                pending_id: newer.id.clone()
            }
        );
        assert_eq!(store.list_pending().await.unwrap(), vec![newer]);
        assert!(store.get_failed(&stale.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn next_due_at_tracks_earliest_pending_item() {
        let store = LocalStore::in_memory().await;
        assert_eq!(store.next_due_at().await.unwrap(), None);

        let mut later = item(MutationKind::Games, json!({"occasionId": "1"}), 1);
        later.next_attempt_at = Some(900);
        let mut sooner = item(MutationKind::Games, json!({"occasionId": "2"}), 2);
        sooner.next_attempt_at = Some(400);
        store.put(&later).await.unwrap();
        store.put(&sooner).await.unwrap();
        assert_eq!(store.next_due_at().await.unwrap(), Some(400));

        let fresh = item(MutationKind::Games, json!({"occasionId": "3"}), 3);
        store.put(&fresh).await.unwrap();
        assert_eq!(store.next_due_at().await.unwrap(), Some(0));

        store.mark_synced(&fresh.id, 0, 1, 5).await.unwrap();
        assert_eq!(store.next_due_at().await.unwrap(), Some(400));
    }

    #[tokio::test]
    async fn drain_lease_has_a_single_holder_until_it_expires() {
        let store = LocalStore::in_memory().await;

        assert!(store.acquire_drain_lease("a", 100, 200).await.unwrap());
        assert!(!store.acquire_drain_lease("b", 150, 250).await.unwrap());
        assert!(store.acquire_drain_lease("a", 150, 250).await.unwrap());

        assert!(store.renew_drain_lease("a", 400).await.unwrap());
        assert!(!store.renew_drain_lease("b", 400).await.unwrap());
        assert!(!store.acquire_drain_lease("b", 300, 500).await.unwrap());

        assert!(store.acquire_drain_lease("b", 400, 600).await.unwrap());
        assert!(!store.renew_drain_lease("a", 700).await.unwrap());

        store.release_drain_lease("a").await.unwrap();
        assert!(!store.acquire_drain_lease("c", 450, 650).await.unwrap());
        store.release_drain_lease("b").await.unwrap();
        assert!(store.acquire_drain_lease("c", 450, 650).await.unwrap());
    }

    #[tokio::test]
    async fn drain_lease_is_shared_by_stores_on_one_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("queue.db");
        let first = LocalStore::open(&path).await.unwrap();
        let second = LocalStore::open(&path).await.unwrap();

        assert!(first.acquire_drain_lease("daemon", 100, 1_000).await.unwrap());
        assert!(!second.acquire_drain_lease("cli", 200, 1_100).await.unwrap());
        first.release_drain_lease("daemon").await.unwrap();
        assert!(second.acquire_drain_lease("cli", 300, 1_200).await.unwrap());
    }
}
