use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{FromRow, SqlitePool};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::StoreError;
use crate::types::{
    DedupKey, EventIntent, EventPayload, EventState, ItemCacheEntry, ItemLookupKey, PendingEvent,
    SyncEventType, SyncLogEntry, SyncOutcome,
};

use super::{Lease, Store, SyncLogFilters};

/// `Store` backed by a single embedded SQLite file, opened with WAL
/// journaling so the dashboard and readiness probe can read concurrently
/// without blocking the writer.
///
/// All mutating operations take `writer` first. Enforcing a single
/// logical writer this way, rather than relying on SQLite's own locking,
/// lets `enqueue` and `lease_due`/`finalize` interleave predictably
/// instead of racing on `SQLITE_BUSY`.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
    writer: Arc<Mutex<()>>,
}

impl SqliteStore {
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(std::time::Duration::from_secs(5));
        Self::open_with(options).await
    }

    async fn open_with(options: SqliteConnectOptions) -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self {
            pool,
            writer: Arc::new(Mutex::new(())),
        })
    }

    #[cfg(any(test, feature = "test-support"))]
    pub async fn open_file(path: &Path) -> Result<Self, StoreError> {
        Self::open(path).await
    }
}

#[derive(FromRow)]
struct PendingEventRow {
    id: i64,
    event_type: String,
    source_node: String,
    source_user_id: String,
    item_key: String,
    target_node: String,
    debounce_bucket: Option<i64>,
    payload_json: String,
    state: String,
    attempts: i64,
    item_not_found_count: i64,
    item_not_found_max: i64,
    next_retry_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    last_error: Option<String>,
}

impl PendingEventRow {
    fn into_domain(self) -> Result<PendingEvent, StoreError> {
        let event_type = parse_event_type(&self.event_type)?;
        let state = EventState::from_db_str(&self.state)
            .ok_or_else(|| StoreError::Internal(format!("unknown state {}", self.state)))?;
        let payload: EventPayload = serde_json::from_str(&self.payload_json)?;
        Ok(PendingEvent {
            id: self.id,
            dedup_key: DedupKey {
                event_type,
                source_node: self.source_node.clone(),
                source_user_id: self.source_user_id,
                item_key: self.item_key,
                target_node: self.target_node.clone(),
                debounce_bucket: self.debounce_bucket,
            },
            event_type,
            source_node: self.source_node,
            target_node: self.target_node,
            payload,
            state,
            attempts: self.attempts as u32,
            item_not_found_count: self.item_not_found_count as i32,
            item_not_found_max: self.item_not_found_max as i32,
            next_retry_at: self.next_retry_at,
            created_at: self.created_at,
            updated_at: self.updated_at,
            last_error: self.last_error,
        })
    }
}

/// Shared body of `enqueue`/`enqueue_batch`, run against a transaction so a
/// multi-intent fan-out commits or rolls back as one unit.
async fn enqueue_one(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    intent: EventIntent,
    now: DateTime<Utc>,
) -> Result<i64, StoreError> {
    let fingerprint = intent.dedup_key.fingerprint();
    let payload_json = serde_json::to_string(&intent.payload)?;

    let existing = sqlx::query_as::<_, (i64, String, String)>(
        "SELECT id, state, payload_json FROM pending_events WHERE dedup_fingerprint = ?",
    )
    .bind(&fingerprint)
    .fetch_optional(&mut **tx)
    .await?;

    if let Some((id, state, existing_payload)) = existing {
        // Coalesce: pending/waiting_item rows are updated in place; a row
        // mid-flight (`processing`) is left alone here and instead
        // reconciled by `finalize`'s version check, since this writer lock
        // does not span the worker's Node Client call.
        let mut merged: EventPayload = serde_json::from_str(&existing_payload)?;
        merged.merge_newer(intent.payload);
        let merged_json = serde_json::to_string(&merged)?;

        if state == "processing" {
            sqlx::query("UPDATE pending_events SET payload_json = ?, updated_at = ? WHERE id = ?")
                .bind(&merged_json)
                .bind(now)
                .bind(id)
                .execute(&mut **tx)
                .await?;
        } else {
            sqlx::query(
                "UPDATE pending_events SET payload_json = ?, updated_at = ?, next_retry_at = ?, state = 'pending' WHERE id = ?",
            )
            .bind(&merged_json)
            .bind(now)
            .bind(now)
            .bind(id)
            .execute(&mut **tx)
            .await?;
        }
        debug!(event_id = id, %fingerprint, "coalesced pending event");
        return Ok(id);
    }

    let result = sqlx::query(
        r#"
        INSERT INTO pending_events (
            dedup_fingerprint, event_type, source_node, source_user_id, item_key,
            target_node, debounce_bucket, payload_json, state, attempts,
            item_not_found_count, item_not_found_max, next_retry_at, created_at, updated_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, 'pending', 0, 0, -2, ?, ?, ?)
        "#,
    )
    .bind(&fingerprint)
    .bind(intent.dedup_key.event_type.to_string())
    .bind(&intent.dedup_key.source_node)
    .bind(&intent.dedup_key.source_user_id)
    .bind(&intent.dedup_key.item_key)
    .bind(&intent.dedup_key.target_node)
    .bind(intent.dedup_key.debounce_bucket)
    .bind(&payload_json)
    .bind(now)
    .bind(now)
    .bind(now)
    .execute(&mut **tx)
    .await?;

    Ok(result.last_insert_rowid())
}

fn parse_event_type(s: &str) -> Result<SyncEventType, StoreError> {
    Ok(match s {
        "progress" => SyncEventType::Progress,
        "watched" => SyncEventType::Watched,
        "favorite" => SyncEventType::Favorite,
        "rating" => SyncEventType::Rating,
        "user_created" => SyncEventType::UserCreated,
        "user_deleted" => SyncEventType::UserDeleted,
        "playlist_change" => SyncEventType::PlaylistChange,
        other => return Err(StoreError::Internal(format!("unknown event_type {other}"))),
    })
}

#[async_trait]
impl Store for SqliteStore {
    async fn enqueue(&self, intent: EventIntent, now: DateTime<Utc>) -> Result<i64, StoreError> {
        let _guard = self.writer.lock().await;
        let mut tx = self.pool.begin().await?;
        let id = enqueue_one(&mut tx, intent, now).await?;
        tx.commit().await?;
        Ok(id)
    }

    async fn enqueue_batch(
        &self,
        intents: Vec<EventIntent>,
        now: DateTime<Utc>,
    ) -> Result<Vec<i64>, StoreError> {
        let _guard = self.writer.lock().await;
        let mut tx = self.pool.begin().await?;
        let mut ids = Vec::with_capacity(intents.len());
        for intent in intents {
            ids.push(enqueue_one(&mut tx, intent, now).await?);
        }
        tx.commit().await?;
        Ok(ids)
    }

    async fn lease_due(&self, limit: i64, now: DateTime<Utc>) -> Result<Vec<Lease>, StoreError> {
        let _guard = self.writer.lock().await;
        let rows = sqlx::query_as::<_, PendingEventRow>(
            r#"
            SELECT * FROM pending_events
            WHERE state IN ('pending', 'waiting_item') AND next_retry_at <= ?
            ORDER BY next_retry_at ASC
            LIMIT ?
            "#,
        )
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let mut leases = Vec::with_capacity(rows.len());
        for row in rows {
            let id = row.id;
            sqlx::query("UPDATE pending_events SET state = 'processing', updated_at = ? WHERE id = ?")
                .bind(now)
                .bind(id)
                .execute(&self.pool)
                .await?;
            let mut event = row.into_domain()?;
            event.state = EventState::Processing;
            event.updated_at = now;
            leases.push(Lease { event });
        }
        Ok(leases)
    }

    async fn finalize(
        &self,
        lease: &Lease,
        outcome: SyncOutcome,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let _guard = self.writer.lock().await;
        let id = lease.event.id;

        // Detect whether the Ingestor coalesced a newer payload into this
        // row while we were awaiting the Node Client — `lease_due` always
        // bumps `updated_at` to the lease time, so any mismatch here can
        // only be a coalesce that landed after the lease was taken (it
        // skips state transitions for `processing` rows, see `enqueue`).
        let current_updated_at: Option<DateTime<Utc>> =
            sqlx::query_scalar("SELECT updated_at FROM pending_events WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        let coalesced_mid_flight = match current_updated_at {
            Some(ts) => ts != lease.event.updated_at,
            None => false,
        };

        match outcome {
            SyncOutcome::Applied { synced_value } => {
                if coalesced_mid_flight {
                    // A fresher payload arrived; honor it by giving it
                    // another pass instead of discarding it as already
                    // applied.
                    self.append_sync_log_row(&lease.event, true, &synced_value, None, now).await?;
                    self.requeue_for_retry(id, now, chrono::Duration::zero()).await?;
                } else {
                    self.append_sync_log_row(&lease.event, true, &synced_value, None, now).await?;
                    self.delete_row(id).await?;
                }
            }
            SyncOutcome::Skipped { reason } => {
                self.append_sync_log_row(&lease.event, true, &reason, None, now).await?;
                if coalesced_mid_flight {
                    self.requeue_for_retry(id, now, chrono::Duration::zero()).await?;
                } else {
                    self.delete_row(id).await?;
                }
            }
            SyncOutcome::Failed { reason } => {
                self.append_sync_log_row(&lease.event, false, "", Some(&reason), now).await?;
                self.delete_row(id).await?;
            }
            SyncOutcome::Retry { delay, reason } => {
                let next_retry_at = now + delay;
                sqlx::query(
                    "UPDATE pending_events SET state = 'pending', attempts = attempts + 1, next_retry_at = ?, updated_at = ?, last_error = ? WHERE id = ?",
                )
                .bind(next_retry_at)
                .bind(now)
                .bind(&reason)
                .bind(id)
                .execute(&self.pool)
                .await?;
            }
            SyncOutcome::WaitItem { delay, max_attempts } => {
                let next_retry_at = now + delay;
                sqlx::query(
                    "UPDATE pending_events SET state = 'waiting_item', item_not_found_count = item_not_found_count + 1, item_not_found_max = ?, next_retry_at = ?, updated_at = ? WHERE id = ?",
                )
                .bind(max_attempts)
                .bind(next_retry_at)
                .bind(now)
                .bind(id)
                .execute(&self.pool)
                .await?;
            }
        }
        Ok(())
    }

    async fn get_user_mapping(
        &self,
        username: &str,
        node_name: &str,
    ) -> Result<Option<String>, StoreError> {
        let key = username.to_lowercase();
        let row: Option<(String,)> = sqlx::query_as(
            "SELECT remote_user_id FROM user_mappings WHERE username_key = ? AND node_name = ?",
        )
        .bind(&key)
        .bind(node_name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(id,)| id))
    }

    async fn put_user_mapping(
        &self,
        username: &str,
        node_name: &str,
        remote_user_id: &str,
    ) -> Result<(), StoreError> {
        let _guard = self.writer.lock().await;
        let key = username.to_lowercase();
        sqlx::query(
            r#"
            INSERT INTO user_mappings (username_key, node_name, username, remote_user_id)
            VALUES (?, ?, ?, ?)
            ON CONFLICT (username_key, node_name) DO UPDATE SET remote_user_id = excluded.remote_user_id
            "#,
        )
        .bind(&key)
        .bind(node_name)
        .bind(username)
        .bind(remote_user_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn invalidate_user(&self, username: &str) -> Result<(), StoreError> {
        let _guard = self.writer.lock().await;
        let key = username.to_lowercase();
        sqlx::query("DELETE FROM user_mappings WHERE username_key = ?")
            .bind(&key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn find_username_by_remote_id(
        &self,
        node_name: &str,
        remote_user_id: &str,
    ) -> Result<Option<String>, StoreError> {
        let row: Option<(String,)> = sqlx::query_as(
            "SELECT username FROM user_mappings WHERE node_name = ? AND remote_user_id = ?",
        )
        .bind(node_name)
        .bind(remote_user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(u,)| u))
    }

    async fn get_item_cache(
        &self,
        node_name: &str,
        key: &ItemLookupKey,
    ) -> Result<Option<ItemCacheEntry>, StoreError> {
        let lookup_key = key.as_db_str();
        let row: Option<(String, DateTime<Utc>)> = sqlx::query_as(
            "SELECT remote_item_id, fetched_at FROM item_cache WHERE node_name = ? AND lookup_key = ?",
        )
        .bind(node_name)
        .bind(&lookup_key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(remote_item_id, fetched_at)| ItemCacheEntry {
            node_name: node_name.to_string(),
            lookup_key: key.clone(),
            remote_item_id,
            fetched_at,
        }))
    }

    async fn put_item_cache(&self, entry: ItemCacheEntry) -> Result<(), StoreError> {
        let _guard = self.writer.lock().await;
        let lookup_key = entry.lookup_key.as_db_str();
        sqlx::query(
            r#"
            INSERT INTO item_cache (node_name, lookup_key, remote_item_id, fetched_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT (node_name, lookup_key) DO UPDATE SET
                remote_item_id = excluded.remote_item_id,
                fetched_at = excluded.fetched_at
            "#,
        )
        .bind(&entry.node_name)
        .bind(&lookup_key)
        .bind(&entry.remote_item_id)
        .bind(entry.fetched_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn invalidate_item(&self, node_name: &str, key: &ItemLookupKey) -> Result<(), StoreError> {
        let _guard = self.writer.lock().await;
        let lookup_key = key.as_db_str();
        sqlx::query("DELETE FROM item_cache WHERE node_name = ? AND lookup_key = ?")
            .bind(node_name)
            .bind(&lookup_key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn query_sync_log(
        &self,
        filters: SyncLogFilters,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<SyncLogEntry>, StoreError> {
        let mut query = String::from("SELECT * FROM sync_log WHERE 1=1");
        if filters.source_node.is_some() {
            query.push_str(" AND source_node = ?");
        }
        if filters.target_node.is_some() {
            query.push_str(" AND target_node = ?");
        }
        if filters.success.is_some() {
            query.push_str(" AND success = ?");
        }
        query.push_str(" ORDER BY created_at DESC LIMIT ? OFFSET ?");

        let mut builder = sqlx::query_as::<_, SyncLogRow>(&query);
        if let Some(source_node) = &filters.source_node {
            builder = builder.bind(source_node);
        }
        if let Some(target_node) = &filters.target_node {
            builder = builder.bind(target_node);
        }
        if let Some(success) = filters.success {
            builder = builder.bind(success);
        }
        let rows = builder.bind(limit).bind(offset).fetch_all(&self.pool).await?;
        rows.into_iter().map(|r| r.into_domain()).collect()
    }

    async fn list_pending(&self, state_filter: Option<&str>) -> Result<Vec<PendingEvent>, StoreError> {
        let rows = match state_filter {
            Some(state) => {
                sqlx::query_as::<_, PendingEventRow>(
                    "SELECT * FROM pending_events WHERE state = ? ORDER BY next_retry_at ASC",
                )
                .bind(state)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, PendingEventRow>(
                    "SELECT * FROM pending_events ORDER BY next_retry_at ASC",
                )
                .fetch_all(&self.pool)
                .await?
            }
        };
        rows.into_iter().map(|r| r.into_domain()).collect()
    }

    async fn queue_depth(&self) -> Result<i64, StoreError> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM pending_events")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    async fn reap_orphans(&self) -> Result<u64, StoreError> {
        let _guard = self.writer.lock().await;
        let result = sqlx::query(
            "UPDATE pending_events SET state = 'pending' WHERE state = 'processing'",
        )
        .execute(&self.pool)
        .await?;
        let reaped = result.rows_affected();
        if reaped > 0 {
            warn!(reaped, "reaped orphaned processing rows on startup");
        }
        Ok(reaped)
    }
}

#[derive(FromRow)]
struct SyncLogRow {
    id: i64,
    created_at: DateTime<Utc>,
    event_type: String,
    source_node: String,
    target_node: String,
    username: String,
    item_name: String,
    synced_value: String,
    success: bool,
    message: Option<String>,
}

impl SyncLogRow {
    fn into_domain(self) -> Result<SyncLogEntry, StoreError> {
        Ok(SyncLogEntry {
            id: self.id,
            created_at: self.created_at,
            event_type: parse_event_type(&self.event_type)?,
            source_node: self.source_node,
            target_node: self.target_node,
            username: self.username,
            item_name: self.item_name,
            synced_value: self.synced_value,
            success: self.success,
            message: self.message,
        })
    }
}

impl SqliteStore {
    async fn append_sync_log_row(
        &self,
        event: &PendingEvent,
        success: bool,
        synced_value: &str,
        message: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO sync_log (
                created_at, event_type, source_node, target_node, username, item_name,
                synced_value, success, message
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(now)
        .bind(event.event_type.to_string())
        .bind(&event.source_node)
        .bind(&event.target_node)
        .bind(&event.payload.username)
        .bind(event.payload.item.path.clone().unwrap_or_default())
        .bind(synced_value)
        .bind(success)
        .bind(message)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn requeue_for_retry(
        &self,
        id: i64,
        now: DateTime<Utc>,
        delay: chrono::Duration,
    ) -> Result<(), StoreError> {
        let next_retry_at = now + delay;
        sqlx::query(
            "UPDATE pending_events SET state = 'pending', next_retry_at = ?, updated_at = ? WHERE id = ?",
        )
        .bind(next_retry_at)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_row(&self, id: i64) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM pending_events WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
