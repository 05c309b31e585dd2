//! Durable persistence for pending events, mappings, caches, and the sync
//! log. One logical writer; concurrent readers never block it beyond a
//! read snapshot.

mod sqlite;

pub use sqlite::SqliteStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StoreError;
use crate::types::{EventIntent, ItemCacheEntry, ItemLookupKey, PendingEvent, SyncLogEntry, SyncOutcome};

/// A leased event handed to the worker, carrying the `updated_at` it was
/// leased with so `finalize` can detect whether the Ingestor coalesced a
/// newer payload into the same row while the worker was awaiting a Node
/// Client call (see `SqliteStore::finalize` for the race this guards).
#[derive(Clone, Debug)]
pub struct Lease {
    pub event: PendingEvent,
}

/// Optional filters for `query_sync_log`.
#[derive(Clone, Debug, Default)]
pub struct SyncLogFilters {
    pub source_node: Option<String>,
    pub target_node: Option<String>,
    pub success: Option<bool>,
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn enqueue(&self, intent: EventIntent, now: DateTime<Utc>) -> Result<i64, StoreError>;

    /// Enqueues every intent from one source notification in a single
    /// transaction — a fan-out to N-1 target nodes either lands as a whole
    /// or not at all.
    async fn enqueue_batch(
        &self,
        intents: Vec<EventIntent>,
        now: DateTime<Utc>,
    ) -> Result<Vec<i64>, StoreError>;

    async fn lease_due(&self, limit: i64, now: DateTime<Utc>) -> Result<Vec<Lease>, StoreError>;

    async fn finalize(
        &self,
        lease: &Lease,
        outcome: SyncOutcome,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn get_user_mapping(
        &self,
        username: &str,
        node_name: &str,
    ) -> Result<Option<String>, StoreError>;

    async fn put_user_mapping(
        &self,
        username: &str,
        node_name: &str,
        remote_user_id: &str,
    ) -> Result<(), StoreError>;

    async fn invalidate_user(&self, username: &str) -> Result<(), StoreError>;

    /// Reverse lookup used by the Resolver to translate a source node's
    /// remote user id back into a username before it can look the
    /// username up again on the target node.
    async fn find_username_by_remote_id(
        &self,
        node_name: &str,
        remote_user_id: &str,
    ) -> Result<Option<String>, StoreError>;

    async fn get_item_cache(
        &self,
        node_name: &str,
        key: &ItemLookupKey,
    ) -> Result<Option<ItemCacheEntry>, StoreError>;

    async fn put_item_cache(&self, entry: ItemCacheEntry) -> Result<(), StoreError>;

    async fn invalidate_item(&self, node_name: &str, key: &ItemLookupKey) -> Result<(), StoreError>;

    async fn query_sync_log(
        &self,
        filters: SyncLogFilters,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<SyncLogEntry>, StoreError>;

    async fn list_pending(&self, state_filter: Option<&str>) -> Result<Vec<PendingEvent>, StoreError>;

    async fn queue_depth(&self) -> Result<i64, StoreError>;

    /// Startup hook: any row left `processing` across a crash returns to
    /// `pending`. Returns the number of rows reaped.
    async fn reap_orphans(&self) -> Result<u64, StoreError>;
}
