//! Hand-rolled test doubles for `Store` and `NodeClient`, used by this
//! crate's integration tests and available to `relaysync-server`'s tests
//! behind the `test-support` feature.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{NodeError, StoreError};
use crate::node_client::{HealthStatus, NodeClient, RemotePlaylist, RemoteUser, UserItemData, UserItemPatch};
use crate::store::{Lease, Store, SyncLogFilters};
use crate::types::{
    EventIntent, EventState, ItemCacheEntry, ItemLookupKey, PendingEvent, SyncLogEntry, SyncOutcome,
};

#[derive(Default)]
struct InMemoryState {
    next_id: i64,
    pending: HashMap<i64, PendingEvent>,
    user_mappings: HashMap<(String, String), String>,
    item_cache: HashMap<(String, String), ItemCacheEntry>,
    sync_log: Vec<SyncLogEntry>,
}

/// A fully in-process `Store` used by unit/integration tests so they don't
/// need a real SQLite file. Mirrors `SqliteStore`'s externally-observable
/// behavior (coalesce, lease/finalize semantics) without touching disk.
#[derive(Default)]
pub struct InMemoryStore {
    state: Mutex<InMemoryState>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn enqueue(&self, intent: EventIntent, now: DateTime<Utc>) -> Result<i64, StoreError> {
        self.enqueue_batch(vec![intent], now).await.map(|ids| ids[0])
    }

    async fn enqueue_batch(
        &self,
        intents: Vec<EventIntent>,
        now: DateTime<Utc>,
    ) -> Result<Vec<i64>, StoreError> {
        let mut state = self.state.lock().expect("lock poisoned");
        let mut ids = Vec::with_capacity(intents.len());
        for intent in intents {
            let fingerprint = intent.dedup_key.fingerprint();
            let existing = state
                .pending
                .values_mut()
                .find(|e| e.dedup_key.fingerprint() == fingerprint);
            if let Some(existing) = existing {
                if existing.state != EventState::Processing {
                    existing.state = EventState::Pending;
                    existing.next_retry_at = now;
                }
                existing.payload.merge_newer(intent.payload);
                existing.updated_at = now;
                ids.push(existing.id);
                continue;
            }
            let id = state.next_id + 1;
            state.next_id = id;
            state.pending.insert(
                id,
                PendingEvent {
                    id,
                    dedup_key: intent.dedup_key,
                    event_type: intent.event_type,
                    source_node: intent.source_node,
                    target_node: intent.target_node,
                    payload: intent.payload,
                    state: EventState::Pending,
                    attempts: 0,
                    item_not_found_count: 0,
                    item_not_found_max: -2,
                    next_retry_at: now,
                    created_at: now,
                    updated_at: now,
                    last_error: None,
                },
            );
            ids.push(id);
        }
        Ok(ids)
    }

    async fn lease_due(&self, limit: i64, now: DateTime<Utc>) -> Result<Vec<Lease>, StoreError> {
        let mut state = self.state.lock().expect("lock poisoned");
        let mut due: Vec<i64> = state
            .pending
            .values()
            .filter(|e| {
                matches!(e.state, EventState::Pending | EventState::WaitingItem) && e.next_retry_at <= now
            })
            .map(|e| e.id)
            .collect();
        due.sort_unstable();
        due.truncate(limit.max(0) as usize);

        let mut leases = Vec::with_capacity(due.len());
        for id in due {
            let event = state.pending.get_mut(&id).expect("id from scan");
            event.state = EventState::Processing;
            event.updated_at = now;
            leases.push(Lease { event: event.clone() });
        }
        Ok(leases)
    }

    async fn finalize(
        &self,
        lease: &Lease,
        outcome: SyncOutcome,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().expect("lock poisoned");
        let id = lease.event.id;
        let coalesced_mid_flight = state
            .pending
            .get(&id)
            .map(|e| e.updated_at != lease.event.updated_at)
            .unwrap_or(false);

        let log_entry = |success: bool, synced_value: &str, message: Option<&str>| SyncLogEntry {
            id: 0,
            created_at: now,
            event_type: lease.event.event_type,
            source_node: lease.event.source_node.clone(),
            target_node: lease.event.target_node.clone(),
            username: lease.event.payload.username.clone(),
            item_name: lease.event.payload.item.path.clone().unwrap_or_default(),
            synced_value: synced_value.to_string(),
            success,
            message: message.map(str::to_string),
        };

        match outcome {
            SyncOutcome::Applied { synced_value } => {
                state.sync_log.push(log_entry(true, &synced_value, None));
                if coalesced_mid_flight {
                    if let Some(e) = state.pending.get_mut(&id) {
                        e.state = EventState::Pending;
                        e.next_retry_at = now;
                        e.updated_at = now;
                    }
                } else {
                    state.pending.remove(&id);
                }
            }
            SyncOutcome::Skipped { reason } => {
                state.sync_log.push(log_entry(true, &reason, None));
                if coalesced_mid_flight {
                    if let Some(e) = state.pending.get_mut(&id) {
                        e.state = EventState::Pending;
                        e.next_retry_at = now;
                        e.updated_at = now;
                    }
                } else {
                    state.pending.remove(&id);
                }
            }
            SyncOutcome::Failed { reason } => {
                state.sync_log.push(log_entry(false, "", Some(&reason)));
                state.pending.remove(&id);
            }
            SyncOutcome::Retry { delay, reason } => {
                if let Some(e) = state.pending.get_mut(&id) {
                    e.state = EventState::Pending;
                    e.attempts += 1;
                    e.next_retry_at = now + delay;
                    e.updated_at = now;
                    e.last_error = Some(reason);
                }
            }
            SyncOutcome::WaitItem { delay, max_attempts } => {
                if let Some(e) = state.pending.get_mut(&id) {
                    e.state = EventState::WaitingItem;
                    e.item_not_found_count += 1;
                    e.item_not_found_max = max_attempts;
                    e.next_retry_at = now + delay;
                    e.updated_at = now;
                }
            }
        }
        Ok(())
    }

    async fn get_user_mapping(
        &self,
        username: &str,
        node_name: &str,
    ) -> Result<Option<String>, StoreError> {
        let state = self.state.lock().expect("lock poisoned");
        Ok(state
            .user_mappings
            .get(&(username.to_lowercase(), node_name.to_string()))
            .cloned())
    }

    async fn put_user_mapping(
        &self,
        username: &str,
        node_name: &str,
        remote_user_id: &str,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().expect("lock poisoned");
        state
            .user_mappings
            .insert((username.to_lowercase(), node_name.to_string()), remote_user_id.to_string());
        Ok(())
    }

    async fn invalidate_user(&self, username: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock().expect("lock poisoned");
        let key = username.to_lowercase();
        state.user_mappings.retain(|(u, _), _| u != &key);
        Ok(())
    }

    async fn find_username_by_remote_id(
        &self,
        node_name: &str,
        remote_user_id: &str,
    ) -> Result<Option<String>, StoreError> {
        let state = self.state.lock().expect("lock poisoned");
        Ok(state
            .user_mappings
            .iter()
            .find(|((_, node), id)| node == node_name && id.as_str() == remote_user_id)
            .map(|((username, _), _)| username.clone()))
    }

    async fn get_item_cache(
        &self,
        node_name: &str,
        key: &ItemLookupKey,
    ) -> Result<Option<ItemCacheEntry>, StoreError> {
        let state = self.state.lock().expect("lock poisoned");
        Ok(state
            .item_cache
            .get(&(node_name.to_string(), key.as_db_str()))
            .cloned())
    }

    async fn put_item_cache(&self, entry: ItemCacheEntry) -> Result<(), StoreError> {
        let mut state = self.state.lock().expect("lock poisoned");
        let key = (entry.node_name.clone(), entry.lookup_key.as_db_str());
        state.item_cache.insert(key, entry);
        Ok(())
    }

    async fn invalidate_item(&self, node_name: &str, key: &ItemLookupKey) -> Result<(), StoreError> {
        let mut state = self.state.lock().expect("lock poisoned");
        state.item_cache.remove(&(node_name.to_string(), key.as_db_str()));
        Ok(())
    }

    async fn query_sync_log(
        &self,
        filters: SyncLogFilters,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<SyncLogEntry>, StoreError> {
        let state = self.state.lock().expect("lock poisoned");
        let mut rows: Vec<SyncLogEntry> = state
            .sync_log
            .iter()
            .rev()
            .filter(|e| filters.source_node.as_deref().is_none_or(|n| n == e.source_node))
            .filter(|e| filters.target_node.as_deref().is_none_or(|n| n == e.target_node))
            .filter(|e| filters.success.is_none_or(|s| s == e.success))
            .cloned()
            .collect();
        let offset = offset.max(0) as usize;
        if offset < rows.len() {
            rows = rows.split_off(offset);
        } else {
            rows.clear();
        }
        rows.truncate(limit.max(0) as usize);
        Ok(rows)
    }

    async fn list_pending(&self, state_filter: Option<&str>) -> Result<Vec<PendingEvent>, StoreError> {
        let state = self.state.lock().expect("lock poisoned");
        let mut rows: Vec<PendingEvent> = state
            .pending
            .values()
            .filter(|e| state_filter.is_none_or(|s| e.state.as_db_str() == s))
            .cloned()
            .collect();
        rows.sort_by_key(|e| e.next_retry_at);
        Ok(rows)
    }

    async fn queue_depth(&self) -> Result<i64, StoreError> {
        let state = self.state.lock().expect("lock poisoned");
        Ok(state.pending.len() as i64)
    }

    async fn reap_orphans(&self) -> Result<u64, StoreError> {
        let mut state = self.state.lock().expect("lock poisoned");
        let mut reaped = 0u64;
        for event in state.pending.values_mut() {
            if event.state == EventState::Processing {
                event.state = EventState::Pending;
                reaped += 1;
            }
        }
        Ok(reaped)
    }
}

/// Scripted responses for one node, consumed in call order by each method.
/// Exhausting the script for a method returns `NodeError::Permanent`, which
/// surfaces quickly in test failures instead of hanging.
#[derive(Default)]
pub struct ScriptedNodeClient {
    name: String,
    users: Mutex<Vec<RemoteUser>>,
    items_by_path: Mutex<HashMap<String, Option<String>>>,
    items_by_provider: Mutex<HashMap<(String, String), Option<String>>>,
    user_item_data: Mutex<HashMap<(String, String), UserItemData>>,
    applied_patches: Mutex<Vec<(String, String, UserItemPatch)>>,
    playlists: Mutex<HashMap<String, Vec<RemotePlaylist>>>,
    health: Mutex<HealthStatus>,
}

impl ScriptedNodeClient {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            health: Mutex::new(HealthStatus {
                reachable: true,
                version: None,
            }),
            ..Default::default()
        }
    }

    pub fn with_users(self, users: Vec<RemoteUser>) -> Self {
        *self.users.lock().expect("lock poisoned") = users;
        self
    }

    pub fn with_item_by_path(self, path: &str, remote_id: Option<&str>) -> Self {
        self.items_by_path
            .lock()
            .expect("lock poisoned")
            .insert(path.to_string(), remote_id.map(str::to_string));
        self
    }

    pub fn with_item_by_provider(self, provider: &str, value: &str, remote_id: Option<&str>) -> Self {
        self.items_by_provider
            .lock()
            .expect("lock poisoned")
            .insert((provider.to_string(), value.to_string()), remote_id.map(str::to_string));
        self
    }

    pub fn with_user_item_data(self, user_id: &str, item_id: &str, data: UserItemData) -> Self {
        self.user_item_data
            .lock()
            .expect("lock poisoned")
            .insert((user_id.to_string(), item_id.to_string()), data);
        self
    }

    pub fn applied_patches(&self) -> Vec<(String, String, UserItemPatch)> {
        self.applied_patches.lock().expect("lock poisoned").clone()
    }
}

#[async_trait]
impl NodeClient for ScriptedNodeClient {
    fn node_name(&self) -> &str {
        &self.name
    }

    async fn health(&self) -> HealthStatus {
        *self.health.lock().expect("lock poisoned")
    }

    async fn list_users(&self) -> Result<Vec<RemoteUser>, NodeError> {
        Ok(self.users.lock().expect("lock poisoned").clone())
    }

    async fn find_item_by_path(&self, path: &str) -> Result<Option<String>, NodeError> {
        Ok(self
            .items_by_path
            .lock()
            .expect("lock poisoned")
            .get(path)
            .cloned()
            .flatten())
    }

    async fn find_item_by_provider(
        &self,
        provider: &str,
        value: &str,
    ) -> Result<Option<String>, NodeError> {
        Ok(self
            .items_by_provider
            .lock()
            .expect("lock poisoned")
            .get(&(provider.to_string(), value.to_string()))
            .cloned()
            .flatten())
    }

    async fn get_user_item_data(
        &self,
        user_id: &str,
        item_id: &str,
    ) -> Result<UserItemData, NodeError> {
        Ok(self
            .user_item_data
            .lock()
            .expect("lock poisoned")
            .get(&(user_id.to_string(), item_id.to_string()))
            .cloned()
            .unwrap_or_default())
    }

    async fn apply_user_item_data(
        &self,
        user_id: &str,
        item_id: &str,
        patch: UserItemPatch,
    ) -> Result<(), NodeError> {
        self.applied_patches
            .lock()
            .expect("lock poisoned")
            .push((user_id.to_string(), item_id.to_string(), patch.clone()));
        let mut data = self.user_item_data.lock().expect("lock poisoned");
        let entry = data
            .entry((user_id.to_string(), item_id.to_string()))
            .or_default();
        if let Some(played) = patch.played {
            entry.played = played;
        }
        if let Some(position_ticks) = patch.position_ticks {
            entry.position_ticks = position_ticks;
        }
        if let Some(favorite) = patch.favorite {
            entry.favorite = favorite;
        }
        if let Some(rating) = patch.rating {
            entry.rating = rating;
        }
        Ok(())
    }

    async fn mark_played(
        &self,
        user_id: &str,
        item_id: &str,
        at_time: DateTime<Utc>,
    ) -> Result<(), NodeError> {
        self.apply_user_item_data(
            user_id,
            item_id,
            UserItemPatch {
                played: Some(true),
                ..Default::default()
            },
        )
        .await?;
        let mut data = self.user_item_data.lock().expect("lock poisoned");
        data.entry((user_id.to_string(), item_id.to_string()))
            .or_default()
            .last_played_at = Some(at_time);
        Ok(())
    }

    async fn mark_unplayed(&self, user_id: &str, item_id: &str) -> Result<(), NodeError> {
        self.apply_user_item_data(
            user_id,
            item_id,
            UserItemPatch {
                played: Some(false),
                ..Default::default()
            },
        )
        .await
    }

    async fn set_favorite(&self, user_id: &str, item_id: &str, value: bool) -> Result<(), NodeError> {
        self.apply_user_item_data(
            user_id,
            item_id,
            UserItemPatch {
                favorite: Some(value),
                ..Default::default()
            },
        )
        .await
    }

    async fn set_rating(
        &self,
        user_id: &str,
        item_id: &str,
        value: Option<f32>,
    ) -> Result<(), NodeError> {
        self.apply_user_item_data(
            user_id,
            item_id,
            UserItemPatch {
                rating: Some(value),
                ..Default::default()
            },
        )
        .await
    }

    async fn set_progress(
        &self,
        user_id: &str,
        item_id: &str,
        position_ticks: i64,
    ) -> Result<(), NodeError> {
        self.apply_user_item_data(
            user_id,
            item_id,
            UserItemPatch {
                position_ticks: Some(position_ticks),
                ..Default::default()
            },
        )
        .await
    }

    async fn create_user(
        &self,
        username: &str,
        _password: Option<&str>,
    ) -> Result<RemoteUser, NodeError> {
        let user = RemoteUser {
            remote_id: format!("generated-{username}"),
            username: username.to_string(),
        };
        self.users.lock().expect("lock poisoned").push(user.clone());
        Ok(user)
    }

    async fn delete_user(&self, remote_id: &str) -> Result<(), NodeError> {
        self.users
            .lock()
            .expect("lock poisoned")
            .retain(|u| u.remote_id != remote_id);
        Ok(())
    }

    async fn list_playlists(&self, user_id: &str) -> Result<Vec<RemotePlaylist>, NodeError> {
        Ok(self
            .playlists
            .lock()
            .expect("lock poisoned")
            .get(user_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn create_playlist(
        &self,
        user_id: &str,
        name: &str,
        item_ids: &[String],
    ) -> Result<(), NodeError> {
        self.playlists
            .lock()
            .expect("lock poisoned")
            .entry(user_id.to_string())
            .or_default()
            .push(RemotePlaylist {
                name: name.to_string(),
                item_ids: item_ids.to_vec(),
            });
        Ok(())
    }

    async fn set_playlist_items(
        &self,
        user_id: &str,
        playlist_name: &str,
        item_ids: &[String],
    ) -> Result<(), NodeError> {
        let mut playlists = self.playlists.lock().expect("lock poisoned");
        let list = playlists.entry(user_id.to_string()).or_default();
        match list.iter_mut().find(|p| p.name == playlist_name) {
            Some(p) => p.item_ids = item_ids.to_vec(),
            None => list.push(RemotePlaylist {
                name: playlist_name.to_string(),
                item_ids: item_ids.to_vec(),
            }),
        }
        Ok(())
    }
}
