//! Leases due pending events and drives each through resolve → apply →
//! classify. Runs as a single task; ordering and cooldown state are owned
//! here, not shared with the Ingestor.

mod cooldown;

pub use cooldown::{CooldownSet, DEFAULT_COOLDOWN};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::RelayError;
use crate::node_client::{NodeClient, UserItemData, UserItemPatch};
use crate::policy::PolicyEngine;
use crate::resolver::{IdentityResolver, ResolveError};
use crate::store::Store;
use crate::time::Clock;
use crate::types::{EventPayload, ItemDescriptor, PendingEvent, SyncEventType, SyncOutcome};

const DEFAULT_MAX_RETRIES: u32 = 5;
const DEFAULT_BATCH_LIMIT: i64 = 20;

#[derive(Clone, Debug)]
pub struct WorkerConfig {
    pub max_retries: u32,
    pub batch_limit: i64,
    pub tick_interval: StdDuration,
    pub cooldown_window: StdDuration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            batch_limit: DEFAULT_BATCH_LIMIT,
            tick_interval: StdDuration::from_secs(2),
            cooldown_window: DEFAULT_COOLDOWN,
        }
    }
}

pub struct Worker {
    store: Arc<dyn Store>,
    nodes: HashMap<String, Arc<dyn NodeClient>>,
    resolver: IdentityResolver,
    policy: PolicyEngine,
    cooldown: CooldownSet,
    clock: Arc<dyn Clock>,
    config: WorkerConfig,
}

impl Worker {
    pub fn new(
        store: Arc<dyn Store>,
        nodes: HashMap<String, Arc<dyn NodeClient>>,
        resolver: IdentityResolver,
        policy: PolicyEngine,
        clock: Arc<dyn Clock>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            store,
            cooldown: CooldownSet::new(config.cooldown_window),
            nodes,
            resolver,
            policy,
            clock,
            config,
        }
    }

    /// Drives the tick loop until `cancel` fires. A 10s drain budget lets
    /// the in-flight batch finish finalizing before the task returns.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.tick_interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("worker received shutdown signal, draining in-flight batch");
                    if let Err(err) = tokio::time::timeout(StdDuration::from_secs(10), self.run_once()).await {
                        warn!(%err, "worker drain exceeded 10s budget");
                    }
                    break;
                }
                _ = interval.tick() => {
                    if let Err(err) = self.run_once().await {
                        error!(%err, "worker tick failed");
                    }
                }
            }
        }
        info!("worker stopped");
    }

    /// Leases whatever is due right now and processes it to completion.
    /// Returns the number of events processed, for tests that want to
    /// drive the worker deterministically instead of waiting on a tick.
    pub async fn run_once(&self) -> Result<usize, RelayError> {
        let now = self.clock.now_utc();
        let leases = self.store.lease_due(self.config.batch_limit, now).await?;
        let n = leases.len();
        for lease in leases {
            let outcome = self.process(&lease.event).await;
            let finalize_now = self.clock.now_utc();
            self.store.finalize(&lease, outcome, finalize_now).await?;
        }
        Ok(n)
    }

    async fn process(&self, event: &PendingEvent) -> SyncOutcome {
        // Keyed by (source_node, source_user_id) against what record_apply
        // wrote as (target_node, target_user_id) on a prior pass: a node we
        // just wrote to, reporting the same field back shortly after, is
        // presumed to be its own webhook echoing our write rather than an
        // independent change. This catches the echo at the source regardless
        // of which node it's now fanning out toward.
        if self.cooldown.is_cooling_down(
            &event.source_node,
            &event.dedup_key.source_user_id,
            &event.dedup_key.item_key,
            event.event_type,
            self.clock.monotonic_now(),
        ) {
            debug!(event_id = event.id, "suppressed as self-echo");
            return SyncOutcome::Skipped {
                reason: "self-echo suppressed by cooldown".to_string(),
            };
        }

        if event.event_type.is_user_lifecycle() {
            return self.process_user_lifecycle(event).await;
        }
        if event.event_type == SyncEventType::PlaylistChange {
            return self.process_playlist_change(event).await;
        }
        self.process_field_sync(event).await
    }

    fn client(&self, node_name: &str) -> Option<Arc<dyn NodeClient>> {
        self.nodes.get(node_name).cloned()
    }

    fn retry_or_fail(&self, attempts: u32, reason: String) -> SyncOutcome {
        let attempts_after = attempts + 1;
        if attempts_after > self.config.max_retries {
            SyncOutcome::Failed { reason }
        } else {
            SyncOutcome::Retry {
                delay: backoff_delay(attempts_after),
                reason,
            }
        }
    }

    fn classify_node_error(&self, err: crate::error::NodeError, attempts: u32) -> SyncOutcome {
        use crate::error::NodeError;
        match err {
            NodeError::Transient(reason) => self.retry_or_fail(attempts, reason),
            NodeError::Unauthorized => SyncOutcome::Failed {
                reason: "node rejected credentials".to_string(),
            },
            NodeError::Permanent(reason) => SyncOutcome::Failed { reason },
            NodeError::NotFound { kind } => SyncOutcome::Failed {
                reason: format!("{kind} not found on target"),
            },
        }
    }

    async fn process_user_lifecycle(&self, event: &PendingEvent) -> SyncOutcome {
        let Some(target) = self.client(&event.target_node) else {
            return unconfigured_target(&event.target_node);
        };

        match event.event_type {
            SyncEventType::UserCreated => {
                match self.store.get_user_mapping(&event.payload.username, &event.target_node).await {
                    Ok(Some(_)) => {
                        return SyncOutcome::Skipped {
                            reason: "user already exists on target".to_string(),
                        };
                    }
                    Ok(None) => {}
                    Err(e) => return self.retry_or_fail(event.attempts, format!("store error: {e}")),
                }
                let password = event.payload.generated_password.as_deref();
                match target.create_user(&event.payload.username, password).await {
                    Ok(remote) => {
                        if let Err(e) = self
                            .store
                            .put_user_mapping(&event.payload.username, &event.target_node, &remote.remote_id)
                            .await
                        {
                            return self.retry_or_fail(event.attempts, format!("store error: {e}"));
                        }
                        SyncOutcome::Applied {
                            synced_value: format!("created user {}", event.payload.username),
                        }
                    }
                    Err(e) => self.classify_node_error(e, event.attempts),
                }
            }
            SyncEventType::UserDeleted => {
                let remote_id = match self.store.get_user_mapping(&event.payload.username, &event.target_node).await {
                    Ok(Some(id)) => id,
                    Ok(None) => {
                        return SyncOutcome::Skipped {
                            reason: "no mapped user on target".to_string(),
                        };
                    }
                    Err(e) => return self.retry_or_fail(event.attempts, format!("store error: {e}")),
                };
                match target.delete_user(&remote_id).await {
                    Ok(()) => {
                        if let Err(e) = self.store.invalidate_user(&event.payload.username).await {
                            return self.retry_or_fail(event.attempts, format!("store error: {e}"));
                        }
                        SyncOutcome::Applied {
                            synced_value: format!("deleted user {}", event.payload.username),
                        }
                    }
                    Err(e) => self.classify_node_error(e, event.attempts),
                }
            }
            _ => unreachable!("only lifecycle events reach process_user_lifecycle"),
        }
    }

    async fn process_playlist_change(&self, event: &PendingEvent) -> SyncOutcome {
        let Some(playlist) = &event.payload.playlist else {
            return SyncOutcome::Skipped {
                reason: "no playlist descriptor on intent".to_string(),
            };
        };
        let Some(target) = self.client(&event.target_node) else {
            return unconfigured_target(&event.target_node);
        };

        let target_user_id = match self
            .resolver
            .resolve_user_by_username(&event.payload.username, &event.target_node)
            .await
        {
            Ok(id) => id,
            Err(err) => return self.classify_resolve_error(err, event),
        };

        let mut resolved_items = Vec::with_capacity(playlist.item_keys.len());
        for item_key in &playlist.item_keys {
            let descriptor = ItemDescriptor {
                path: Some(item_key.clone()),
                providers: Default::default(),
            };
            match self.resolver.resolve_item(&descriptor, &event.target_node).await {
                Ok(id) => resolved_items.push(id),
                // Best effort: an item not yet present on the target is
                // dropped from this pass rather than blocking the whole
                // playlist sync; a later PlaylistChange will pick it up.
                Err(ResolveError::ItemAbsent { .. }) => continue,
                Err(err) => return self.classify_resolve_error(err, event),
            }
        }

        let existing = match target.list_playlists(&target_user_id).await {
            Ok(p) => p,
            Err(e) => return self.classify_node_error(e, event.attempts),
        };

        let result = if existing.iter().any(|p| p.name == playlist.name) {
            target.set_playlist_items(&target_user_id, &playlist.name, &resolved_items).await
        } else {
            target.create_playlist(&target_user_id, &playlist.name, &resolved_items).await
        };

        match result {
            Ok(()) => SyncOutcome::Applied {
                synced_value: format!("playlist {} ({} items)", playlist.name, resolved_items.len()),
            },
            Err(e) => self.classify_node_error(e, event.attempts),
        }
    }

    async fn process_field_sync(&self, event: &PendingEvent) -> SyncOutcome {
        let Some(target) = self.client(&event.target_node) else {
            return unconfigured_target(&event.target_node);
        };

        let target_user_id = match self
            .resolver
            .resolve_user_by_username(&event.payload.username, &event.target_node)
            .await
        {
            Ok(id) => id,
            Err(err) => return self.classify_resolve_error(err, event),
        };

        let target_item_id = match self.resolver.resolve_item(&event.payload.item, &event.target_node).await {
            Ok(id) => id,
            Err(ResolveError::ItemAbsent { path }) => {
                return self.handle_item_absent(event, path);
            }
            Err(err) => return self.classify_resolve_error(err, event),
        };

        let current = match target.get_user_item_data(&target_user_id, &target_item_id).await {
            Ok(data) => data,
            Err(e) => return self.classify_node_error(e, event.attempts),
        };

        if event.event_type == SyncEventType::Progress {
            if let Some(skip) = progress_skip_reason(&event.payload, &current) {
                return SyncOutcome::Skipped { reason: skip };
            }
        }

        let (patch, summary) = build_patch(&event.payload, &current);
        if patch_is_empty(&patch) {
            return SyncOutcome::Skipped {
                reason: "already in sync".to_string(),
            };
        }

        if let Err(e) = target.apply_user_item_data(&target_user_id, &target_item_id, patch).await {
            return self.classify_node_error(e, event.attempts);
        }

        self.cooldown.record_apply(
            &event.target_node,
            &target_user_id,
            &event.dedup_key.item_key,
            event.event_type,
            self.clock.monotonic_now(),
        );
        SyncOutcome::Applied { synced_value: summary }
    }

    fn classify_resolve_error(&self, err: ResolveError, event: &PendingEvent) -> SyncOutcome {
        match err {
            ResolveError::NoMatchingUser => SyncOutcome::Failed {
                reason: "no matching user on target node".to_string(),
            },
            ResolveError::ItemAbsent { path } => self.handle_item_absent(event, path),
            ResolveError::Node(e) => self.classify_node_error(e, event.attempts),
            ResolveError::Store(e) => self.retry_or_fail(event.attempts, format!("store error: {e}")),
        }
    }

    fn handle_item_absent(&self, event: &PendingEvent, path: Option<String>) -> SyncOutcome {
        let lookup_path = path.unwrap_or_default();
        let rule = self.policy.resolve(&lookup_path);
        let attempted = event.item_not_found_count + 1;
        if rule.is_unbounded() || attempted <= rule.max_attempts {
            SyncOutcome::WaitItem {
                delay: chrono::Duration::seconds(rule.delay_seconds as i64),
                max_attempts: rule.max_attempts,
            }
        } else {
            SyncOutcome::Failed {
                reason: format!("item never appeared on target: {lookup_path}"),
            }
        }
    }
}

fn unconfigured_target(target_node: &str) -> SyncOutcome {
    SyncOutcome::Failed {
        reason: format!("unconfigured target node {target_node}"),
    }
}

/// `min(60s * 2^(attempts-1), 600s)`.
fn backoff_delay(attempts_after: u32) -> chrono::Duration {
    let exponent = attempts_after.saturating_sub(1).min(10);
    let secs = 60u64.saturating_mul(1u64 << exponent).min(600);
    chrono::Duration::seconds(secs as i64)
}

/// 1 tick = 100ns, so 10 seconds of playback position is 10^8 ticks.
const PROGRESS_ALREADY_SET_TICKS: i64 = 100_000_000;

/// Read-target-state comparison for `Progress` events, evaluated before
/// the generic field diff: a small delta is noise from
/// concurrent playback reporting, and a target that has already played
/// further than the source (per its own `last_played_at`) should not be
/// clobbered by a stale source position.
fn progress_skip_reason(payload: &EventPayload, current: &UserItemData) -> Option<String> {
    let pos = payload.position_ticks.as_ref()?;
    if (current.position_ticks - pos.value).abs() < PROGRESS_ALREADY_SET_TICKS {
        return Some("already set".to_string());
    }
    if let Some(last_played_at) = current.last_played_at {
        if current.position_ticks > pos.value && last_played_at > pos.source_timestamp {
            return Some("target newer".to_string());
        }
    }
    None
}

/// Diffs the merged payload against the target's current state, applying
/// the monotone-progress boundary: a `position_ticks` update never moves
/// playback backward unless the source reports completed playback (a
/// completion can legitimately reset position for the next watch).
fn build_patch(payload: &EventPayload, current: &UserItemData) -> (UserItemPatch, String) {
    let mut patch = UserItemPatch::default();
    let mut parts = Vec::new();

    if let Some(played) = &payload.played {
        if played.value != current.played {
            patch.played = Some(played.value);
            parts.push(format!("played={}", played.value));
        }
    }
    if let Some(pos) = &payload.position_ticks {
        let monotone_ok = pos.value >= current.position_ticks || payload.played_to_completion;
        if monotone_ok && pos.value != current.position_ticks {
            patch.position_ticks = Some(pos.value);
            parts.push(format!("position_ticks={}", pos.value));
        }
    }
    if let Some(favorite) = &payload.favorite {
        if favorite.value != current.favorite {
            patch.favorite = Some(favorite.value);
            parts.push(format!("favorite={}", favorite.value));
        }
    }
    if let Some(rating) = &payload.rating {
        if Some(rating.value) != current.rating {
            patch.rating = Some(Some(rating.value));
            parts.push(format!("rating={}", rating.value));
        }
    }

    (patch, parts.join(","))
}

fn patch_is_empty(patch: &UserItemPatch) -> bool {
    patch.played.is_none()
        && patch.position_ticks.is_none()
        && patch.favorite.is_none()
        && patch.rating.is_none()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{InMemoryStore, ScriptedNodeClient};
    use crate::time::TestClock;
    use crate::types::{DedupKey, EventIntent, ItemDescriptor, TimestampedValue};
    use chrono::Utc;

    fn make_worker(nodes: HashMap<String, Arc<dyn NodeClient>>, store: Arc<dyn Store>) -> Worker {
        let resolver = IdentityResolver::new(store.clone(), nodes.clone());
        Worker::new(
            store,
            nodes,
            resolver,
            PolicyEngine::new(vec![]),
            Arc::new(TestClock::new()),
            WorkerConfig::default(),
        )
    }

    #[tokio::test]
    async fn applies_watched_event_end_to_end() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let target: Arc<dyn NodeClient> = Arc::new(
            ScriptedNodeClient::new("b")
                .with_users(vec![crate::node_client::RemoteUser {
                    remote_id: "u-b".to_string(),
                    username: "alice".to_string(),
                }])
                .with_item_by_path("/movies/a.mkv", Some("item-b")),
        );
        let mut nodes: HashMap<String, Arc<dyn NodeClient>> = HashMap::new();
        nodes.insert("b".to_string(), target.clone());
        store
            .put_user_mapping("alice", "a", "u-a")
            .await
            .unwrap();

        let intent = EventIntent {
            dedup_key: DedupKey {
                event_type: SyncEventType::Watched,
                source_node: "a".to_string(),
                source_user_id: "u-a".to_string(),
                item_key: "/movies/a.mkv".to_string(),
                target_node: "b".to_string(),
                debounce_bucket: None,
            },
            event_type: SyncEventType::Watched,
            source_node: "a".to_string(),
            target_node: "b".to_string(),
            payload: EventPayload {
                username: "alice".to_string(),
                item: ItemDescriptor {
                    path: Some("/movies/a.mkv".to_string()),
                    providers: Default::default(),
                },
                played: Some(TimestampedValue {
                    value: true,
                    source_timestamp: Utc::now(),
                }),
                played_to_completion: true,
                ..Default::default()
            },
        };
        store.enqueue(intent, Utc::now()).await.unwrap();

        let worker = make_worker(nodes, store.clone());
        let processed = worker.run_once().await.unwrap();
        assert_eq!(processed, 1);
        assert_eq!(store.queue_depth().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn progress_never_regresses_without_completion() {
        let current = UserItemData {
            played: false,
            position_ticks: 5_000,
            favorite: false,
            rating: None,
            last_played_at: None,
        };
        let payload = EventPayload {
            position_ticks: Some(TimestampedValue {
                value: 1_000,
                source_timestamp: Utc::now(),
            }),
            played_to_completion: false,
            ..Default::default()
        };
        let (patch, _) = build_patch(&payload, &current);
        assert!(patch.position_ticks.is_none());
    }

    #[tokio::test]
    async fn completion_allows_position_reset() {
        let current = UserItemData {
            played: false,
            position_ticks: 5_000,
            favorite: false,
            rating: None,
            last_played_at: None,
        };
        let payload = EventPayload {
            position_ticks: Some(TimestampedValue {
                value: 0,
                source_timestamp: Utc::now(),
            }),
            played_to_completion: true,
            ..Default::default()
        };
        let (patch, _) = build_patch(&payload, &current);
        assert_eq!(patch.position_ticks, Some(0));
    }

    #[test]
    fn progress_within_ten_seconds_is_already_set() {
        let current = UserItemData {
            position_ticks: 6_000_000_000,
            ..Default::default()
        };
        let payload = EventPayload {
            position_ticks: Some(TimestampedValue {
                value: 6_000_000_000 + 50_000_000,
                source_timestamp: Utc::now(),
            }),
            ..Default::default()
        };
        assert_eq!(
            progress_skip_reason(&payload, &current),
            Some("already set".to_string())
        );
    }

    #[test]
    fn progress_target_newer_is_skipped() {
        let source_timestamp = Utc::now() - chrono::Duration::seconds(60);
        let current = UserItemData {
            position_ticks: 9_000_000_000,
            last_played_at: Some(Utc::now()),
            ..Default::default()
        };
        let payload = EventPayload {
            position_ticks: Some(TimestampedValue {
                value: 1_000_000_000,
                source_timestamp,
            }),
            ..Default::default()
        };
        assert_eq!(
            progress_skip_reason(&payload, &current),
            Some("target newer".to_string())
        );
    }

    #[test]
    fn backoff_caps_at_ten_minutes() {
        assert_eq!(backoff_delay(1), chrono::Duration::seconds(60));
        assert_eq!(backoff_delay(2), chrono::Duration::seconds(120));
        assert_eq!(backoff_delay(20), chrono::Duration::seconds(600));
    }
}
