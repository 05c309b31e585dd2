use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One of the notification kinds a node webhook can carry, normalized from
/// the raw `NotificationType` string.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum SyncEventType {
    Progress,
    Watched,
    Favorite,
    Rating,
    UserCreated,
    UserDeleted,
    PlaylistChange,
}

impl SyncEventType {
    /// User-lifecycle events bypass item resolution and always fan out to
    /// every other configured node.
    pub fn is_user_lifecycle(&self) -> bool {
        matches!(self, SyncEventType::UserCreated | SyncEventType::UserDeleted)
    }
}

impl std::fmt::Display for SyncEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SyncEventType::Progress => "progress",
            SyncEventType::Watched => "watched",
            SyncEventType::Favorite => "favorite",
            SyncEventType::Rating => "rating",
            SyncEventType::UserCreated => "user_created",
            SyncEventType::UserDeleted => "user_deleted",
            SyncEventType::PlaylistChange => "playlist_change",
        };
        write!(f, "{s}")
    }
}

/// Provider identifiers a media item may be known by on a node.
#[derive(Clone, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct ProviderIds {
    pub imdb: Option<String>,
    pub tmdb: Option<String>,
    pub tvdb: Option<String>,
}

impl ProviderIds {
    /// Resolution order: imdb, then tmdb, then tvdb.
    pub fn in_resolution_order(&self) -> Vec<(&'static str, &str)> {
        let mut out = Vec::with_capacity(3);
        if let Some(v) = &self.imdb {
            out.push(("imdb", v.as_str()));
        }
        if let Some(v) = &self.tmdb {
            out.push(("tmdb", v.as_str()));
        }
        if let Some(v) = &self.tvdb {
            out.push(("tvdb", v.as_str()));
        }
        out
    }

    pub fn is_empty(&self) -> bool {
        self.imdb.is_none() && self.tmdb.is_none() && self.tvdb.is_none()
    }
}

/// Identifies a media item independent of any node's internal id: a
/// filesystem path and/or a set of external provider ids.
#[derive(Clone, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct ItemDescriptor {
    pub path: Option<String>,
    #[serde(default)]
    pub providers: ProviderIds,
}

impl ItemDescriptor {
    /// Stable string used as part of the dedup key / item-cache lookup key
    /// when a path is present; falls back to a provider fingerprint.
    pub fn lookup_key(&self) -> String {
        if let Some(path) = &self.path {
            normalize_path(path)
        } else {
            let ids = self.providers.in_resolution_order();
            ids.iter()
                .map(|(k, v)| format!("{k}:{v}"))
                .collect::<Vec<_>>()
                .join(",")
        }
    }
}

/// Normalizes a filesystem path for cross-platform, cross-mount comparison:
/// lowercases nothing (paths are case-sensitive on the nodes we replicate
/// against), but collapses repeated separators and trims a trailing slash.
pub fn normalize_path(path: &str) -> String {
    let collapsed: String = path
        .replace('\\', "/")
        .split('/')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("/");
    format!("/{collapsed}")
}

/// A single field value carried in a pending event's payload, tagged with
/// the timestamp the source node reported for it so last-write-wins
/// comparisons have something to compare against.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TimestampedValue<T> {
    pub value: T,
    pub source_timestamp: DateTime<Utc>,
}

/// Normalized snapshot of one webhook notification, sufficient to apply the
/// change on a target node. Field presence mirrors which fields the
/// notification actually carried.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct EventPayload {
    pub username: String,
    pub item: ItemDescriptor,
    pub played: Option<TimestampedValue<bool>>,
    pub position_ticks: Option<TimestampedValue<i64>>,
    pub favorite: Option<TimestampedValue<bool>>,
    pub rating: Option<TimestampedValue<f32>>,
    pub played_to_completion: bool,
    /// Only populated for `PlaylistChange` intents.
    pub playlist: Option<PlaylistDescriptor>,
    /// Carried on UserCreated/UserDeleted fan-out so the worker doesn't need
    /// to re-derive it.
    pub generated_password: Option<String>,
}

impl EventPayload {
    /// Merge `newer` into `self` per field-level last-write-wins, used by
    /// the Store's coalesce rule.
    pub fn merge_newer(&mut self, newer: EventPayload) {
        self.username = newer.username;
        self.item = newer.item;
        merge_field(&mut self.played, newer.played);
        merge_field(&mut self.position_ticks, newer.position_ticks);
        merge_field(&mut self.favorite, newer.favorite);
        merge_field(&mut self.rating, newer.rating);
        self.played_to_completion = self.played_to_completion || newer.played_to_completion;
        if newer.playlist.is_some() {
            self.playlist = newer.playlist;
        }
        if newer.generated_password.is_some() {
            self.generated_password = newer.generated_password;
        }
    }
}

fn merge_field<T>(slot: &mut Option<TimestampedValue<T>>, newer: Option<TimestampedValue<T>>) {
    match (slot.as_ref(), &newer) {
        (Some(cur), Some(new)) if new.source_timestamp < cur.source_timestamp => {}
        (_, Some(_)) => *slot = newer,
        _ => {}
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PlaylistDescriptor {
    pub name: String,
    pub item_keys: Vec<String>,
}

/// Lifecycle state of a [`PendingEvent`] row.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventState {
    Pending,
    Processing,
    WaitingItem,
    Failed,
}

impl EventState {
    pub fn as_db_str(&self) -> &'static str {
        match self {
            EventState::Pending => "pending",
            EventState::Processing => "processing",
            EventState::WaitingItem => "waiting_item",
            EventState::Failed => "failed",
        }
    }

    pub fn from_db_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(EventState::Pending),
            "processing" => Some(EventState::Processing),
            "waiting_item" => Some(EventState::WaitingItem),
            "failed" => Some(EventState::Failed),
            _ => None,
        }
    }
}

/// The fingerprint that makes the pending log idempotent under repeated
/// ingest.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct DedupKey {
    pub event_type: SyncEventType,
    pub source_node: String,
    pub source_user_id: String,
    pub item_key: String,
    pub target_node: String,
    /// Progress events additionally bucket by debounce window.
    pub debounce_bucket: Option<i64>,
}

impl DedupKey {
    /// Canonical string form stored as the DB unique key.
    pub fn fingerprint(&self) -> String {
        let mut parts = BTreeMap::new();
        parts.insert("type", self.event_type.to_string());
        parts.insert("src", self.source_node.clone());
        parts.insert("user", self.source_user_id.clone());
        parts.insert("item", self.item_key.clone());
        parts.insert("tgt", self.target_node.clone());
        let mut s = parts
            .into_iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("|");
        if let Some(bucket) = self.debounce_bucket {
            s.push_str(&format!("|bucket={bucket}"));
        }
        s
    }
}

/// The central pending-event record: one row per in-flight or completed
/// sync intent.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PendingEvent {
    pub id: i64,
    pub dedup_key: DedupKey,
    pub event_type: SyncEventType,
    pub source_node: String,
    pub target_node: String,
    pub payload: EventPayload,
    pub state: EventState,
    pub attempts: u32,
    pub item_not_found_count: i32,
    pub item_not_found_max: i32,
    pub next_retry_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

/// A new event intent produced by the Ingestor before it has been assigned
/// a row id.
#[derive(Clone, Debug)]
pub struct EventIntent {
    pub dedup_key: DedupKey,
    pub event_type: SyncEventType,
    pub source_node: String,
    pub target_node: String,
    pub payload: EventPayload,
}

/// Outcome of one worker pipeline pass over a leased event, consumed by
/// `Store::finalize`.
#[derive(Clone, Debug)]
pub enum SyncOutcome {
    Applied { synced_value: String },
    Skipped { reason: String },
    Retry { delay: chrono::Duration, reason: String },
    WaitItem { delay: chrono::Duration, max_attempts: i32 },
    Failed { reason: String },
}

/// Append-only observability record of one applied, skipped, or failed
/// sync attempt.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SyncLogEntry {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub event_type: SyncEventType,
    pub source_node: String,
    pub target_node: String,
    pub username: String,
    pub item_name: String,
    pub synced_value: String,
    pub success: bool,
    pub message: Option<String>,
}
