//! Normalizes one inbound webhook notification into per-target-node
//! [`EventIntent`]s and enqueues them atomically.

use std::sync::Arc;

use base64::Engine;
use chrono::{DateTime, Utc};
use rand::RngCore;

use crate::error::{RelayError, Result};
use crate::store::Store;
use crate::types::{
    DedupKey, EventIntent, EventPayload, ItemDescriptor, PlaylistDescriptor, SyncEventType,
    TimestampedValue,
};

/// One normalized notification from a source node, already shorn of
/// transport-specific JSON shape — building this from the raw webhook body
/// is the HTTP layer's job.
#[derive(Clone, Debug)]
pub struct SourceEvent {
    pub event_type: SyncEventType,
    pub source_node: String,
    pub source_user_id: String,
    pub username: String,
    pub item: ItemDescriptor,
    pub played: Option<TimestampedValue<bool>>,
    pub position_ticks: Option<TimestampedValue<i64>>,
    pub favorite: Option<TimestampedValue<bool>>,
    pub rating: Option<TimestampedValue<f32>>,
    pub played_to_completion: bool,
    pub playlist: Option<PlaylistDescriptor>,
}

#[derive(Clone, Debug, Default)]
pub struct IngestOutcome {
    pub enqueued_ids: Vec<i64>,
    /// Populated only for `UserCreated` fan-out; the HTTP layer returns
    /// this to the caller once, it is never persisted in cleartext beyond
    /// the fan-out payload the worker consumes to create accounts.
    pub generated_password: Option<String>,
}

pub struct EventIngestor {
    store: Arc<dyn Store>,
    node_names: Vec<String>,
    debounce_window: chrono::Duration,
}

impl EventIngestor {
    pub fn new(store: Arc<dyn Store>, node_names: Vec<String>, debounce_window: chrono::Duration) -> Self {
        Self {
            store,
            node_names,
            debounce_window,
        }
    }

    pub async fn ingest(&self, source: SourceEvent, now: DateTime<Utc>) -> Result<IngestOutcome> {
        if !self.node_names.iter().any(|n| n == &source.source_node) {
            return Err(RelayError::UnknownSource(source.source_node));
        }

        let targets: Vec<&String> = self
            .node_names
            .iter()
            .filter(|n| n.as_str() != source.source_node.as_str())
            .collect();
        if targets.is_empty() {
            return Ok(IngestOutcome::default());
        }

        let item_key = item_key_for(&source);
        let debounce_bucket = if source.event_type == SyncEventType::Progress {
            Some(bucket_for(now, self.debounce_window))
        } else {
            None
        };

        let generated_password = if source.event_type == SyncEventType::UserCreated {
            Some(generate_password())
        } else {
            None
        };

        let mut intents = Vec::with_capacity(targets.len());
        for target in targets {
            let dedup_key = DedupKey {
                event_type: source.event_type,
                source_node: source.source_node.clone(),
                source_user_id: source.source_user_id.clone(),
                item_key: item_key.clone(),
                target_node: target.clone(),
                debounce_bucket,
            };
            let payload = EventPayload {
                username: source.username.clone(),
                item: source.item.clone(),
                played: source.played.clone(),
                position_ticks: source.position_ticks.clone(),
                favorite: source.favorite.clone(),
                rating: source.rating.clone(),
                played_to_completion: source.played_to_completion,
                playlist: source.playlist.clone(),
                generated_password: generated_password.clone(),
            };
            intents.push(EventIntent {
                dedup_key,
                event_type: source.event_type,
                source_node: source.source_node.clone(),
                target_node: target.clone(),
                payload,
            });
        }

        let enqueued_ids = self.store.enqueue_batch(intents, now).await?;
        Ok(IngestOutcome {
            enqueued_ids,
            generated_password,
        })
    }
}

/// Dedup-key item identity for non-item events: playlists key on name,
/// user-lifecycle events have no item at all.
fn item_key_for(source: &SourceEvent) -> String {
    if source.event_type.is_user_lifecycle() {
        return "_user_".to_string();
    }
    if source.event_type == SyncEventType::PlaylistChange {
        if let Some(playlist) = &source.playlist {
            return format!("playlist:{}", playlist.name);
        }
    }
    source.item.lookup_key()
}

fn bucket_for(now: DateTime<Utc>, window: chrono::Duration) -> i64 {
    let window_secs = window.num_seconds().max(1);
    now.timestamp() / window_secs
}

const PASSWORD_LEN: usize = 16;

fn generate_password() -> String {
    let mut bytes = [0u8; PASSWORD_LEN];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    base64::engine::general_purpose::URL_SAFE_NO_PAD
        .encode(bytes)
        .chars()
        .take(PASSWORD_LEN)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::InMemoryStore;

    fn source(event_type: SyncEventType, node: &str) -> SourceEvent {
        SourceEvent {
            event_type,
            source_node: node.to_string(),
            source_user_id: "user-1".to_string(),
            username: "alice".to_string(),
            item: ItemDescriptor {
                path: Some("/movies/a.mkv".to_string()),
                providers: Default::default(),
            },
            played: None,
            position_ticks: None,
            favorite: None,
            rating: None,
            played_to_completion: false,
            playlist: None,
        }
    }

    #[tokio::test]
    async fn fans_out_to_every_other_node() {
        let store = Arc::new(InMemoryStore::new());
        let ingestor = EventIngestor::new(
            store.clone(),
            vec!["a".to_string(), "b".to_string(), "c".to_string()],
            chrono::Duration::seconds(30),
        );
        let outcome = ingestor.ingest(source(SyncEventType::Watched, "a"), Utc::now()).await.unwrap();
        assert_eq!(outcome.enqueued_ids.len(), 2);
    }

    #[tokio::test]
    async fn unknown_source_node_rejected() {
        let store = Arc::new(InMemoryStore::new());
        let ingestor = EventIngestor::new(store, vec!["a".to_string()], chrono::Duration::seconds(30));
        let err = ingestor.ingest(source(SyncEventType::Watched, "ghost"), Utc::now()).await;
        assert!(matches!(err, Err(RelayError::UnknownSource(_))));
    }

    #[tokio::test]
    async fn user_created_generates_password() {
        let store = Arc::new(InMemoryStore::new());
        let ingestor = EventIngestor::new(
            store,
            vec!["a".to_string(), "b".to_string()],
            chrono::Duration::seconds(30),
        );
        let outcome = ingestor
            .ingest(source(SyncEventType::UserCreated, "a"), Utc::now())
            .await
            .unwrap();
        assert_eq!(outcome.generated_password.unwrap().len(), PASSWORD_LEN);
    }
}
