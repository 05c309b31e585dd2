//! `POST /webhook/{node_name}` — the one ingress point for node
//! notifications. Accepts the node's webhook body, maps its
//! `NotificationType` onto one or more [`SourceEvent`]s, and hands them to
//! the Ingestor.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::{DateTime, Utc};
use relaysync_core::{
    ItemDescriptor, PlaylistDescriptor, ProviderIds, SourceEvent, SyncEventType, TimestampedValue,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::config::SyncConfig;
use crate::errors::AppError;
use crate::state::AppState;

/// Raw webhook payload shape. Field names match the notification template
/// variables nodes are configured to send — `UserId` is the
/// node-local user id the node's own notification plugin fills in
/// alongside `NotificationUsername`, distinct from the cross-node username.
#[derive(Debug, Deserialize)]
pub struct RawNotification {
    #[serde(rename = "NotificationType")]
    pub notification_type: String,
    #[serde(rename = "NotificationUsername")]
    pub username: String,
    #[serde(rename = "UserId", default)]
    pub user_id: String,
    #[serde(rename = "ItemId", default)]
    pub item_id: Option<String>,
    #[serde(rename = "Name", default)]
    pub name: Option<String>,
    #[serde(rename = "ItemType", default)]
    pub item_type: Option<String>,
    #[serde(rename = "Path", default)]
    pub path: Option<String>,
    #[serde(rename = "PlaybackPositionTicks", default)]
    pub playback_position_ticks: Option<i64>,
    #[serde(rename = "PlayedToCompletion", default)]
    pub played_to_completion: bool,
    #[serde(rename = "IsFavorite", default)]
    pub is_favorite: Option<bool>,
    #[serde(rename = "Played", default)]
    pub played: Option<bool>,
    #[serde(rename = "Rating", default)]
    pub rating: Option<f32>,
    #[serde(rename = "Provider_imdb", default)]
    pub provider_imdb: Option<String>,
    #[serde(rename = "Provider_tmdb", default)]
    pub provider_tmdb: Option<String>,
    #[serde(rename = "Provider_tvdb", default)]
    pub provider_tvdb: Option<String>,
    #[serde(rename = "UtcTimestamp", default)]
    pub utc_timestamp: Option<DateTime<Utc>>,
    /// Extension beyond the base notification schema: nodes configured
    /// with `sync.playlists = true` send this
    /// notification type whenever a playlist's membership changes.
    #[serde(rename = "PlaylistName", default)]
    pub playlist_name: Option<String>,
    #[serde(rename = "PlaylistItemPaths", default)]
    pub playlist_item_paths: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct WebhookResponse {
    pub enqueued_ids: Vec<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generated_password: Option<String>,
}

pub async fn handle_webhook(
    State(state): State<AppState>,
    Path(node_name): Path<String>,
    Json(body): Json<RawNotification>,
) -> Result<(StatusCode, Json<Value>), AppError> {
    let source_timestamp = body.utc_timestamp.unwrap_or_else(Utc::now);
    let sources = normalize(&state.config.sync, &node_name, body, source_timestamp)?;
    if sources.is_empty() {
        // Recognized notification, but every field it carried is toggled
        // off in `sync.*` — nothing to propagate.
        return Ok((
            StatusCode::ACCEPTED,
            Json(json!({ "enqueued_ids": [], "note": "no fields enabled for sync" })),
        ));
    }

    let ingestor = state.supervisor.ingestor();
    let mut enqueued_ids = Vec::new();
    let mut generated_password = None;
    for source in sources {
        let outcome = ingestor.ingest(source, Utc::now()).await?;
        enqueued_ids.extend(outcome.enqueued_ids);
        generated_password = generated_password.or(outcome.generated_password);
    }

    info!(node = %node_name, count = enqueued_ids.len(), "webhook enqueued events");
    let response = WebhookResponse {
        enqueued_ids,
        generated_password,
    };
    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::to_value(response).expect("WebhookResponse always serializes")),
    ))
}

/// Maps one raw notification into zero or more [`SourceEvent`]s per
/// `sync.*` toggles. Multiple events can come out of a single
/// `UserDataSaved` body since it carries several independent fields, and a
/// `PlaybackProgress`/`PlaybackStop` with `PlayedToCompletion=true` also
/// implies a `Watched` transition.
fn normalize(
    sync: &SyncConfig,
    node_name: &str,
    body: RawNotification,
    source_timestamp: DateTime<Utc>,
) -> Result<Vec<SourceEvent>, AppError> {
    let item = ItemDescriptor {
        path: body.path.clone(),
        providers: ProviderIds {
            imdb: body.provider_imdb.clone(),
            tmdb: body.provider_tmdb.clone(),
            tvdb: body.provider_tvdb.clone(),
        },
    };

    let base = || SourceEventBuilder {
        source_node: node_name.to_string(),
        source_user_id: body.user_id.clone(),
        username: body.username.clone(),
        item: item.clone(),
    };

    let mut events = Vec::new();
    match body.notification_type.as_str() {
        "PlaybackProgress" | "PlaybackStop" => {
            if sync.playback_progress {
                if let Some(ticks) = body.playback_position_ticks {
                    events.push(base().build(
                        SyncEventType::Progress,
                        SourceEventFields {
                            position_ticks: Some(TimestampedValue {
                                value: ticks,
                                source_timestamp,
                            }),
                            played_to_completion: body.played_to_completion,
                            ..Default::default()
                        },
                    ));
                }
            }
            if sync.watched_status && body.played_to_completion {
                events.push(base().build(
                    SyncEventType::Watched,
                    SourceEventFields {
                        played: Some(TimestampedValue {
                            value: true,
                            source_timestamp,
                        }),
                        played_to_completion: true,
                        ..Default::default()
                    },
                ));
            }
        }
        "UserDataSaved" => {
            if sync.watched_status {
                if let Some(played) = body.played {
                    events.push(base().build(
                        SyncEventType::Watched,
                        SourceEventFields {
                            played: Some(TimestampedValue {
                                value: played,
                                source_timestamp,
                            }),
                            ..Default::default()
                        },
                    ));
                }
            }
            if sync.favorites {
                if let Some(favorite) = body.is_favorite {
                    events.push(base().build(
                        SyncEventType::Favorite,
                        SourceEventFields {
                            favorite: Some(TimestampedValue {
                                value: favorite,
                                source_timestamp,
                            }),
                            ..Default::default()
                        },
                    ));
                }
            }
            // Rating has no dedicated field in the base notification schema;
            // when a node's plugin does send one alongside UserDataSaved,
            // sync it the same way as the other
            // fields instead of requiring a follow-up read.
            if sync.ratings {
                if let Some(rating) = body.rating {
                    events.push(base().build(
                        SyncEventType::Rating,
                        SourceEventFields {
                            rating: Some(TimestampedValue {
                                value: rating,
                                source_timestamp,
                            }),
                            ..Default::default()
                        },
                    ));
                }
            }
        }
        "UserCreated" => {
            events.push(base().build(SyncEventType::UserCreated, SourceEventFields::default()));
        }
        "UserDeleted" => {
            events.push(base().build(SyncEventType::UserDeleted, SourceEventFields::default()));
        }
        "PlaylistChange" => {
            if sync.playlists {
                let name = body
                    .playlist_name
                    .or(body.name)
                    .ok_or_else(|| AppError::bad_request("PlaylistChange requires PlaylistName"))?;
                events.push(base().build(
                    SyncEventType::PlaylistChange,
                    SourceEventFields {
                        playlist: Some(PlaylistDescriptor {
                            name,
                            item_keys: body.playlist_item_paths,
                        }),
                        ..Default::default()
                    },
                ));
            }
        }
        other => {
            warn!(notification_type = other, "unrecognized notification type");
            return Err(AppError::bad_request(format!(
                "unrecognized NotificationType: {other}"
            )));
        }
    }

    Ok(events)
}

#[derive(Default)]
struct SourceEventFields {
    played: Option<TimestampedValue<bool>>,
    position_ticks: Option<TimestampedValue<i64>>,
    favorite: Option<TimestampedValue<bool>>,
    rating: Option<TimestampedValue<f32>>,
    played_to_completion: bool,
    playlist: Option<PlaylistDescriptor>,
}

struct SourceEventBuilder {
    source_node: String,
    source_user_id: String,
    username: String,
    item: ItemDescriptor,
}

impl SourceEventBuilder {
    fn build(self, event_type: SyncEventType, fields: SourceEventFields) -> SourceEvent {
        SourceEvent {
            event_type,
            source_node: self.source_node,
            source_user_id: self.source_user_id,
            username: self.username,
            item: self.item,
            played: fields.played,
            position_ticks: fields.position_ticks,
            favorite: fields.favorite,
            rating: fields.rating,
            played_to_completion: fields.played_to_completion,
            playlist: fields.playlist,
        }
    }
}
