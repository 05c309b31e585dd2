use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::error::NodeError;
use crate::types::NodeConfig;

use super::{HealthStatus, NodeClient, RemotePlaylist, RemoteUser, UserItemData, UserItemPatch};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const READ_TIMEOUT: Duration = Duration::from_secs(30);

/// `NodeClient` implementation backed by a node's REST management API.
///
/// One client per configured node, built once at Supervisor startup and
/// shared via `Arc`. No client-side retries: the retry policy lives
/// entirely in the Sync Worker so the same budget applies regardless of
/// which Node Client call failed.
#[derive(Clone, Debug)]
pub struct ReqwestNodeClient {
    node: NodeConfig,
    http: reqwest::Client,
}

impl ReqwestNodeClient {
    pub fn new(node: NodeConfig) -> Self {
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(READ_TIMEOUT)
            .build()
            .expect("reqwest client builder should not fail with static config");
        Self { node, http }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.node.base_url.as_str().trim_end_matches('/'), path)
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.http
            .request(method, self.url(path))
            .bearer_auth(&self.node.api_key)
    }

    async fn send_json<T: for<'de> Deserialize<'de>>(
        &self,
        builder: reqwest::RequestBuilder,
    ) -> Result<T, NodeError> {
        let response = builder.send().await?;
        let response = classify_status(response)?;
        response.json::<T>().await.map_err(NodeError::from)
    }

    async fn send_empty(&self, builder: reqwest::RequestBuilder) -> Result<(), NodeError> {
        let response = builder.send().await?;
        classify_status(response)?;
        Ok(())
    }
}

fn classify_status(response: reqwest::Response) -> Result<reqwest::Response, NodeError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    match status.as_u16() {
        401 | 403 => Err(NodeError::Unauthorized),
        404 => Err(NodeError::NotFound {
            kind: crate::error::NotFoundKind::Item,
        }),
        500..=599 => Err(NodeError::Transient(format!("status {status}"))),
        _ => Err(NodeError::Permanent(format!("status {status}"))),
    }
}

#[derive(Deserialize)]
struct UsersResponse {
    users: Vec<RemoteUserWire>,
}

#[derive(Deserialize)]
struct RemoteUserWire {
    id: String,
    name: String,
}

#[derive(Deserialize)]
struct ItemLookupResponse {
    item_id: Option<String>,
}

#[derive(Deserialize)]
struct UserItemDataWire {
    played: bool,
    position_ticks: i64,
    favorite: bool,
    rating: Option<f32>,
    last_played_at: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
struct PlaylistsResponse {
    playlists: Vec<PlaylistWire>,
}

#[derive(Deserialize)]
struct PlaylistWire {
    name: String,
    item_ids: Vec<String>,
}

#[async_trait]
impl NodeClient for ReqwestNodeClient {
    fn node_name(&self) -> &str {
        &self.node.name
    }

    async fn health(&self) -> HealthStatus {
        match self.request(reqwest::Method::GET, "/System/Info").send().await {
            Ok(resp) if resp.status().is_success() => HealthStatus {
                reachable: true,
                version: None,
            },
            _ => HealthStatus {
                reachable: false,
                version: None,
            },
        }
    }

    async fn list_users(&self) -> Result<Vec<RemoteUser>, NodeError> {
        let resp: UsersResponse = self
            .send_json(self.request(reqwest::Method::GET, "/Users"))
            .await?;
        Ok(resp
            .users
            .into_iter()
            .map(|u| RemoteUser {
                remote_id: u.id,
                username: u.name,
            })
            .collect())
    }

    async fn find_item_by_path(&self, path: &str) -> Result<Option<String>, NodeError> {
        let resp: ItemLookupResponse = self
            .send_json(
                self.request(reqwest::Method::GET, "/Items/ByPath")
                    .query(&[("path", path)]),
            )
            .await?;
        Ok(resp.item_id)
    }

    async fn find_item_by_provider(
        &self,
        provider: &str,
        value: &str,
    ) -> Result<Option<String>, NodeError> {
        let resp: ItemLookupResponse = self
            .send_json(
                self.request(reqwest::Method::GET, "/Items/ByProvider")
                    .query(&[("provider", provider), ("value", value)]),
            )
            .await?;
        Ok(resp.item_id)
    }

    async fn get_user_item_data(
        &self,
        user_id: &str,
        item_id: &str,
    ) -> Result<UserItemData, NodeError> {
        let path = format!("/Users/{user_id}/Items/{item_id}/UserData");
        let wire: UserItemDataWire = self
            .send_json(self.request(reqwest::Method::GET, &path))
            .await?;
        Ok(UserItemData {
            played: wire.played,
            position_ticks: wire.position_ticks,
            favorite: wire.favorite,
            rating: wire.rating,
            last_played_at: wire.last_played_at,
        })
    }

    async fn apply_user_item_data(
        &self,
        user_id: &str,
        item_id: &str,
        patch: UserItemPatch,
    ) -> Result<(), NodeError> {
        let path = format!("/Users/{user_id}/Items/{item_id}/UserData");
        self.send_empty(self.request(reqwest::Method::POST, &path).json(&patch_body(&patch)))
            .await
    }

    async fn mark_played(
        &self,
        user_id: &str,
        item_id: &str,
        at_time: DateTime<Utc>,
    ) -> Result<(), NodeError> {
        let path = format!("/Users/{user_id}/PlayedItems/{item_id}");
        self.send_empty(
            self.request(reqwest::Method::POST, &path)
                .query(&[("DatePlayed", at_time.to_rfc3339())]),
        )
        .await
    }

    async fn mark_unplayed(&self, user_id: &str, item_id: &str) -> Result<(), NodeError> {
        let path = format!("/Users/{user_id}/PlayedItems/{item_id}");
        self.send_empty(self.request(reqwest::Method::DELETE, &path)).await
    }

    async fn set_favorite(&self, user_id: &str, item_id: &str, value: bool) -> Result<(), NodeError> {
        let path = format!("/Users/{user_id}/FavoriteItems/{item_id}");
        if value {
            self.send_empty(self.request(reqwest::Method::POST, &path)).await
        } else {
            self.send_empty(self.request(reqwest::Method::DELETE, &path)).await
        }
    }

    async fn set_rating(
        &self,
        user_id: &str,
        item_id: &str,
        value: Option<f32>,
    ) -> Result<(), NodeError> {
        let path = format!("/Users/{user_id}/Items/{item_id}/Rating");
        match value {
            Some(rating) => {
                self.send_empty(
                    self.request(reqwest::Method::POST, &path)
                        .query(&[("rating", rating.to_string())]),
                )
                .await
            }
            None => self.send_empty(self.request(reqwest::Method::DELETE, &path)).await,
        }
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
        password: Option<&str>,
    ) -> Result<RemoteUser, NodeError> {
        let wire: RemoteUserWire = self
            .send_json(self.request(reqwest::Method::POST, "/Users/New").json(&serde_json::json!({
                "Name": username,
                "Password": password,
            })))
            .await?;
        Ok(RemoteUser {
            remote_id: wire.id,
            username: wire.name,
        })
    }

    async fn delete_user(&self, remote_id: &str) -> Result<(), NodeError> {
        let path = format!("/Users/{remote_id}");
        self.send_empty(self.request(reqwest::Method::DELETE, &path)).await
    }

    async fn list_playlists(&self, user_id: &str) -> Result<Vec<RemotePlaylist>, NodeError> {
        let path = format!("/Users/{user_id}/Playlists");
        let resp: PlaylistsResponse = self.send_json(self.request(reqwest::Method::GET, &path)).await?;
        Ok(resp
            .playlists
            .into_iter()
            .map(|p| RemotePlaylist {
                name: p.name,
                item_ids: p.item_ids,
            })
            .collect())
    }

    async fn create_playlist(
        &self,
        user_id: &str,
        name: &str,
        item_ids: &[String],
    ) -> Result<(), NodeError> {
        let path = format!("/Users/{user_id}/Playlists");
        self.send_empty(
            self.request(reqwest::Method::POST, &path).json(&serde_json::json!({
                "Name": name,
                "ItemIds": item_ids,
            })),
        )
        .await
    }

    async fn set_playlist_items(
        &self,
        user_id: &str,
        playlist_name: &str,
        item_ids: &[String],
    ) -> Result<(), NodeError> {
        let path = format!("/Users/{user_id}/Playlists/{playlist_name}/Items");
        self.send_empty(
            self.request(reqwest::Method::PUT, &path).json(&serde_json::json!({
                "ItemIds": item_ids,
            })),
        )
        .await
    }
}

fn patch_body(patch: &UserItemPatch) -> serde_json::Value {
    serde_json::json!({
        "Played": patch.played,
        "PositionTicks": patch.position_ticks,
        "IsFavorite": patch.favorite,
        "Rating": patch.rating,
    })
}
