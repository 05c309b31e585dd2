//! Capability wrapper over one remote node. Stateless; one instance per
//! configured node, held by the Supervisor and shared with the Resolver
//! and Worker.

mod reqwest_client;

pub use reqwest_client::ReqwestNodeClient;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::NodeError;

#[derive(Clone, Debug)]
pub struct RemoteUser {
    pub remote_id: String,
    pub username: String,
}

#[derive(Clone, Debug, Default)]
pub struct UserItemData {
    pub played: bool,
    pub position_ticks: i64,
    pub favorite: bool,
    pub rating: Option<f32>,
    pub last_played_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, Default)]
pub struct UserItemPatch {
    pub played: Option<bool>,
    pub position_ticks: Option<i64>,
    pub favorite: Option<bool>,
    pub rating: Option<Option<f32>>,
}

#[derive(Clone, Debug)]
pub struct RemotePlaylist {
    pub name: String,
    pub item_ids: Vec<String>,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct HealthStatus {
    pub reachable: bool,
    pub version: Option<&'static str>,
}

/// The minimal set of node operations the core consumes. HTTP framing and
/// JSON field names are intentionally not part of this contract —
/// `ReqwestNodeClient` is one implementation; tests use
/// [`crate::test_support::ScriptedNodeClient`].
#[async_trait]
pub trait NodeClient: Send + Sync {
    fn node_name(&self) -> &str;

    async fn health(&self) -> HealthStatus;

    async fn list_users(&self) -> Result<Vec<RemoteUser>, NodeError>;

    async fn find_item_by_path(&self, path: &str) -> Result<Option<String>, NodeError>;

    async fn find_item_by_provider(
        &self,
        provider: &str,
        value: &str,
    ) -> Result<Option<String>, NodeError>;

    async fn get_user_item_data(
        &self,
        user_id: &str,
        item_id: &str,
    ) -> Result<UserItemData, NodeError>;

    async fn apply_user_item_data(
        &self,
        user_id: &str,
        item_id: &str,
        patch: UserItemPatch,
    ) -> Result<(), NodeError>;

    async fn mark_played(
        &self,
        user_id: &str,
        item_id: &str,
        at_time: DateTime<Utc>,
    ) -> Result<(), NodeError>;

    async fn mark_unplayed(&self, user_id: &str, item_id: &str) -> Result<(), NodeError>;

    async fn set_favorite(&self, user_id: &str, item_id: &str, value: bool) -> Result<(), NodeError>;

    async fn set_rating(
        &self,
        user_id: &str,
        item_id: &str,
        value: Option<f32>,
    ) -> Result<(), NodeError>;

    async fn set_progress(
        &self,
        user_id: &str,
        item_id: &str,
        position_ticks: i64,
    ) -> Result<(), NodeError>;

    async fn create_user(
        &self,
        username: &str,
        password: Option<&str>,
    ) -> Result<RemoteUser, NodeError>;

    async fn delete_user(&self, remote_id: &str) -> Result<(), NodeError>;

    async fn list_playlists(&self, user_id: &str) -> Result<Vec<RemotePlaylist>, NodeError>;

    async fn create_playlist(
        &self,
        user_id: &str,
        name: &str,
        item_ids: &[String],
    ) -> Result<(), NodeError>;

    async fn set_playlist_items(
        &self,
        user_id: &str,
        playlist_name: &str,
        item_ids: &[String],
    ) -> Result<(), NodeError>;
}
