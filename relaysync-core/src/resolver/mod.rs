//! Translates `(source_node, source_user_id, item descriptor)` into
//! `(target_node, target_user_id, target_item_id)`. Uses the Store's
//! caches, falls back to Node Client queries, memoizes results.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tracing::debug;

use crate::node_client::NodeClient;
use crate::store::Store;
use crate::types::{ItemCacheEntry, ItemDescriptor, ItemLookupKey};

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("no matching user on target node")]
    NoMatchingUser,
    #[error("item not found on target: {path:?}")]
    ItemAbsent { path: Option<String> },
    #[error(transparent)]
    Node(#[from] crate::error::NodeError),
    #[error(transparent)]
    Store(#[from] crate::error::StoreError),
}

pub struct IdentityResolver {
    store: Arc<dyn Store>,
    nodes: HashMap<String, Arc<dyn NodeClient>>,
}

impl IdentityResolver {
    pub fn new(store: Arc<dyn Store>, nodes: HashMap<String, Arc<dyn NodeClient>>) -> Self {
        Self { store, nodes }
    }

    fn client(&self, node_name: &str) -> Result<&Arc<dyn NodeClient>, ResolveError> {
        self.nodes
            .get(node_name)
            .ok_or_else(|| ResolveError::Node(crate::error::NodeError::Permanent(format!(
                "unconfigured node {node_name}"
            ))))
    }

    /// Resolves the source user's username, then finds the equivalent
    /// user on `target_node`.
    pub async fn resolve_user(
        &self,
        source_node: &str,
        source_user_id: &str,
        target_node: &str,
    ) -> Result<String, ResolveError> {
        let username = self.reverse_lookup_username(source_node, source_user_id).await?;

        if let Some(id) = self.store.get_user_mapping(&username, target_node).await? {
            return Ok(id);
        }

        let client = self.client(target_node)?;
        let users = client.list_users().await?;
        for user in &users {
            self.store
                .put_user_mapping(&user.username, target_node, &user.remote_id)
                .await?;
        }
        users
            .into_iter()
            .find(|u| u.username.eq_ignore_ascii_case(&username))
            .map(|u| u.remote_id)
            .ok_or(ResolveError::NoMatchingUser)
    }

    /// Resolves the equivalent user on `target_node` directly from a known
    /// username, for callers that already have it (the webhook-based
    /// Ingestor always does — `NotificationUsername` is carried on every
    /// notification) and so have no need for a source-side reverse
    /// lookup.
    pub async fn resolve_user_by_username(
        &self,
        username: &str,
        target_node: &str,
    ) -> Result<String, ResolveError> {
        if let Some(id) = self.store.get_user_mapping(username, target_node).await? {
            return Ok(id);
        }

        let client = self.client(target_node)?;
        let users = client.list_users().await?;
        for user in &users {
            self.store
                .put_user_mapping(&user.username, target_node, &user.remote_id)
                .await?;
        }
        users
            .into_iter()
            .find(|u| u.username.eq_ignore_ascii_case(username))
            .map(|u| u.remote_id)
            .ok_or(ResolveError::NoMatchingUser)
    }

    async fn reverse_lookup_username(
        &self,
        source_node: &str,
        source_user_id: &str,
    ) -> Result<String, ResolveError> {
        if let Some(username) = self
            .store
            .find_username_by_remote_id(source_node, source_user_id)
            .await?
        {
            return Ok(username);
        }

        let client = self.client(source_node)?;
        let users = client.list_users().await?;
        for user in &users {
            self.store
                .put_user_mapping(&user.username, source_node, &user.remote_id)
                .await?;
        }
        users
            .into_iter()
            .find(|u| u.remote_id == source_user_id)
            .map(|u| u.username)
            .ok_or(ResolveError::NoMatchingUser)
    }

    /// Resolves an item on `target_node`: path first, then providers in
    /// imdb/tmdb/tvdb order. Negative results are never cached — the item
    /// may appear later once the target finishes scanning.
    pub async fn resolve_item(
        &self,
        descriptor: &ItemDescriptor,
        target_node: &str,
    ) -> Result<String, ResolveError> {
        let client = self.client(target_node)?;

        if let Some(path) = &descriptor.path {
            let key = ItemLookupKey::Path(path.clone());
            if let Some(entry) = self.store.get_item_cache(target_node, &key).await? {
                if !entry.is_stale(Utc::now()) {
                    return Ok(entry.remote_item_id);
                }
            }
            if let Some(remote_id) = client.find_item_by_path(path).await? {
                self.cache_item(target_node, key, &remote_id).await?;
                return Ok(remote_id);
            }
        }

        for (provider, value) in descriptor.providers.in_resolution_order() {
            let key = ItemLookupKey::Provider {
                provider: provider.to_string(),
                value: value.to_string(),
            };
            if let Some(entry) = self.store.get_item_cache(target_node, &key).await? {
                if !entry.is_stale(Utc::now()) {
                    return Ok(entry.remote_item_id);
                }
            }
            if let Some(remote_id) = client.find_item_by_provider(provider, value).await? {
                self.cache_item(target_node, key, &remote_id).await?;
                return Ok(remote_id);
            }
        }

        debug!(target_node, path = ?descriptor.path, "item unresolved");
        Err(ResolveError::ItemAbsent {
            path: descriptor.path.clone(),
        })
    }

    async fn cache_item(
        &self,
        target_node: &str,
        key: ItemLookupKey,
        remote_id: &str,
    ) -> Result<(), ResolveError> {
        self.store
            .put_item_cache(ItemCacheEntry {
                node_name: target_node.to_string(),
                lookup_key: key,
                remote_item_id: remote_id.to_string(),
                fetched_at: Utc::now(),
            })
            .await?;
        Ok(())
    }
}
