use chrono::{DateTime, Utc};

/// `(username, node_name) -> remote_user_id`.
#[derive(Clone, Debug)]
pub struct UserMapping {
    pub username: String,
    pub node_name: String,
    pub remote_user_id: String,
}

/// How an item was located: by filesystem path, or by an external provider
/// id. Used both as the cache key discriminant and to pick the Node Client
/// call the Resolver issues.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub enum ItemLookupKey {
    Path(String),
    Provider { provider: String, value: String },
}

impl ItemLookupKey {
    pub fn as_db_str(&self) -> String {
        match self {
            ItemLookupKey::Path(p) => format!("path:{p}"),
            ItemLookupKey::Provider { provider, value } => format!("{provider}:{value}"),
        }
    }
}

/// `(node_name, lookup_key) -> remote_item_id`. `fetched_at` drives the 24h
/// refresh-on-next-use rule.
#[derive(Clone, Debug)]
pub struct ItemCacheEntry {
    pub node_name: String,
    pub lookup_key: ItemLookupKey,
    pub remote_item_id: String,
    pub fetched_at: DateTime<Utc>,
}

impl ItemCacheEntry {
    pub fn ttl() -> chrono::Duration {
        chrono::Duration::hours(24)
    }

    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        now - self.fetched_at > Self::ttl()
    }
}
