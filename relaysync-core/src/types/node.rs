use serde::{Deserialize, Serialize};

/// Configuration record for one media-library node. Lifetime = process;
/// held by the Supervisor and shared read-only with every other component.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Unique short identifier, e.g. "wan" or "lan".
    pub name: String,
    pub base_url: url::Url,
    pub api_key: String,
    #[serde(default)]
    pub passwordless: bool,
}

impl NodeConfig {
    pub fn is(&self, name: &str) -> bool {
        self.name == name
    }
}
