//! Process configuration: a TOML file parsed into a [`Config`], with
//! environment variable overrides for node API keys so secrets don't need
//! to live in the checked-in config file.

use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use relaysync_core::{NodeConfig, PathSyncPolicy};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub servers: Vec<ServerEntry>,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default, rename = "path_sync_policy")]
    pub path_sync_policy: Vec<PathPolicyEntry>,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub server: HttpServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerEntry {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub passwordless: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub playback_progress: bool,
    pub watched_status: bool,
    pub favorites: bool,
    pub ratings: bool,
    pub playlists: bool,
    pub progress_debounce_seconds: u64,
    pub worker_interval_seconds: u64,
    pub max_retries: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            playback_progress: true,
            watched_status: true,
            favorites: true,
            ratings: true,
            playlists: false,
            progress_debounce_seconds: 30,
            worker_interval_seconds: 5,
            max_retries: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PathPolicyEntry {
    pub prefix: String,
    pub absent_retry_count: i32,
    pub retry_delay_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./relaysync.sqlite3"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpServerConfig {
    pub host: IpAddr,
    pub port: u16,
}

impl Default for HttpServerConfig {
    fn default() -> Self {
        Self {
            host: IpAddr::from([0, 0, 0, 0]),
            port: 8085,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Config {
    /// Loads `.env` (if present), reads `path`, and parses it as TOML.
    /// Per-node `api_key` values are overridden from
    /// `RELAYSYNC_API_KEY_<NAME>` (name uppercased) when set, so keys don't
    /// need to be checked in alongside the rest of the config.
    pub fn load(path: &Path) -> Result<Self> {
        dotenvy::dotenv().ok();

        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let mut config: Config = toml::from_str(&contents)
            .with_context(|| format!("invalid config file {}", path.display()))?;

        for server in &mut config.servers {
            let env_key = format!("RELAYSYNC_API_KEY_{}", server.name.to_uppercase());
            if let Ok(value) = std::env::var(&env_key) {
                server.api_key = value;
            }
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.servers.len() < 2 {
            anyhow::bail!("at least two `servers` entries are required for replication to be meaningful");
        }
        let mut seen = std::collections::HashSet::new();
        for server in &self.servers {
            if !seen.insert(server.name.as_str()) {
                anyhow::bail!("duplicate server name `{}` in config", server.name);
            }
        }
        Ok(())
    }

    pub fn node_configs(&self) -> Result<Vec<NodeConfig>> {
        self.servers
            .iter()
            .map(|s| {
                Ok(NodeConfig {
                    name: s.name.clone(),
                    base_url: s
                        .url
                        .parse()
                        .with_context(|| format!("invalid url for server `{}`: {}", s.name, s.url))?,
                    api_key: s.api_key.clone(),
                    passwordless: s.passwordless,
                })
            })
            .collect()
    }

    pub fn path_sync_policies(&self) -> Vec<PathSyncPolicy> {
        self.path_sync_policy
            .iter()
            .map(|p| PathSyncPolicy {
                prefix: p.prefix.clone(),
                absent_retry_count: p.absent_retry_count,
                retry_delay_seconds: p.retry_delay_seconds,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn loads_minimal_config_with_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
            [[servers]]
            name = "wan"
            url = "https://wan.example.com"
            api_key = "wan-key"

            [[servers]]
            name = "lan"
            url = "http://lan.local:8096"
            api_key = "lan-key"
            passwordless = true
            "#
        )
        .unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.servers.len(), 2);
        assert_eq!(config.sync.worker_interval_seconds, 5);
        assert_eq!(config.server.port, 8085);
    }

    #[test]
    fn rejects_fewer_than_two_servers() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
            [[servers]]
            name = "solo"
            url = "http://solo.local"
            api_key = "k"
            "#
        )
        .unwrap();

        assert!(Config::load(file.path()).is_err());
    }

    #[test]
    fn env_override_wins_over_file_api_key() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
            [[servers]]
            name = "wan"
            url = "https://wan.example.com"
            api_key = "from-file"

            [[servers]]
            name = "lan"
            url = "http://lan.local"
            api_key = "from-file"
            "#
        )
        .unwrap();

        // SAFETY: test-only process-local env mutation, not shared across
        // concurrently running tests that read this variable.
        unsafe {
            std::env::set_var("RELAYSYNC_API_KEY_WAN", "from-env");
        }
        let config = Config::load(file.path()).unwrap();
        unsafe {
            std::env::remove_var("RELAYSYNC_API_KEY_WAN");
        }
        assert_eq!(config.servers[0].api_key, "from-env");
    }
}
