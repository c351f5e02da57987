//! avaast.toml configuration parser.

use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AvaastConfig {
    pub watch: WatchConfig,
    pub server: Option<ServerConfig>,
    pub limits: Option<LimitsConfig>,
}

/// Which account and transports to watch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchConfig {
    /// Authority identifier (DID) whose records drive this host.
    pub authority: String,
    /// PDS base URL. Resolved from the DID when absent.
    pub pds_url: Option<String>,
    /// Relay WebSocket URL. When set, relay mode is preferred.
    pub relay_url: Option<String>,
    /// Extra collections to watch beyond the `app.avaast.*` set.
    pub extra_collections: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub port: Option<u16>,
    pub data_dir: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum concurrently active deploys (default 2).
    pub max_active_deploys: Option<usize>,
    /// Polling interval in seconds for the fallback transport (default 30).
    pub poll_interval_secs: Option<u64>,
    /// Query cache TTL in seconds.
    pub cache_ttl_secs: Option<u64>,
}

impl AvaastConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: AvaastConfig = toml::from_str(&content)?;
        Ok(config)
    }
}
