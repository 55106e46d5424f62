use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use threatintel_core::EngineConfig;

/// Raw configuration as defined in a TOML file.
#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct FileConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub store: FileStoreConfig,
    #[serde(default)]
    pub feeds: FileFeedsConfig,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileStoreConfig {
    /// `opensearch` or `memory`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Human-readable duration, e.g. `30s`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_timeout: Option<String>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileFeedsConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manifest: Option<PathBuf>,
}

/// Overrides read from `THREATINTEL_*` environment variables.
#[derive(Debug, Default, Clone)]
pub struct EnvConfig {
    pub config_path: Option<PathBuf>,
    pub store_backend: Option<String>,
    pub store_url: Option<String>,
    pub store_request_timeout: Option<String>,
    pub feed_manifest: Option<PathBuf>,
    pub lock_duration: Option<String>,
    pub renew_after: Option<String>,
    pub shard_wait_timeout: Option<String>,
    pub shard_poll_interval: Option<String>,
    pub batch_size: Option<String>,
    pub max_concurrent_runs: Option<String>,
    pub data_index_prefix: Option<String>,
}

impl EnvConfig {
    pub fn gather() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds overrides from an arbitrary variable source; blank values are
    /// treated as unset.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());

        Self {
            config_path: var("THREATINTEL_CONFIG").map(PathBuf::from),
            store_backend: var("THREATINTEL_STORE_BACKEND"),
            store_url: var("THREATINTEL_OPENSEARCH_URL"),
            store_request_timeout: var("THREATINTEL_STORE_REQUEST_TIMEOUT"),
            feed_manifest: var("THREATINTEL_FEED_MANIFEST").map(PathBuf::from),
            lock_duration: var("THREATINTEL_LOCK_DURATION"),
            renew_after: var("THREATINTEL_LOCK_RENEW_AFTER"),
            shard_wait_timeout: var("THREATINTEL_SHARD_WAIT_TIMEOUT"),
            shard_poll_interval: var("THREATINTEL_SHARD_POLL_INTERVAL"),
            batch_size: var("THREATINTEL_BATCH_SIZE"),
            max_concurrent_runs: var("THREATINTEL_MAX_CONCURRENT_RUNS"),
            data_index_prefix: lookup("THREATINTEL_DATA_INDEX_PREFIX"),
        }
    }
}
