pub mod loader;
pub mod sources;

use std::path::PathBuf;
use std::time::Duration;

use threatintel_core::EngineConfig;
use url::Url;

pub use loader::{ConfigLoad, ConfigLoadError, ConfigLoader, ConfigLoaderOptions};

/// Fully resolved configuration for one process.
#[derive(Debug, Clone)]
pub struct Config {
    pub engine: EngineConfig,
    pub store: StoreBackend,
    pub feeds: FeedsConfig,
    pub metadata: ConfigMetadata,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreBackend {
    OpenSearch { url: Url, request_timeout: Duration },
    /// Process-local; every invocation starts empty.
    Memory,
}

#[derive(Debug, Clone)]
pub struct FeedsConfig {
    pub manifest: PathBuf,
}

#[derive(Debug, Clone, Default)]
pub struct ConfigMetadata {
    pub config_path: Option<PathBuf>,
    pub env_file_loaded: bool,
}

#[derive(Debug, Clone)]
pub struct ConfigWarning {
    pub message: String,
    pub hint: Option<String>,
}

#[derive(Debug, Default, Clone)]
pub struct ConfigWarnings {
    pub items: Vec<ConfigWarning>,
}

impl ConfigWarnings {
    pub fn push<S: Into<String>>(&mut self, message: S) {
        self.items.push(ConfigWarning {
            message: message.into(),
            hint: None,
        });
    }

    pub fn push_with_hint<S: Into<String>, H: Into<String>>(&mut self, message: S, hint: H) {
        self.items.push(ConfigWarning {
            message: message.into(),
            hint: Some(hint.into()),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
