use std::sync::Arc;

use anyhow::Context;
use threatintel_core::{
    InMemorySearchStore, JobRunner, ManifestFeedCatalog, OpenSearchStore, SearchStore,
};
use tracing::info;

use crate::config::{Config, StoreBackend};

/// Builds the store selected by `config`.
pub fn build_store(config: &Config) -> anyhow::Result<Arc<dyn SearchStore>> {
    match &config.store {
        StoreBackend::OpenSearch {
            url,
            request_timeout,
        } => {
            info!(url = %url, "using OpenSearch store");
            let store = OpenSearchStore::new(url.clone(), *request_timeout)
                .context("failed to build OpenSearch client")?;
            Ok(Arc::new(store))
        }
        StoreBackend::Memory => Ok(Arc::new(InMemorySearchStore::new())),
    }
}

/// The one runner instance this process owns.
pub fn build_runner(config: &Config) -> anyhow::Result<Arc<JobRunner>> {
    let store = build_store(config)?;
    let catalog = Arc::new(ManifestFeedCatalog::new(config.feeds.manifest.clone()));
    let runner = JobRunner::new(store, catalog, config.engine.clone())
        .context("failed to construct job runner")?;
    Ok(Arc::new(runner))
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use threatintel_core::EngineConfig;

    use super::*;
    use crate::config::{ConfigMetadata, FeedsConfig};

    #[tokio::test]
    async fn memory_runner_starts_empty() {
        let config = Config {
            engine: EngineConfig::default(),
            store: StoreBackend::Memory,
            feeds: FeedsConfig {
                manifest: PathBuf::from("feeds.json"),
            },
            metadata: ConfigMetadata::default(),
        };
        let runner = build_runner(&config).unwrap();
        let jobs = runner
            .get_jobs(&threatintel_core::JobSelector::All)
            .await
            .unwrap();
        assert!(jobs.is_empty());
    }
}
