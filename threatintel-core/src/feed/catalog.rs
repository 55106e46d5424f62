use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::debug;

use super::FeedMetadata;
use crate::error::{FeedJobError, Result};

/// Resolves the feed a job refreshes from.
#[async_trait]
pub trait FeedCatalog: Send + Sync + fmt::Debug {
    async fn feed_for(&self, job: &str) -> Result<Option<FeedMetadata>>;
}

#[derive(Debug, Deserialize)]
struct ManifestEntry {
    /// Job served by this feed; defaults to the feed id.
    #[serde(default)]
    job: Option<String>,
    #[serde(flatten)]
    feed: FeedMetadata,
}

impl ManifestEntry {
    fn job_name(&self) -> &str {
        self.job.as_deref().unwrap_or(&self.feed.feed_id)
    }
}

/// JSON manifest on disk, re-read on every lookup so edits apply to the
/// next run without a restart.
#[derive(Debug, Clone)]
pub struct ManifestFeedCatalog {
    path: PathBuf,
}

impl ManifestFeedCatalog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> Result<Vec<ManifestEntry>> {
        let raw = tokio::fs::read_to_string(&self.path).await.map_err(|err| {
            FeedJobError::Internal(format!(
                "reading feed manifest {}: {err}",
                self.path.display()
            ))
        })?;
        let entries: Vec<ManifestEntry> = serde_json::from_str(&raw)?;
        Ok(entries)
    }
}

#[async_trait]
impl FeedCatalog for ManifestFeedCatalog {
    async fn feed_for(&self, job: &str) -> Result<Option<FeedMetadata>> {
        let entries = self.load().await?;
        debug!(manifest = %self.path.display(), feeds = entries.len(), "loaded feed manifest");
        Ok(entries
            .into_iter()
            .find(|entry| entry.job_name() == job)
            .map(|entry| entry.feed))
    }
}

/// In-process catalog for embedding and tests.
#[derive(Default)]
pub struct StaticFeedCatalog {
    feeds: RwLock<HashMap<String, FeedMetadata>>,
}

impl fmt::Debug for StaticFeedCatalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let jobs = self.feeds.try_read().map(|feeds| feeds.len()).ok();
        f.debug_struct("StaticFeedCatalog").field("jobs", &jobs).finish()
    }
}

impl StaticFeedCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_feed(mut self, job: impl Into<String>, feed: FeedMetadata) -> Self {
        self.feeds.get_mut().insert(job.into(), feed);
        self
    }

    /// Replaces the feed a job resolves to; the next run picks it up.
    pub async fn insert(&self, job: impl Into<String>, feed: FeedMetadata) {
        self.feeds.write().await.insert(job.into(), feed);
    }
}

#[async_trait]
impl FeedCatalog for StaticFeedCatalog {
    async fn feed_for(&self, job: &str) -> Result<Option<FeedMetadata>> {
        Ok(self.feeds.read().await.get(job).cloned())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use url::Url;

    use super::*;

    #[tokio::test]
    async fn manifest_matches_explicit_job_or_feed_id() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"[
                {{"feed_id": "feed-x", "url": "https://feeds.example.org/x.csv"}},
                {{"job": "tor-exits", "feed_id": "dan-me-uk", "url": "https://feeds.example.org/tor.txt",
                  "has_header": false, "indicator_type": "ip"}}
            ]"#
        )
        .unwrap();

        let catalog = ManifestFeedCatalog::new(file.path());
        let x = catalog.feed_for("feed-x").await.unwrap().expect("feed-x");
        assert_eq!(x.url.as_str(), "https://feeds.example.org/x.csv");

        let tor = catalog.feed_for("tor-exits").await.unwrap().expect("tor-exits");
        assert_eq!(tor.feed_id, "dan-me-uk");
        assert!(!tor.has_header);

        assert!(catalog.feed_for("dan-me-uk").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn missing_manifest_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = ManifestFeedCatalog::new(dir.path().join("absent.json"));
        assert!(catalog.feed_for("feed-x").await.is_err());
    }

    #[tokio::test]
    async fn static_catalog_reflects_inserts() {
        let url = Url::parse("http://localhost/a.csv").unwrap();
        let catalog = StaticFeedCatalog::new().with_feed("feed-x", FeedMetadata::delimited("feed-x", url));
        assert!(catalog.feed_for("feed-x").await.unwrap().is_some());
        assert!(catalog.feed_for("feed-y").await.unwrap().is_none());

        let url = Url::parse("http://localhost/b.csv").unwrap();
        catalog.insert("feed-x", FeedMetadata::delimited("feed-x", url)).await;
        let feed = catalog.feed_for("feed-x").await.unwrap().unwrap();
        assert_eq!(feed.url.path(), "/b.csv");
    }
}
