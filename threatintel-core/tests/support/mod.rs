#![allow(dead_code)]

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use mockito::{Mock, Server, ServerGuard};
use threatintel_core::{
    EngineConfig, InMemorySearchStore, JobRecord, JobRunner, Schedule, StaticFeedCatalog,
    feed::FeedMetadata,
};
use url::Url;

pub const FEED_V1: &str = "ip,tag\n1.2.3.4,bad\n5.6.7.8,bad";
pub const FEED_V2: &str = "# refreshed hourly\nip,tag,first_seen\n1.2.3.4,bad,2024-01-01\n5.6.7.8,bad,2024-01-02\n9.9.9.9,c2,2024-01-03\n10.0.0.1,scanner,2024-01-04\n";

pub struct Harness {
    pub server: ServerGuard,
    pub store: InMemorySearchStore,
    pub catalog: Arc<StaticFeedCatalog>,
    pub runner: Arc<JobRunner>,
    mocks: Vec<Mock>,
}

pub fn test_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.rotation.batch_size = 2;
    config.rotation.shard_wait_timeout_ms = 200;
    config.rotation.shard_poll_interval_ms = 20;
    config
}

/// Shortest lease the config accepts; a few seconds of slow work outlives it.
pub fn short_lease_config() -> EngineConfig {
    let mut config = test_config();
    config.lock.lock_duration_secs = 2;
    config.lock.renew_after_secs = 1;
    config.rotation.batch_size = 100;
    config
}

pub async fn harness() -> Harness {
    harness_with(test_config()).await
}

pub async fn harness_with(config: EngineConfig) -> Harness {
    let server = Server::new_async().await;
    let store = InMemorySearchStore::new();
    let catalog = Arc::new(StaticFeedCatalog::new());
    let runner = JobRunner::new(Arc::new(store.clone()), catalog.clone(), config)
        .expect("valid test config");
    Harness {
        server,
        store,
        catalog,
        runner: Arc::new(runner),
        mocks: Vec::new(),
    }
}

impl Harness {
    pub fn feed_at(&self, path: &str) -> FeedMetadata {
        let url = Url::parse(&format!("{}{path}", self.server.url())).expect("mock url");
        FeedMetadata::delimited("feed-x", url)
    }

    /// Serves `body` at `path` and points `feed-x` at it.
    pub async fn publish(&mut self, path: &str, body: &str) {
        let mock = self
            .server
            .mock("GET", path)
            .with_status(200)
            .with_header("content-type", "text/csv")
            .with_body(body)
            .create_async()
            .await;
        self.mocks.push(mock);
        self.catalog.insert("feed-x", self.feed_at(path)).await;
    }

    /// Serves `header` at once, then each of `rows` after `delay`, and points
    /// `feed-x` at it.
    pub async fn publish_slowly(&mut self, path: &str, header: &str, rows: &[&str], delay: Duration) {
        let header = format!("{header}\n");
        let rows: Vec<String> = rows.iter().map(|row| format!("{row}\n")).collect();
        let mock = self
            .server
            .mock("GET", path)
            .with_status(200)
            .with_header("content-type", "text/csv")
            .with_chunked_body(move |w| {
                w.write_all(header.as_bytes())?;
                w.flush()?;
                for row in &rows {
                    std::thread::sleep(delay);
                    w.write_all(row.as_bytes())?;
                    w.flush()?;
                }
                Ok(())
            })
            .create_async()
            .await;
        self.mocks.push(mock);
        self.catalog.insert("feed-x", self.feed_at(path)).await;
    }

    /// Points `feed-x` at a path nothing answers.
    pub async fn break_feed(&self) {
        self.catalog.insert("feed-x", self.feed_at("/unreachable.csv")).await;
    }

    pub async fn record(&self) -> JobRecord {
        self.runner
            .jobs()
            .get("feed-x")
            .await
            .expect("job store reachable")
            .expect("feed-x exists")
    }

    /// Creates `feed-x` from `FEED_V1` and waits for the first load.
    pub async fn create_available(&mut self) -> JobRecord {
        self.publish("/v1.csv", FEED_V1).await;
        let outcome = self
            .runner
            .create_job("feed-x", Schedule::days(1))
            .await
            .expect("create accepted")
            .wait()
            .await;
        assert!(
            matches!(outcome, threatintel_core::RunOutcome::Refreshed { .. }),
            "initial load failed: {outcome:?}"
        );
        self.record().await
    }

    pub async fn feed_x_indices(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .store
            .index_names()
            .await
            .into_iter()
            .filter(|name| name.starts_with("feed-x-"))
            .collect();
        names.sort();
        names
    }
}
