//! # Threatintel Core
//!
//! Feed-job lifecycle engine for threat-intelligence indicator feeds.
//!
//! A *job* periodically downloads a delimited-text feed and loads its
//! indicators into a search store. Each refresh builds a new generation index
//! next to the one being served, waits until it is fully allocated, and then
//! repoints the job record at it, so readers never observe a half-loaded
//! generation. A lease document per job keeps cooperating nodes from running
//! the same job concurrently.
//!
//! ## Architecture
//!
//! - [`store`]: the narrow search-store port plus in-memory and OpenSearch backends
//! - [`lock`]: cluster-wide lease with throttled renewal and idempotent release
//! - [`jobs`]: persisted job records and their system index
//! - [`feed`]: feed metadata, catalog, HTTP download and delimited-text parsing
//! - [`rotation`]: create, populate, freeze, shard wait, swap and cleanup
//! - [`runner`]: scheduler callback and state machine; [`admin`] holds the
//!   user-initiated operations
//! - [`config`]: engine tuning knobs
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use threatintel_core::{
//!     EngineConfig, InMemorySearchStore, JobParameterHandle, JobRunner, Schedule,
//!     StaticFeedCatalog, feed::FeedMetadata,
//! };
//!
//! async fn bootstrap() -> threatintel_core::Result<()> {
//!     let url = url::Url::parse("https://feeds.example.org/feed-x.csv").expect("static url");
//!     let catalog = StaticFeedCatalog::new().with_feed("feed-x", FeedMetadata::delimited("feed-x", url));
//!     let runner = Arc::new(JobRunner::new(
//!         Arc::new(InMemorySearchStore::new()),
//!         Arc::new(catalog),
//!         EngineConfig::default(),
//!     )?);
//!
//!     runner.create_job("feed-x", Schedule::days(1)).await?.wait().await;
//!     let outcome = runner.run_job(JobParameterHandle::new("feed-x")).wait().await;
//!     println!("scheduled run finished: {outcome:?}");
//!     Ok(())
//! }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![allow(missing_docs)]

/// Administrative job operations (create, get, update, delete, refresh)
pub mod admin;

/// Engine configuration
pub mod config;

/// Error types and the crate-wide `Result`
pub mod error;

/// Feed metadata, catalog and download
pub mod feed;

/// Job records and their persistence
pub mod jobs;

/// Distributed job lease
pub mod lock;

/// Index rotation engine
pub mod rotation;

/// Scheduler entry point and lifecycle state machine
pub mod runner;

/// Search store port and backends
pub mod store;

pub use admin::{JobSelector, UpdateJobRequest};
pub use config::EngineConfig;
pub use error::{FeedJobError, Result};
pub use feed::{FeedCatalog, ManifestFeedCatalog, StaticFeedCatalog};
pub use jobs::{IntervalUnit, JobRecord, JobState, Schedule};
pub use lock::{LockModel, LockService};
pub use runner::{JobParameterHandle, JobRunner, RunHandle, RunOutcome};
pub use store::{InMemorySearchStore, OpenSearchStore, SearchStore};
