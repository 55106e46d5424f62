//! Blue/green rotation of a job's indicator index.
//!
//! A rotation builds the next generation in a fresh index, freezes it, waits
//! for every shard copy to start and only then repoints the job record. The
//! record persist is the swap: readers follow `JobRecord::current_index` and
//! therefore never see a half-loaded generation. Indices the record no longer
//! points at are removed afterwards on a best-effort basis.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use futures::StreamExt;
use serde_json::json;
use tracing::{debug, info, trace, warn};

use crate::config::RotationConfig;
use crate::error::{FeedJobError, Result};
use crate::feed::{FeedFetcher, FeedMetadata, validate_header_superset};
use crate::jobs::{JobRecord, JobState, JobStore};
use crate::lock::{RenewLock, keep_alive};
use crate::store::{
    BulkDocument, IndexSettingsUpdate, IndexSpec, SearchStore, StoreError, all_shards_started,
};

const FIRST_SUFFIX: &str = "-1";
const SECOND_SUFFIX: &str = "-2";

/// Name shared by both generations of a job's data index.
pub fn data_index_base(prefix: &str, job: &str, feed_id: &str) -> String {
    if job == feed_id {
        format!("{prefix}{job}")
    } else {
        format!("{prefix}{job}-{feed_id}")
    }
}

/// Both physical index names a job can own under `base`.
pub fn generation_names(base: &str) -> [String; 2] {
    [format!("{base}{FIRST_SUFFIX}"), format!("{base}{SECOND_SUFFIX}")]
}

/// Alternates between the `-1` and `-2` generation of `base`, so at most two
/// physical indices exist per feed.
pub fn next_index_name(base: &str, current: Option<&str>) -> String {
    let first = format!("{base}{FIRST_SUFFIX}");
    if current == Some(first.as_str()) {
        format!("{base}{SECOND_SUFFIX}")
    } else {
        first
    }
}

/// Result of a successful rotation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RotationReport {
    pub index: String,
    pub rows_indexed: u64,
    pub rows_skipped: u64,
    pub processing_millis: u64,
}

struct Generation {
    index: String,
    fields: Vec<String>,
    rows_indexed: u64,
    rows_skipped: u64,
}

#[derive(Clone, Debug)]
pub struct RotationEngine {
    store: Arc<dyn SearchStore>,
    jobs: JobStore,
    fetcher: FeedFetcher,
    config: RotationConfig,
}

impl RotationEngine {
    pub fn new(
        store: Arc<dyn SearchStore>,
        jobs: JobStore,
        fetcher: FeedFetcher,
        config: RotationConfig,
    ) -> Self {
        Self {
            store,
            jobs,
            fetcher,
            config,
        }
    }

    pub fn fetcher(&self) -> &FeedFetcher {
        &self.fetcher
    }

    /// Loads `feed` into the next generation and swaps it in.
    ///
    /// `record` is only modified once the swap has been persisted; on any
    /// earlier failure it still describes the previous generation. The lease
    /// is renewed on a timer while the feed is downloaded and the generation
    /// is built, and on every poll while shards start.
    pub async fn rotate(
        &self,
        record: &mut JobRecord,
        feed: &FeedMetadata,
        renew: &dyn RenewLock,
    ) -> Result<RotationReport> {
        let started = Instant::now();
        let Generation {
            index,
            fields,
            rows_indexed,
            rows_skipped,
        } = keep_alive(renew, self.build_generation(record, feed)).await?;
        self.wait_for_shards(&index, renew).await?;

        let processing_millis = started.elapsed().as_millis() as u64;
        let mut swapped = record.clone();
        swapped.push_current_index(&index);
        swapped.feed_fields = fields;
        swapped.record_success(processing_millis);
        swapped.state = JobState::Available;
        swapped.enable();
        self.jobs.update(&mut swapped).await?;
        *record = swapped;
        info!(
            job = %record.name,
            index = %index,
            rows_indexed,
            rows_skipped,
            processing_millis,
            "rotation swapped current index"
        );

        self.cleanup(record).await;

        Ok(RotationReport {
            index,
            rows_indexed,
            rows_skipped,
            processing_millis,
        })
    }

    /// Deletes every index in `indices`; missing ones count as deleted.
    /// All deletions are attempted, the first failure is returned.
    pub async fn delete_indices(&self, indices: &[String]) -> Result<()> {
        let mut first_error = None;
        for index in indices {
            match self.store.delete_index(index).await {
                Ok(()) => debug!(index = %index, "deleted data index"),
                Err(StoreError::IndexNotFound(_)) => trace!(index = %index, "data index already gone"),
                Err(err) => {
                    warn!(index = %index, "failed to delete data index: {err}");
                    first_error.get_or_insert(err);
                }
            }
        }
        match first_error {
            Some(err) => Err(err.into()),
            None => Ok(()),
        }
    }

    /// Everything up to the shard wait: fetch, header gate, create, populate,
    /// freeze.
    async fn build_generation(&self, record: &JobRecord, feed: &FeedMetadata) -> Result<Generation> {
        let reader = self.fetcher.open(feed).await?;
        validate_header_superset(&record.feed_fields, reader.fields())?;

        let base = data_index_base(&self.config.data_index_prefix, &record.name, &feed.feed_id);
        let index = next_index_name(&base, record.current_index());
        self.reclaim_orphan(record, &index).await?;
        self.create_data_index(&index).await?;

        let (fields, rows) = reader.into_parts();
        let (rows_indexed, rows_skipped) = self.populate(&index, feed, rows).await?;
        self.freeze(&index).await?;
        Ok(Generation {
            index,
            fields,
            rows_indexed,
            rows_skipped,
        })
    }

    /// A same-named index left by an aborted cycle is never read from, so it
    /// is dropped rather than appended to.
    async fn reclaim_orphan(&self, record: &JobRecord, index: &str) -> Result<()> {
        if record.current_index() == Some(index) || !self.store.index_exists(index).await? {
            return Ok(());
        }
        info!(job = %record.name, index, "reclaiming index left by an earlier cycle");
        match self.store.delete_index(index).await {
            Ok(()) | Err(StoreError::IndexNotFound(_)) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn create_data_index(&self, index: &str) -> Result<()> {
        let spec = IndexSpec {
            number_of_shards: 1,
            number_of_replicas: 0,
            refresh_interval: None,
            hidden: true,
            auto_expand_replicas: None,
            mappings: Some(json!({
                "dynamic": "false",
                "properties": {
                    "ioc_type": { "type": "keyword" },
                    "ioc_value": { "type": "keyword" },
                    "feed_id": { "type": "keyword" },
                    "timestamp": { "type": "date", "format": "epoch_millis" },
                }
            })),
        };
        match self.store.create_index(index, &spec).await {
            Ok(()) => {
                debug!(index, "created data index");
                Ok(())
            }
            Err(StoreError::AlreadyExists(_)) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn populate(
        &self,
        index: &str,
        feed: &FeedMetadata,
        mut rows: crate::feed::fetch::RowStream,
    ) -> Result<(u64, u64)> {
        let batch_size = self.config.batch_size.max(1);
        let timestamp = Utc::now().timestamp_millis();
        let mut batch = Vec::with_capacity(batch_size);
        let mut indexed = 0u64;
        let mut skipped = 0u64;

        while let Some(row) = rows.next().await {
            let row = row?;
            let Some(value) = row.indicator(feed.indicator_column) else {
                skipped += 1;
                continue;
            };
            batch.push(BulkDocument {
                id: None,
                source: json!({
                    "ioc_type": feed.indicator_type,
                    "ioc_value": value,
                    "feed_id": feed.feed_id,
                    "timestamp": timestamp,
                }),
            });
            if batch.len() >= batch_size {
                indexed += batch.len() as u64;
                self.store
                    .bulk_index(index, std::mem::replace(&mut batch, Vec::with_capacity(batch_size)))
                    .await?;
                trace!(index, indexed, "bulk batch written");
            }
        }
        if !batch.is_empty() {
            indexed += batch.len() as u64;
            self.store.bulk_index(index, batch).await?;
        }
        if skipped > 0 {
            debug!(index, skipped, "rows without an indicator value were skipped");
        }
        Ok((indexed, skipped))
    }

    /// Makes the generation read-only and lets replicas spread before it is
    /// served.
    async fn freeze(&self, index: &str) -> Result<()> {
        self.store.refresh_index(index).await?;
        self.store.force_merge(index, 1).await?;
        self.store
            .update_index_settings(index, &IndexSettingsUpdate::freeze())
            .await?;
        Ok(())
    }

    /// Polls shard allocation until every copy has started. This is the one
    /// sleep in the pipeline and it is bounded by `shard_wait_timeout`.
    pub async fn wait_for_shards(&self, index: &str, renew: &dyn RenewLock) -> Result<()> {
        let timeout = self.config.shard_wait_timeout();
        let poll = self.config.shard_poll_interval();
        let started = tokio::time::Instant::now();

        loop {
            let shards = self.store.shard_states(index).await?;
            if all_shards_started(&shards) {
                debug!(index, waited_ms = started.elapsed().as_millis() as u64, "all shards started");
                return Ok(());
            }
            if started.elapsed() >= timeout {
                return Err(FeedJobError::ShardTimeout {
                    index: index.to_string(),
                    waited_ms: started.elapsed().as_millis() as u64,
                });
            }
            trace!(index, copies = shards.len(), "waiting for shards");
            renew.renew_lock().await;
            tokio::time::sleep(poll).await;
        }
    }

    /// Drops every non-current index of `record`. Failures stay in the list
    /// and are retried by the next rotation.
    async fn cleanup(&self, record: &mut JobRecord) {
        let Some(current) = record.current_index().map(str::to_string) else {
            return;
        };
        let stale: Vec<String> = record
            .indices
            .iter()
            .filter(|index| **index != current)
            .cloned()
            .collect();
        if stale.is_empty() {
            return;
        }

        let mut retained = Vec::new();
        for index in stale {
            match self.store.delete_index(&index).await {
                Ok(()) | Err(StoreError::IndexNotFound(_)) => {
                    debug!(job = %record.name, index = %index, "removed previous generation");
                }
                Err(err) => {
                    warn!(job = %record.name, index = %index, "cleanup deferred to next cycle: {err}");
                    retained.push(index);
                }
            }
        }
        retained.push(current);
        record.indices = retained;

        if let Err(err) = self.jobs.update(record).await {
            warn!(job = %record.name, "failed to persist pruned index list: {err}");
        }
    }
}
