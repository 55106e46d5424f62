use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tracing::{debug, warn};

use super::record::JobRecord;
use crate::error::{FeedJobError, Result};
use crate::store::{IndexSpec, SearchStore, StoreError, VersionedDocument, WriteCondition};

/// CRUD over job records kept in one dedicated system index.
///
/// Writes replace the whole document; callers do read-modify-write while
/// holding the job's lease.
#[derive(Clone)]
pub struct JobStore {
    store: Arc<dyn SearchStore>,
    index: String,
}

impl fmt::Debug for JobStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobStore").field("index", &self.index).finish()
    }
}

impl JobStore {
    pub fn new(store: Arc<dyn SearchStore>, index: impl Into<String>) -> Self {
        Self {
            store,
            index: index.into(),
        }
    }

    pub fn index(&self) -> &str {
        &self.index
    }

    /// Idempotent; losing a creation race to another node counts as success.
    pub async fn create_index_if_absent(&self) -> Result<()> {
        if self.store.index_exists(&self.index).await? {
            return Ok(());
        }
        let spec = IndexSpec::system(json!({
            "dynamic": "strict",
            "properties": {
                "name": { "type": "keyword" },
                "state": { "type": "keyword" },
                "schedule": {
                    "properties": {
                        "period": { "type": "long" },
                        "unit": { "type": "keyword" },
                        "start_time": { "type": "date", "format": "epoch_millis" },
                    }
                },
                "update_enabled": { "type": "boolean" },
                "enabled_time": { "type": "date", "format": "epoch_millis" },
                "indices": { "type": "keyword" },
                "update_stats": {
                    "properties": {
                        "last_succeeded_at": { "type": "date", "format": "epoch_millis" },
                        "last_failed_at": { "type": "date", "format": "epoch_millis" },
                        "last_skipped_at": { "type": "date", "format": "epoch_millis" },
                        "last_processing_time_in_millis": { "type": "long" },
                    }
                },
                "last_update_time": { "type": "date", "format": "epoch_millis" },
                "schema_version": { "type": "integer" },
                "feed_fields": { "type": "keyword" },
            }
        }));
        match self.store.create_index(&self.index, &spec).await {
            Ok(()) => {
                debug!(index = %self.index, "created job record index");
                Ok(())
            }
            Err(StoreError::AlreadyExists(_)) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn get(&self, name: &str) -> Result<Option<JobRecord>> {
        match self.store.get_document(&self.index, name).await? {
            Some(doc) => Ok(Some(Self::decode(doc)?)),
            None => Ok(None),
        }
    }

    /// Records for the given names, skipping any that do not exist.
    pub async fn get_all(&self, names: &[String]) -> Result<Vec<JobRecord>> {
        let mut records = Vec::with_capacity(names.len());
        for name in names {
            if let Some(record) = self.get(name).await? {
                records.push(record);
            }
        }
        Ok(records)
    }

    /// Every stored record; an absent index simply means no jobs yet.
    pub async fn list(&self) -> Result<Vec<JobRecord>> {
        let docs = match self.store.search_all(&self.index).await {
            Ok(docs) => docs,
            Err(StoreError::IndexNotFound(_)) => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut records = Vec::with_capacity(docs.len());
        for doc in docs {
            let id = doc.id.clone();
            match Self::decode(doc) {
                Ok(record) => records.push(record),
                Err(err) => warn!(index = %self.index, id = %id, "skipping undecodable job record: {err}"),
            }
        }
        records.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(records)
    }

    /// Creates the record; fails if one with the same name exists.
    pub async fn put(&self, record: &mut JobRecord) -> Result<()> {
        record.last_update_time = Utc::now();
        let source = serde_json::to_value(&*record)?;
        match self
            .store
            .put_document(&self.index, &record.name, source, WriteCondition::Create)
            .await
        {
            Ok(_) => Ok(()),
            Err(StoreError::AlreadyExists(_)) => Err(FeedJobError::AlreadyExists(format!(
                "job {} already exists",
                record.name
            ))),
            Err(err) => Err(err.into()),
        }
    }

    /// Overwrites the full record and bumps `last_update_time`.
    pub async fn update(&self, record: &mut JobRecord) -> Result<()> {
        record.last_update_time = Utc::now();
        let source = serde_json::to_value(&*record)?;
        self.store
            .put_document(&self.index, &record.name, source, WriteCondition::Overwrite)
            .await?;
        Ok(())
    }

    pub async fn delete(&self, name: &str) -> Result<()> {
        match self.store.delete_document(&self.index, name, None).await {
            Ok(()) => Ok(()),
            Err(StoreError::DocumentNotFound { .. }) | Err(StoreError::IndexNotFound(_)) => {
                Err(FeedJobError::NotFound(format!("job {name}")))
            }
            Err(err) => Err(err.into()),
        }
    }

    fn decode(doc: VersionedDocument) -> Result<JobRecord> {
        Ok(serde_json::from_value(doc.source)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{JobState, Schedule};
    use crate::store::InMemorySearchStore;

    fn job_store() -> (InMemorySearchStore, JobStore) {
        let memory = InMemorySearchStore::new();
        let jobs = JobStore::new(Arc::new(memory.clone()), ".jobs");
        (memory, jobs)
    }

    #[tokio::test]
    async fn reads_before_index_exists_are_empty() {
        let (_, jobs) = job_store();
        assert!(jobs.list().await.unwrap().is_empty());
        assert!(jobs.get("feed-x").await.unwrap().is_none());
        assert!(jobs.get_all(&["feed-x".into()]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn create_index_is_idempotent() {
        let (memory, jobs) = job_store();
        jobs.create_index_if_absent().await.unwrap();
        jobs.create_index_if_absent().await.unwrap();
        assert_eq!(memory.index_names().await, vec![".jobs".to_string()]);
    }

    #[tokio::test]
    async fn put_refuses_duplicates_and_update_overwrites() {
        let (_, jobs) = job_store();
        jobs.create_index_if_absent().await.unwrap();

        let mut record = JobRecord::new("feed-x", Schedule::days(1));
        jobs.put(&mut record).await.unwrap();
        let mut duplicate = JobRecord::new("feed-x", Schedule::days(2));
        let err = jobs.put(&mut duplicate).await.expect_err("duplicate");
        assert!(matches!(err, FeedJobError::AlreadyExists(_)));

        let before = record.last_update_time;
        record.state = JobState::Available;
        jobs.update(&mut record).await.unwrap();
        assert!(record.last_update_time >= before);

        let stored = jobs.get("feed-x").await.unwrap().expect("stored");
        assert_eq!(stored.state, JobState::Available);
        assert_eq!(stored.schedule.period, 1);
    }

    #[tokio::test]
    async fn get_all_skips_unknown_names() {
        let (_, jobs) = job_store();
        jobs.create_index_if_absent().await.unwrap();
        jobs.put(&mut JobRecord::new("b", Schedule::days(1))).await.unwrap();
        jobs.put(&mut JobRecord::new("a", Schedule::days(1))).await.unwrap();

        let found = jobs
            .get_all(&["a".into(), "missing".into()])
            .await
            .unwrap();
        assert_eq!(found.len(), 1);

        let names: Vec<_> = jobs.list().await.unwrap().into_iter().map(|r| r.name).collect();
        assert_eq!(names, vec!["a", "b"]);

        jobs.delete("a").await.unwrap();
        assert!(matches!(jobs.delete("a").await, Err(FeedJobError::NotFound(_))));
    }
}
