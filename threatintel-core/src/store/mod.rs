//! Storage port for the document/index store backing job records, leases and
//! indicator data.
//!
//! The engine only needs a narrow slice of a search engine's surface: index
//! lifecycle, bulk writes, shard health, and single-document reads/writes with
//! optimistic concurrency. [`SearchStore`] captures exactly that so the lock
//! service, job store and rotation engine stay backend-agnostic.

pub mod memory;
pub mod opensearch;

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub use memory::InMemorySearchStore;
pub use opensearch::OpenSearchStore;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("index not found: {0}")]
    IndexNotFound(String),

    #[error("document {id} not found in {index}")]
    DocumentNotFound { index: String, id: String },

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("version conflict on {index}/{id}")]
    VersionConflict { index: String, id: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("backend error: {0}")]
    Backend(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Optimistic concurrency token attached to every stored document.
///
/// Mirrors the `(seq_no, primary_term)` pair search engines hand out; a write
/// conditioned on a token only succeeds while the document still carries it.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct DocVersion {
    pub seq_no: u64,
    pub primary_term: u64,
}

impl fmt::Display for DocVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.primary_term, self.seq_no)
    }
}

/// A document together with the version it was read at.
#[derive(Clone, Debug)]
pub struct VersionedDocument {
    pub id: String,
    pub version: DocVersion,
    pub source: Value,
}

/// Precondition applied to a single-document write.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WriteCondition {
    /// Fail with [`StoreError::AlreadyExists`] if the document exists.
    Create,
    /// Fail with [`StoreError::VersionConflict`] unless the stored version matches.
    IfVersion(DocVersion),
    /// Unconditional upsert.
    Overwrite,
}

/// One entry of a bulk write. `id == None` lets the store assign one.
#[derive(Clone, Debug)]
pub struct BulkDocument {
    pub id: Option<String>,
    pub source: Value,
}

/// Settings applied when an index is created.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IndexSpec {
    pub number_of_shards: u32,
    pub number_of_replicas: u32,
    /// `None` disables periodic refresh while the index is being loaded.
    pub refresh_interval: Option<String>,
    pub hidden: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_expand_replicas: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mappings: Option<Value>,
}

impl IndexSpec {
    /// Settings for small system indices (job records, leases).
    pub fn system(mappings: Value) -> Self {
        Self {
            number_of_shards: 1,
            number_of_replicas: 0,
            refresh_interval: Some("1s".to_string()),
            hidden: true,
            auto_expand_replicas: Some("0-all".to_string()),
            mappings: Some(mappings),
        }
    }

    pub fn to_settings_json(&self) -> Value {
        let mut index = serde_json::json!({
            "number_of_shards": self.number_of_shards,
            "number_of_replicas": self.number_of_replicas,
            "hidden": self.hidden,
            "refresh_interval": self.refresh_interval.as_deref().unwrap_or("-1"),
        });
        if let Some(expand) = &self.auto_expand_replicas
            && let Some(obj) = index.as_object_mut()
        {
            obj.insert("auto_expand_replicas".into(), Value::from(expand.clone()));
        }
        serde_json::json!({ "index": index })
    }
}

/// Settings changed on an existing index. Unset fields are left alone.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct IndexSettingsUpdate {
    pub write_blocked: Option<bool>,
    pub auto_expand_replicas: Option<String>,
    pub refresh_interval: Option<String>,
}

impl IndexSettingsUpdate {
    /// Freeze a fully loaded data index: no further writes, replicas everywhere.
    pub fn freeze() -> Self {
        Self {
            write_blocked: Some(true),
            auto_expand_replicas: Some("0-all".to_string()),
            refresh_interval: None,
        }
    }

    pub fn to_settings_json(&self) -> Value {
        let mut index = serde_json::Map::new();
        if let Some(blocked) = self.write_blocked {
            index.insert("blocks.write".into(), Value::from(blocked));
        }
        if let Some(expand) = &self.auto_expand_replicas {
            index.insert("auto_expand_replicas".into(), Value::from(expand.clone()));
        }
        if let Some(refresh) = &self.refresh_interval {
            index.insert("refresh_interval".into(), Value::from(refresh.clone()));
        }
        serde_json::json!({ "index": index })
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum ShardState {
    Started,
    Initializing,
    Relocating,
    Unassigned,
}

impl ShardState {
    pub fn parse(raw: &str) -> Self {
        match raw.to_ascii_uppercase().as_str() {
            "STARTED" => ShardState::Started,
            "INITIALIZING" => ShardState::Initializing,
            "RELOCATING" => ShardState::Relocating,
            _ => ShardState::Unassigned,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ShardStatus {
    pub shard: u32,
    pub primary: bool,
    pub state: ShardState,
}

/// True once every copy of every shard serves reads.
pub fn all_shards_started(shards: &[ShardStatus]) -> bool {
    !shards.is_empty() && shards.iter().all(|s| s.state == ShardState::Started)
}

/// Document/index store used by every engine component.
#[async_trait]
pub trait SearchStore: Send + Sync + fmt::Debug {
    async fn create_index(&self, index: &str, spec: &IndexSpec) -> StoreResult<()>;

    async fn delete_index(&self, index: &str) -> StoreResult<()>;

    async fn index_exists(&self, index: &str) -> StoreResult<bool>;

    /// Writes all documents; the whole call fails if any item is rejected.
    async fn bulk_index(&self, index: &str, docs: Vec<BulkDocument>) -> StoreResult<()>;

    async fn refresh_index(&self, index: &str) -> StoreResult<()>;

    async fn force_merge(&self, index: &str, max_segments: u32) -> StoreResult<()>;

    async fn update_index_settings(
        &self,
        index: &str,
        update: &IndexSettingsUpdate,
    ) -> StoreResult<()>;

    async fn shard_states(&self, index: &str) -> StoreResult<Vec<ShardStatus>>;

    /// `Ok(None)` when either the index or the document is absent.
    async fn get_document(&self, index: &str, id: &str) -> StoreResult<Option<VersionedDocument>>;

    async fn put_document(
        &self,
        index: &str,
        id: &str,
        source: Value,
        condition: WriteCondition,
    ) -> StoreResult<DocVersion>;

    async fn delete_document(
        &self,
        index: &str,
        id: &str,
        expected: Option<DocVersion>,
    ) -> StoreResult<()>;

    /// Every document in `index`. Fails with [`StoreError::IndexNotFound`] if absent.
    async fn search_all(&self, index: &str) -> StoreResult<Vec<VersionedDocument>>;
}
