use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{
    BulkDocument, DocVersion, IndexSettingsUpdate, IndexSpec, SearchStore, ShardState,
    ShardStatus, StoreError, StoreResult, VersionedDocument, WriteCondition,
};

const PRIMARY_TERM: u64 = 1;

/// Process-local store with the same concurrency semantics as the HTTP
/// backend: conditional writes are checked and applied under one lock, so
/// concurrent callers observe a single winner.
///
/// Also carries switches that make individual operations fail, which the
/// lifecycle tests use to drive the rotation failure paths.
#[derive(Clone, Default)]
pub struct InMemorySearchStore {
    state: Arc<Mutex<MemoryState>>,
}

impl fmt::Debug for InMemorySearchStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("InMemorySearchStore");
        match self.state.try_lock() {
            Ok(state) => {
                debug
                    .field("indices", &state.indices.len())
                    .field("seq_no", &state.seq_no)
                    .field("faults", &state.faults);
            }
            Err(_) => {
                debug.field("state", &"<locked>");
            }
        }
        debug.finish()
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    indices: BTreeMap<String, MemoryIndex>,
    seq_no: u64,
    faults: Faults,
}

impl MemoryState {
    fn next_version(&mut self) -> DocVersion {
        self.seq_no += 1;
        DocVersion {
            seq_no: self.seq_no,
            primary_term: PRIMARY_TERM,
        }
    }
}

#[derive(Debug, Default)]
struct Faults {
    create_index: HashSet<String>,
    delete_index: HashSet<String>,
    bulk_index: HashSet<String>,
    stalled_shards: HashSet<String>,
}

#[derive(Debug)]
struct MemoryIndex {
    docs: BTreeMap<String, StoredDoc>,
    write_blocked: bool,
    replicas_expanded: bool,
}

impl MemoryIndex {
    fn new(spec: Option<&IndexSpec>) -> Self {
        Self {
            docs: BTreeMap::new(),
            write_blocked: false,
            replicas_expanded: spec.is_some_and(|s| s.auto_expand_replicas.is_some()),
        }
    }
}

#[derive(Debug, Clone)]
struct StoredDoc {
    version: DocVersion,
    source: Value,
}

impl InMemorySearchStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `create_index(index)` fail until cleared.
    pub async fn fail_index_creation(&self, index: &str) {
        self.state.lock().await.faults.create_index.insert(index.to_string());
    }

    /// Makes `delete_index(index)` fail until cleared.
    pub async fn fail_index_deletion(&self, index: &str) {
        self.state.lock().await.faults.delete_index.insert(index.to_string());
    }

    /// Makes `bulk_index(index, ..)` fail until cleared.
    pub async fn fail_bulk_writes(&self, index: &str) {
        self.state.lock().await.faults.bulk_index.insert(index.to_string());
    }

    /// Keeps every shard of `index` initializing until cleared.
    pub async fn stall_shards(&self, index: &str) {
        self.state.lock().await.faults.stalled_shards.insert(index.to_string());
    }

    pub async fn clear_faults(&self) {
        self.state.lock().await.faults = Faults::default();
    }

    pub async fn index_names(&self) -> Vec<String> {
        self.state.lock().await.indices.keys().cloned().collect()
    }

    pub async fn doc_count(&self, index: &str) -> usize {
        self.state
            .lock()
            .await
            .indices
            .get(index)
            .map(|idx| idx.docs.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl SearchStore for InMemorySearchStore {
    async fn create_index(&self, index: &str, spec: &IndexSpec) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        if state.faults.create_index.contains(index) {
            return Err(StoreError::Backend(format!("injected create failure for {index}")));
        }
        if state.indices.contains_key(index) {
            return Err(StoreError::AlreadyExists(index.to_string()));
        }
        state.indices.insert(index.to_string(), MemoryIndex::new(Some(spec)));
        Ok(())
    }

    async fn delete_index(&self, index: &str) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        if state.faults.delete_index.contains(index) {
            return Err(StoreError::Backend(format!("injected delete failure for {index}")));
        }
        state
            .indices
            .remove(index)
            .map(|_| ())
            .ok_or_else(|| StoreError::IndexNotFound(index.to_string()))
    }

    async fn index_exists(&self, index: &str) -> StoreResult<bool> {
        Ok(self.state.lock().await.indices.contains_key(index))
    }

    async fn bulk_index(&self, index: &str, docs: Vec<BulkDocument>) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        if state.faults.bulk_index.contains(index) {
            return Err(StoreError::Backend(format!("injected bulk failure for {index}")));
        }
        match state.indices.get(index) {
            None => return Err(StoreError::IndexNotFound(index.to_string())),
            Some(idx) if idx.write_blocked => {
                return Err(StoreError::Backend(format!("index {index} is write-blocked")));
            }
            Some(_) => {}
        }

        for doc in docs {
            let version = state.next_version();
            let id = doc.id.unwrap_or_else(|| Uuid::now_v7().to_string());
            if let Some(idx) = state.indices.get_mut(index) {
                idx.docs.insert(
                    id,
                    StoredDoc {
                        version,
                        source: doc.source,
                    },
                );
            }
        }
        Ok(())
    }

    async fn refresh_index(&self, index: &str) -> StoreResult<()> {
        if self.index_exists(index).await? {
            Ok(())
        } else {
            Err(StoreError::IndexNotFound(index.to_string()))
        }
    }

    async fn force_merge(&self, index: &str, _max_segments: u32) -> StoreResult<()> {
        self.refresh_index(index).await
    }

    async fn update_index_settings(
        &self,
        index: &str,
        update: &IndexSettingsUpdate,
    ) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        let idx = state
            .indices
            .get_mut(index)
            .ok_or_else(|| StoreError::IndexNotFound(index.to_string()))?;
        if let Some(blocked) = update.write_blocked {
            idx.write_blocked = blocked;
        }
        if update.auto_expand_replicas.is_some() {
            idx.replicas_expanded = true;
        }
        Ok(())
    }

    async fn shard_states(&self, index: &str) -> StoreResult<Vec<ShardStatus>> {
        let state = self.state.lock().await;
        let idx = state
            .indices
            .get(index)
            .ok_or_else(|| StoreError::IndexNotFound(index.to_string()))?;
        let copy_state = if state.faults.stalled_shards.contains(index) {
            ShardState::Initializing
        } else {
            ShardState::Started
        };

        let mut shards = vec![ShardStatus {
            shard: 0,
            primary: true,
            state: copy_state,
        }];
        if idx.replicas_expanded {
            shards.push(ShardStatus {
                shard: 0,
                primary: false,
                state: copy_state,
            });
        }
        Ok(shards)
    }

    async fn get_document(&self, index: &str, id: &str) -> StoreResult<Option<VersionedDocument>> {
        let state = self.state.lock().await;
        Ok(state
            .indices
            .get(index)
            .and_then(|idx| idx.docs.get(id))
            .map(|doc| VersionedDocument {
                id: id.to_string(),
                version: doc.version,
                source: doc.source.clone(),
            }))
    }

    async fn put_document(
        &self,
        index: &str,
        id: &str,
        source: Value,
        condition: WriteCondition,
    ) -> StoreResult<DocVersion> {
        let mut state = self.state.lock().await;
        let existing = state
            .indices
            .get(index)
            .and_then(|idx| idx.docs.get(id))
            .map(|doc| doc.version);

        match (condition, existing) {
            (WriteCondition::Create, Some(_)) => {
                return Err(StoreError::AlreadyExists(format!("{index}/{id}")));
            }
            (WriteCondition::IfVersion(expected), current) if current != Some(expected) => {
                return Err(StoreError::VersionConflict {
                    index: index.to_string(),
                    id: id.to_string(),
                });
            }
            _ => {}
        }

        if state.indices.get(index).is_some_and(|idx| idx.write_blocked) {
            return Err(StoreError::Backend(format!("index {index} is write-blocked")));
        }
        let version = state.next_version();
        state
            .indices
            .entry(index.to_string())
            .or_insert_with(|| MemoryIndex::new(None))
            .docs
            .insert(id.to_string(), StoredDoc { version, source });
        Ok(version)
    }

    async fn delete_document(
        &self,
        index: &str,
        id: &str,
        expected: Option<DocVersion>,
    ) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        let not_found = || StoreError::DocumentNotFound {
            index: index.to_string(),
            id: id.to_string(),
        };
        let idx = state.indices.get_mut(index).ok_or_else(not_found)?;
        let current = idx.docs.get(id).map(|doc| doc.version).ok_or_else(not_found)?;
        if let Some(expected) = expected
            && expected != current
        {
            return Err(StoreError::VersionConflict {
                index: index.to_string(),
                id: id.to_string(),
            });
        }
        idx.docs.remove(id);
        Ok(())
    }

    async fn search_all(&self, index: &str) -> StoreResult<Vec<VersionedDocument>> {
        let state = self.state.lock().await;
        let idx = state
            .indices
            .get(index)
            .ok_or_else(|| StoreError::IndexNotFound(index.to_string()))?;
        Ok(idx
            .docs
            .iter()
            .map(|(id, doc)| VersionedDocument {
                id: id.clone(),
                version: doc.version,
                source: doc.source.clone(),
            })
            .collect())
    }
}
