use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, trace};
use url::Url;

use super::{
    BulkDocument, DocVersion, IndexSettingsUpdate, IndexSpec, SearchStore, ShardState,
    ShardStatus, StoreError, StoreResult, VersionedDocument, WriteCondition,
};

const SEARCH_PAGE_SIZE: usize = 1_000;

/// [`SearchStore`] speaking the OpenSearch REST API over `reqwest`.
#[derive(Clone)]
pub struct OpenSearchStore {
    client: Client,
    base: Url,
}

impl fmt::Debug for OpenSearchStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenSearchStore")
            .field("base", &self.base.as_str())
            .finish()
    }
}

#[derive(Debug, Deserialize)]
struct GetDocResponse {
    #[serde(default)]
    found: bool,
    #[serde(rename = "_seq_no")]
    seq_no: Option<u64>,
    #[serde(rename = "_primary_term")]
    primary_term: Option<u64>,
    #[serde(rename = "_source")]
    source: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct WriteDocResponse {
    #[serde(rename = "_seq_no")]
    seq_no: u64,
    #[serde(rename = "_primary_term")]
    primary_term: u64,
}

#[derive(Debug, Deserialize)]
struct CatShard {
    shard: String,
    prirep: String,
    state: String,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    hits: SearchHits,
}

#[derive(Debug, Deserialize)]
struct SearchHits {
    hits: Vec<SearchHit>,
}

#[derive(Debug, Deserialize)]
struct SearchHit {
    #[serde(rename = "_id")]
    id: String,
    #[serde(rename = "_seq_no")]
    seq_no: Option<u64>,
    #[serde(rename = "_primary_term")]
    primary_term: Option<u64>,
    #[serde(rename = "_source")]
    source: Value,
    #[serde(default)]
    sort: Vec<Value>,
}

impl OpenSearchStore {
    pub fn new(base: Url, request_timeout: Duration) -> StoreResult<Self> {
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| StoreError::Transport(format!("failed to build HTTP client: {e}")))?;
        Ok(Self::with_client(client, base))
    }

    pub fn with_client(client: Client, mut base: Url) -> Self {
        // Relative joins drop the last path segment unless it ends in '/'.
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        Self { client, base }
    }

    fn url(&self, path: &str) -> StoreResult<Url> {
        self.base
            .join(path)
            .map_err(|e| StoreError::Backend(format!("invalid store path {path}: {e}")))
    }

    fn request(&self, method: Method, path: &str) -> StoreResult<RequestBuilder> {
        Ok(self.client.request(method, self.url(path)?))
    }

    async fn send(&self, builder: RequestBuilder) -> StoreResult<Response> {
        builder
            .send()
            .await
            .map_err(|e| StoreError::Transport(e.to_string()))
    }

    async fn json_body(response: Response) -> StoreResult<Value> {
        response
            .json::<Value>()
            .await
            .map_err(|e| StoreError::Backend(format!("invalid response body: {e}")))
    }

    /// Maps a non-success response to a [`StoreError`], keeping the server's
    /// error type so callers can tell "exists" and "missing" apart.
    async fn into_error(response: Response, index: &str, id: Option<&str>) -> StoreError {
        let status = response.status();
        let body = response.json::<Value>().await.unwrap_or(Value::Null);
        let error_type = body["error"]["type"].as_str().unwrap_or_default().to_string();

        match (status, error_type.as_str()) {
            (_, "resource_already_exists_exception") => StoreError::AlreadyExists(index.to_string()),
            (_, "index_not_found_exception") => StoreError::IndexNotFound(index.to_string()),
            (StatusCode::CONFLICT, _) => match id {
                Some(id) => StoreError::VersionConflict {
                    index: index.to_string(),
                    id: id.to_string(),
                },
                None => StoreError::AlreadyExists(index.to_string()),
            },
            (StatusCode::NOT_FOUND, _) => match id {
                Some(id) => StoreError::DocumentNotFound {
                    index: index.to_string(),
                    id: id.to_string(),
                },
                None => StoreError::IndexNotFound(index.to_string()),
            },
            _ => StoreError::Backend(format!("{status} on {index}: {body}")),
        }
    }

    async fn expect_success(&self, builder: RequestBuilder, index: &str) -> StoreResult<Value> {
        let response = self.send(builder).await?;
        if response.status().is_success() {
            Self::json_body(response).await
        } else {
            Err(Self::into_error(response, index, None).await)
        }
    }
}

#[async_trait]
impl SearchStore for OpenSearchStore {
    async fn create_index(&self, index: &str, spec: &IndexSpec) -> StoreResult<()> {
        let mut body = json!({ "settings": spec.to_settings_json() });
        if let Some(mappings) = &spec.mappings {
            body["mappings"] = mappings.clone();
        }
        let builder = self.request(Method::PUT, index)?.json(&body);
        self.expect_success(builder, index).await?;
        debug!(index, "created index");
        Ok(())
    }

    async fn delete_index(&self, index: &str) -> StoreResult<()> {
        let builder = self.request(Method::DELETE, index)?;
        self.expect_success(builder, index).await?;
        debug!(index, "deleted index");
        Ok(())
    }

    async fn index_exists(&self, index: &str) -> StoreResult<bool> {
        let response = self.send(self.request(Method::HEAD, index)?).await?;
        match response.status() {
            status if status.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            status => Err(StoreError::Backend(format!("{status} probing {index}"))),
        }
    }

    async fn bulk_index(&self, index: &str, docs: Vec<BulkDocument>) -> StoreResult<()> {
        if docs.is_empty() {
            return Ok(());
        }

        let mut payload = String::new();
        for doc in &docs {
            let action = match &doc.id {
                Some(id) => json!({ "index": { "_index": index, "_id": id } }),
                None => json!({ "index": { "_index": index } }),
            };
            payload.push_str(&action.to_string());
            payload.push('\n');
            payload.push_str(&doc.source.to_string());
            payload.push('\n');
        }

        let builder = self
            .request(Method::POST, "_bulk")?
            .header(reqwest::header::CONTENT_TYPE, "application/x-ndjson")
            .body(payload);
        let body = self.expect_success(builder, index).await?;

        if body["errors"].as_bool().unwrap_or(false) {
            let first = body["items"]
                .as_array()
                .and_then(|items| {
                    items
                        .iter()
                        .find_map(|item| item["index"].get("error").cloned())
                })
                .unwrap_or(Value::Null);
            return Err(StoreError::Backend(format!(
                "bulk write into {index} rejected items: {first}"
            )));
        }
        trace!(index, count = docs.len(), "bulk batch written");
        Ok(())
    }

    async fn refresh_index(&self, index: &str) -> StoreResult<()> {
        let builder = self.request(Method::POST, &format!("{index}/_refresh"))?;
        self.expect_success(builder, index).await.map(|_| ())
    }

    async fn force_merge(&self, index: &str, max_segments: u32) -> StoreResult<()> {
        let builder = self
            .request(Method::POST, &format!("{index}/_forcemerge"))?
            .query(&[("max_num_segments", max_segments)]);
        self.expect_success(builder, index).await.map(|_| ())
    }

    async fn update_index_settings(
        &self,
        index: &str,
        update: &IndexSettingsUpdate,
    ) -> StoreResult<()> {
        let builder = self
            .request(Method::PUT, &format!("{index}/_settings"))?
            .json(&update.to_settings_json());
        self.expect_success(builder, index).await.map(|_| ())
    }

    async fn shard_states(&self, index: &str) -> StoreResult<Vec<ShardStatus>> {
        let builder = self
            .request(Method::GET, &format!("_cat/shards/{index}"))?
            .query(&[("format", "json")]);
        let response = self.send(builder).await?;
        if !response.status().is_success() {
            return Err(Self::into_error(response, index, None).await);
        }
        let rows: Vec<CatShard> = response
            .json()
            .await
            .map_err(|e| StoreError::Backend(format!("invalid _cat/shards body: {e}")))?;

        Ok(rows
            .into_iter()
            .map(|row| ShardStatus {
                shard: row.shard.parse().unwrap_or_default(),
                primary: row.prirep == "p",
                state: ShardState::parse(&row.state),
            })
            .collect())
    }

    async fn get_document(&self, index: &str, id: &str) -> StoreResult<Option<VersionedDocument>> {
        let response = self
            .send(self.request(Method::GET, &format!("{index}/_doc/{id}"))?)
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(Self::into_error(response, index, Some(id)).await);
        }

        let doc: GetDocResponse = response
            .json()
            .await
            .map_err(|e| StoreError::Backend(format!("invalid _doc body: {e}")))?;
        match (doc.found, doc.seq_no, doc.primary_term, doc.source) {
            (true, Some(seq_no), Some(primary_term), Some(source)) => Ok(Some(VersionedDocument {
                id: id.to_string(),
                version: DocVersion {
                    seq_no,
                    primary_term,
                },
                source,
            })),
            _ => Ok(None),
        }
    }

    async fn put_document(
        &self,
        index: &str,
        id: &str,
        source: Value,
        condition: WriteCondition,
    ) -> StoreResult<DocVersion> {
        let mut builder = self
            .request(Method::PUT, &format!("{index}/_doc/{id}"))?
            .query(&[("refresh", "wait_for")])
            .json(&source);
        builder = match condition {
            WriteCondition::Create => builder.query(&[("op_type", "create")]),
            WriteCondition::IfVersion(version) => builder.query(&[
                ("if_seq_no", version.seq_no),
                ("if_primary_term", version.primary_term),
            ]),
            WriteCondition::Overwrite => builder,
        };

        let response = self.send(builder).await?;
        let status = response.status();
        if status.is_success() {
            let written: WriteDocResponse = response
                .json()
                .await
                .map_err(|e| StoreError::Backend(format!("invalid write body: {e}")))?;
            return Ok(DocVersion {
                seq_no: written.seq_no,
                primary_term: written.primary_term,
            });
        }

        let err = Self::into_error(response, index, Some(id)).await;
        match (condition, err) {
            (WriteCondition::Create, StoreError::VersionConflict { .. }) => {
                Err(StoreError::AlreadyExists(format!("{index}/{id}")))
            }
            (_, err) => Err(err),
        }
    }

    async fn delete_document(
        &self,
        index: &str,
        id: &str,
        expected: Option<DocVersion>,
    ) -> StoreResult<()> {
        let mut builder = self
            .request(Method::DELETE, &format!("{index}/_doc/{id}"))?
            .query(&[("refresh", "wait_for")]);
        if let Some(version) = expected {
            builder = builder.query(&[
                ("if_seq_no", version.seq_no),
                ("if_primary_term", version.primary_term),
            ]);
        }
        let response = self.send(builder).await?;
        if response.status().is_success() {
            Ok(())
        } else {
            match Self::into_error(response, index, Some(id)).await {
                StoreError::IndexNotFound(_) => Err(StoreError::DocumentNotFound {
                    index: index.to_string(),
                    id: id.to_string(),
                }),
                err => Err(err),
            }
        }
    }

    async fn search_all(&self, index: &str) -> StoreResult<Vec<VersionedDocument>> {
        let mut documents = Vec::new();
        let mut search_after: Option<Vec<Value>> = None;

        loop {
            let mut body = json!({
                "size": SEARCH_PAGE_SIZE,
                "seq_no_primary_term": true,
                "query": { "match_all": {} },
                "sort": [{ "_id": "asc" }],
            });
            if let Some(after) = &search_after {
                body["search_after"] = Value::from(after.clone());
            }

            let builder = self
                .request(Method::POST, &format!("{index}/_search"))?
                .json(&body);
            let response = self.send(builder).await?;
            if !response.status().is_success() {
                return Err(Self::into_error(response, index, None).await);
            }
            let page: SearchResponse = response
                .json()
                .await
                .map_err(|e| StoreError::Backend(format!("invalid _search body: {e}")))?;

            let fetched = page.hits.hits.len();
            search_after = page.hits.hits.last().map(|hit| hit.sort.clone());
            documents.extend(page.hits.hits.into_iter().map(|hit| VersionedDocument {
                id: hit.id,
                version: DocVersion {
                    seq_no: hit.seq_no.unwrap_or_default(),
                    primary_term: hit.primary_term.unwrap_or_default(),
                },
                source: hit.source,
            }));

            if fetched < SEARCH_PAGE_SIZE {
                break;
            }
        }

        Ok(documents)
    }
}
