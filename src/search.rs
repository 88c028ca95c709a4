//! Search index service client.
//!
//! Chunks are committed into a per-tenant index over an Elasticsearch-style
//! REST surface: index creation from a fixed mapping, NDJSON bulk upserts,
//! delete-by-query on the document id for compensating rollbacks, and a
//! paginated listing used by the summarization stage to read back a
//! document's leaf chunks.

use crate::config::get_config;
use crate::pipeline::Chunk;
use reqwest::{Client, Method, StatusCode};
use serde::Deserialize;
use serde_json::{Value, json};
use thiserror::Error;

/// Page size used when listing a document's chunks.
const LIST_PAGE_SIZE: usize = 512;

/// Errors returned while interacting with the search index service.
#[derive(Debug, Error)]
pub enum SearchError {
    /// Base URL failed to parse or normalize.
    #[error("Invalid search index URL: {0}")]
    InvalidUrl(String),
    /// HTTP layer failed before receiving a response.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    /// Index service responded with an unexpected status code.
    #[error("Unexpected search index response ({status}): {body}")]
    UnexpectedStatus {
        /// HTTP status returned from the index service.
        status: StatusCode,
        /// Body payload associated with the failing response.
        body: String,
    },
    /// Bulk request was accepted but one or more items were rejected.
    #[error("Bulk indexing rejected: {0}")]
    BulkRejected(String),
}

/// Per-tenant index name.
pub fn index_name(tenant_id: &str) -> String {
    format!("docmill_{tenant_id}")
}

/// Lightweight HTTP client for search index operations.
pub struct SearchIndex {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

impl SearchIndex {
    /// Construct a new client using configuration derived from the environment.
    pub fn new() -> Result<Self, SearchError> {
        let config = get_config();
        Self::with_base_url(&config.search_url, config.search_api_key.clone())
    }

    /// Construct a client against an explicit base URL.
    pub fn with_base_url(base_url: &str, api_key: Option<String>) -> Result<Self, SearchError> {
        let client = Client::builder().user_agent("docmill/0.3").build()?;
        let base_url = normalize_base_url(base_url).map_err(SearchError::InvalidUrl)?;
        tracing::debug!(url = %base_url, "Initialized search index client");
        Ok(Self {
            client,
            base_url,
            api_key,
        })
    }

    /// Create the index from the fixed mapping when it does not exist yet.
    pub async fn ensure_index(&self, index: &str) -> Result<(), SearchError> {
        let response = self.request(Method::HEAD, index).send().await?;
        match response.status() {
            status if status.is_success() => return Ok(()),
            StatusCode::NOT_FOUND => {}
            status => {
                let body = response.text().await.unwrap_or_default();
                return Err(SearchError::UnexpectedStatus { status, body });
            }
        }

        tracing::debug!(index, "Creating search index");
        let response = self
            .request(Method::PUT, index)
            .json(&index_mapping())
            .send()
            .await?;
        self.ensure_success(response, || {
            tracing::info!(index, "Search index created");
        })
        .await
    }

    /// Bulk-upsert chunks by their deterministic ids.
    pub async fn bulk_upsert(&self, index: &str, chunks: &[Chunk]) -> Result<(), SearchError> {
        if chunks.is_empty() {
            return Ok(());
        }

        let mut body = String::new();
        for chunk in chunks {
            let action = json!({ "index": { "_index": index, "_id": chunk.id } });
            body.push_str(&action.to_string());
            body.push('\n');
            body.push_str(&chunk.to_index_doc().to_string());
            body.push('\n');
        }

        let response = self
            .request(Method::POST, &format!("{index}/_bulk"))
            .header("content-type", "application/x-ndjson")
            .body(body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            let error = SearchError::UnexpectedStatus { status, body };
            tracing::error!(index, error = %error, "Bulk request failed");
            return Err(error);
        }

        let reply: BulkResponse = response.json().await?;
        if reply.errors {
            let detail = reply
                .items
                .iter()
                .find_map(BulkItem::error_reason)
                .unwrap_or_else(|| "unspecified item failure".to_string());
            tracing::error!(index, detail = %detail, "Bulk items rejected");
            return Err(SearchError::BulkRejected(detail));
        }
        Ok(())
    }

    /// Delete every chunk belonging to a document.
    ///
    /// This is the compensating action keeping the index all-or-nothing per
    /// processing run; it returns the number of deleted chunks.
    pub async fn delete_by_document(&self, index: &str, doc_id: &str) -> Result<u64, SearchError> {
        let response = self
            .request(Method::POST, &format!("{index}/_delete_by_query"))
            .json(&json!({ "query": { "term": { "doc_id": doc_id } } }))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            let error = SearchError::UnexpectedStatus { status, body };
            tracing::error!(index, doc_id, error = %error, "Delete-by-document failed");
            return Err(error);
        }

        let reply: DeleteByQueryResponse = response.json().await?;
        tracing::debug!(index, doc_id, deleted = reply.deleted, "Chunks deleted");
        Ok(reply.deleted)
    }

    /// List a document's chunks as `(content, vector)` pairs.
    pub async fn list_chunks(
        &self,
        index: &str,
        doc_id: &str,
        vector_field: &str,
    ) -> Result<Vec<(String, Vec<f32>)>, SearchError> {
        let mut results = Vec::new();
        let mut from = 0usize;
        loop {
            let body = json!({
                "query": { "term": { "doc_id": doc_id } },
                "_source": ["content_with_weight", vector_field],
                "from": from,
                "size": LIST_PAGE_SIZE,
            });
            let response = self
                .request(Method::POST, &format!("{index}/_search"))
                .json(&body)
                .send()
                .await?;

            if !response.status().is_success() {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                return Err(SearchError::UnexpectedStatus { status, body });
            }

            let reply: SearchResponse = response.json().await?;
            let page_len = reply.hits.hits.len();
            for hit in reply.hits.hits {
                let Some(source) = hit.source else { continue };
                let Some(content) = source
                    .get("content_with_weight")
                    .and_then(Value::as_str)
                else {
                    continue;
                };
                let Some(vector) = source.get(vector_field).and_then(decode_vector) else {
                    continue;
                };
                results.push((content.to_string(), vector));
            }

            if page_len < LIST_PAGE_SIZE {
                break;
            }
            from += LIST_PAGE_SIZE;
        }
        Ok(results)
    }

    fn request(&self, method: Method, path: &str) -> reqwest::RequestBuilder {
        let base = self.base_url.trim_end_matches('/');
        let path = path.trim_start_matches('/');
        let mut request = self.client.request(method, format!("{base}/{path}"));
        if let Some(api_key) = &self.api_key {
            if !api_key.is_empty() {
                request = request.header("authorization", format!("ApiKey {api_key}"));
            }
        }
        request
    }

    async fn ensure_success<F>(
        &self,
        response: reqwest::Response,
        on_success: F,
    ) -> Result<(), SearchError>
    where
        F: FnOnce(),
    {
        if response.status().is_success() {
            on_success();
            Ok(())
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            let error = SearchError::UnexpectedStatus { status, body };
            tracing::error!(error = %error, "Search index request failed");
            Err(error)
        }
    }
}

/// Fixed mapping installed for every tenant index.
///
/// Vector fields are matched dynamically so one index can hold chunks from
/// embedding models of different dimensionalities.
fn index_mapping() -> Value {
    json!({
        "settings": {
            "number_of_shards": 2,
            "number_of_replicas": 0,
        },
        "mappings": {
            "dynamic_templates": [
                {
                    "dense_vectors": {
                        "match": "q_*_vec",
                        "mapping": { "type": "dense_vector", "index": false }
                    }
                }
            ],
            "properties": {
                "doc_id": { "type": "keyword" },
                "kb_id": { "type": "keyword" },
                "docnm_kwd": { "type": "keyword" },
                "title_tks": { "type": "text", "analyzer": "whitespace" },
                "content_with_weight": { "type": "text" },
                "content_ltks": { "type": "text", "analyzer": "whitespace" },
                "content_sm_ltks": { "type": "text", "analyzer": "whitespace" },
                "important_kwd": { "type": "keyword" },
                "important_tks": { "type": "text", "analyzer": "whitespace" },
                "img_id": { "type": "keyword" },
                "create_time": { "type": "keyword" },
                "create_timestamp_flt": { "type": "double" },
            }
        }
    })
}

fn decode_vector(value: &Value) -> Option<Vec<f32>> {
    value
        .as_array()?
        .iter()
        .map(|item| item.as_f64().map(|v| v as f32))
        .collect()
}

fn normalize_base_url(url: &str) -> Result<String, String> {
    let mut parsed = reqwest::Url::parse(url).map_err(|err| err.to_string())?;
    let path = parsed.path().trim_end_matches('/').to_string();
    parsed.set_path(&path);
    Ok(parsed.to_string())
}

#[derive(Deserialize)]
struct BulkResponse {
    #[serde(default)]
    errors: bool,
    #[serde(default)]
    items: Vec<BulkItem>,
}

#[derive(Deserialize)]
struct BulkItem {
    #[serde(default)]
    index: Option<BulkItemStatus>,
}

#[derive(Deserialize)]
struct BulkItemStatus {
    #[serde(default)]
    error: Option<Value>,
}

impl BulkItem {
    fn error_reason(&self) -> Option<String> {
        let error = self.index.as_ref()?.error.as_ref()?;
        Some(
            error
                .get("reason")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| error.to_string()),
        )
    }
}

#[derive(Deserialize)]
struct DeleteByQueryResponse {
    #[serde(default)]
    deleted: u64,
}

#[derive(Deserialize)]
struct SearchResponse {
    hits: SearchHits,
}

#[derive(Deserialize)]
struct SearchHits {
    #[serde(default)]
    hits: Vec<SearchHit>,
}

#[derive(Deserialize)]
struct SearchHit {
    #[serde(rename = "_source", default)]
    source: Option<Value>,
}
