//! HTTP adapter for the metadata store service.

use crate::config::get_config;
use crate::store::types::{
    NewTask, ProgressUpdate, StoreError, TaskContext,
};
use crate::store::MetadataStore;
use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use serde::Deserialize;
use serde_json::json;

/// Lightweight HTTP client for the metadata store's internal REST surface.
pub struct HttpMetadataStore {
    client: Client,
    base_url: String,
}

#[derive(Deserialize)]
struct CancelState {
    requested: bool,
}

#[derive(Deserialize)]
struct StorageAddress {
    bucket: String,
    name: String,
}

impl HttpMetadataStore {
    /// Construct a new client using configuration derived from the environment.
    pub fn new() -> Result<Self, StoreError> {
        let config = get_config();
        Self::with_base_url(&config.store_url)
    }

    /// Construct a client against an explicit base URL.
    pub fn with_base_url(base_url: &str) -> Result<Self, StoreError> {
        let client = Client::builder()
            .user_agent("docmill/0.3")
            .build()?;
        let base_url = normalize_base_url(base_url).map_err(StoreError::InvalidUrl)?;
        tracing::debug!(url = %base_url, "Initialized metadata store client");
        Ok(Self { client, base_url })
    }

    fn request(&self, method: Method, path: &str) -> reqwest::RequestBuilder {
        let base = self.base_url.trim_end_matches('/');
        let path = path.trim_start_matches('/');
        self.client.request(method, format!("{base}/{path}"))
    }

    async fn ensure_success(&self, response: reqwest::Response) -> Result<(), StoreError> {
        if response.status().is_success() {
            Ok(())
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            let error = StoreError::UnexpectedStatus { status, body };
            tracing::error!(error = %error, "Metadata store request failed");
            Err(error)
        }
    }
}

#[async_trait]
impl MetadataStore for HttpMetadataStore {
    async fn task_context(&self, task_id: &str) -> Result<Option<TaskContext>, StoreError> {
        let response = self
            .request(Method::GET, &format!("tasks/{task_id}/context"))
            .send()
            .await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => Ok(Some(response.json().await?)),
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(StoreError::UnexpectedStatus { status, body })
            }
        }
    }

    async fn update_progress(
        &self,
        task_id: &str,
        update: &ProgressUpdate,
    ) -> Result<(), StoreError> {
        let response = self
            .request(Method::POST, &format!("tasks/{task_id}/progress"))
            .json(update)
            .send()
            .await?;
        self.ensure_success(response).await
    }

    async fn bump_retry_count(&self, task_id: &str) -> Result<(), StoreError> {
        let response = self
            .request(Method::POST, &format!("tasks/{task_id}/retry"))
            .send()
            .await?;
        self.ensure_success(response).await
    }

    async fn cancel_requested(&self, task_id: &str) -> Result<bool, StoreError> {
        let response = self
            .request(Method::GET, &format!("tasks/{task_id}/cancel-state"))
            .send()
            .await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(StoreError::UnexpectedStatus { status, body });
        }
        let state: CancelState = response.json().await?;
        Ok(state.requested)
    }

    async fn insert_tasks(&self, tasks: &[NewTask]) -> Result<(), StoreError> {
        let response = self
            .request(Method::POST, "tasks")
            .json(&json!({ "tasks": tasks }))
            .send()
            .await?;
        self.ensure_success(response).await
    }

    async fn begin_parsing(&self, doc_id: &str) -> Result<(), StoreError> {
        let response = self
            .request(Method::POST, &format!("documents/{doc_id}/parse-begin"))
            .send()
            .await?;
        self.ensure_success(response).await
    }

    async fn storage_address(&self, doc_id: &str) -> Result<(String, String), StoreError> {
        let response = self
            .request(Method::GET, &format!("documents/{doc_id}/storage-address"))
            .send()
            .await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(StoreError::UnexpectedStatus { status, body });
        }
        let address: StorageAddress = response.json().await?;
        Ok((address.bucket, address.name))
    }

    async fn increment_document_stats(
        &self,
        doc_id: &str,
        kb_id: &str,
        token_count: usize,
        chunk_count: usize,
    ) -> Result<(), StoreError> {
        let response = self
            .request(Method::POST, &format!("documents/{doc_id}/stats"))
            .json(&json!({
                "kb_id": kb_id,
                "token_count": token_count,
                "chunk_count": chunk_count,
            }))
            .send()
            .await?;
        self.ensure_success(response).await
    }
}

fn normalize_base_url(url: &str) -> Result<String, String> {
    let mut parsed = reqwest::Url::parse(url).map_err(|err| err.to_string())?;
    let path = parsed.path().trim_end_matches('/').to_string();
    parsed.set_path(&path);
    Ok(parsed.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::{Method::GET, Method::POST, MockServer};

    fn store_for(server: &MockServer) -> HttpMetadataStore {
        HttpMetadataStore::with_base_url(&server.base_url()).expect("store client")
    }

    #[tokio::test]
    async fn task_context_decodes_join() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET).path("/tasks/t1/context");
                then.status(200).json_body(serde_json::json!({
                    "id": "t1", "doc_id": "d1", "from_page": 0, "to_page": 12,
                    "retry_count": 0, "kb_id": "kb1", "parser_id": "naive",
                    "name": "report.pdf", "type": "pdf",
                    "location": "kb1/report.pdf", "size": 2048,
                    "tenant_id": "tn1", "language": "English",
                    "embedding_id": "hashed/8"
                }));
            })
            .await;

        let context = store_for(&server)
            .task_context("t1")
            .await
            .expect("request")
            .expect("context");
        mock.assert();
        assert_eq!(context.doc_id, "d1");
        assert_eq!(context.to_page, 12);
    }

    #[tokio::test]
    async fn missing_task_yields_none() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/tasks/gone/context");
                then.status(404);
            })
            .await;

        let context = store_for(&server).task_context("gone").await.expect("request");
        assert!(context.is_none());
    }

    #[tokio::test]
    async fn progress_update_posts_json() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/tasks/t1/progress")
                    .json_body(serde_json::json!({
                        "message": "Done!",
                        "progress": 1.0
                    }));
                then.status(200);
            })
            .await;

        store_for(&server)
            .update_progress("t1", &ProgressUpdate::with_progress("Done!", 1.0))
            .await
            .expect("request");
        mock.assert();
    }

    #[tokio::test]
    async fn cancel_state_is_surfaced() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/tasks/t1/cancel-state");
                then.status(200).json_body(serde_json::json!({"requested": true}));
            })
            .await;

        let requested = store_for(&server)
            .cancel_requested("t1")
            .await
            .expect("request");
        assert!(requested);
    }

    #[tokio::test]
    async fn error_status_is_reported() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/tasks/t1/retry");
                then.status(500).body("boom");
            })
            .await;

        let error = store_for(&server)
            .bump_retry_count("t1")
            .await
            .expect_err("error status");
        assert!(matches!(error, StoreError::UnexpectedStatus { .. }));
    }
}
