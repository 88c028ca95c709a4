//! Blob storage HTTP client.
//!
//! Raw documents and extracted chunk images live in an object store addressed
//! by `(bucket, key)`, where the bucket is the knowledge-base id. The worker
//! only needs get, put, and existence probes.

use crate::config::get_config;
use reqwest::{Client, Method, StatusCode};
use thiserror::Error;

/// Errors returned while interacting with blob storage.
#[derive(Debug, Error)]
pub enum BlobError {
    /// Base URL failed to parse or normalize.
    #[error("Invalid blob storage URL: {0}")]
    InvalidUrl(String),
    /// HTTP layer failed before receiving a response.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    /// Requested object does not exist.
    #[error("Object not found: {bucket}/{key}")]
    NotFound {
        /// Bucket the object was expected in.
        bucket: String,
        /// Object key within the bucket.
        key: String,
    },
    /// Storage responded with an unexpected status code.
    #[error("Unexpected blob storage response ({status}): {body}")]
    UnexpectedStatus {
        /// HTTP status returned from storage.
        status: StatusCode,
        /// Body payload associated with the failing response.
        body: String,
    },
}

/// Lightweight HTTP client for object storage operations.
pub struct BlobStorage {
    client: Client,
    base_url: String,
}

impl BlobStorage {
    /// Construct a new client using configuration derived from the environment.
    pub fn new() -> Result<Self, BlobError> {
        let config = get_config();
        Self::with_base_url(&config.blob_url)
    }

    /// Construct a client against an explicit base URL.
    pub fn with_base_url(base_url: &str) -> Result<Self, BlobError> {
        let client = Client::builder().user_agent("docmill/0.3").build()?;
        let base_url = normalize_base_url(base_url).map_err(BlobError::InvalidUrl)?;
        Ok(Self { client, base_url })
    }

    /// Fetch an object's raw bytes.
    pub async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>, BlobError> {
        let response = self.request(Method::GET, bucket, key).send().await?;
        match response.status() {
            StatusCode::NOT_FOUND => Err(BlobError::NotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            }),
            status if status.is_success() => Ok(response.bytes().await?.to_vec()),
            status => {
                let body = response.text().await.unwrap_or_default();
                let error = BlobError::UnexpectedStatus { status, body };
                tracing::error!(bucket, key, error = %error, "Blob fetch failed");
                Err(error)
            }
        }
    }

    /// Store an object, replacing any previous content.
    pub async fn put(&self, bucket: &str, key: &str, bytes: Vec<u8>) -> Result<(), BlobError> {
        let response = self
            .request(Method::PUT, bucket, key)
            .body(bytes)
            .send()
            .await?;
        if response.status().is_success() {
            tracing::debug!(bucket, key, "Blob stored");
            Ok(())
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            let error = BlobError::UnexpectedStatus { status, body };
            tracing::error!(bucket, key, error = %error, "Blob store failed");
            Err(error)
        }
    }

    /// Whether an object exists.
    pub async fn exists(&self, bucket: &str, key: &str) -> Result<bool, BlobError> {
        let response = self.request(Method::HEAD, bucket, key).send().await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(false),
            status if status.is_success() => Ok(true),
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(BlobError::UnexpectedStatus { status, body })
            }
        }
    }

    fn request(&self, method: Method, bucket: &str, key: &str) -> reqwest::RequestBuilder {
        let base = self.base_url.trim_end_matches('/');
        let key = key.trim_start_matches('/');
        self.client.request(method, format!("{base}/{bucket}/{key}"))
    }
}

fn normalize_base_url(url: &str) -> Result<String, String> {
    let mut parsed = reqwest::Url::parse(url).map_err(|err| err.to_string())?;
    let path = parsed.path().trim_end_matches('/').to_string();
    parsed.set_path(&path);
    Ok(parsed.to_string())
}
