//! Shared types for the metadata store boundary.

use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors returned while interacting with the metadata store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Base URL failed to parse or normalize.
    #[error("Invalid store URL: {0}")]
    InvalidUrl(String),
    /// HTTP layer failed before receiving a response.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    /// Store responded with an unexpected status code.
    #[error("Unexpected store response ({status}): {body}")]
    UnexpectedStatus {
        /// HTTP status returned from the store.
        status: StatusCode,
        /// Body payload associated with the failing response.
        body: String,
    },
}

/// Per-document parser settings carried in the task context.
///
/// Unknown keys are ignored so the worker tolerates configs written by newer
/// control planes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParserConfig {
    /// Requested page ranges, 1-based inclusive. Empty means the whole document.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pages: Vec<(u32, u32)>,
    /// Override for the partitioner's pages-per-task window.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_page_size: Option<u32>,
    /// Whether layout recognition runs for PDF documents.
    #[serde(default = "default_true")]
    pub layout_recognize: bool,
    /// Keyword budget per chunk; zero disables keyword extraction.
    #[serde(default)]
    pub auto_keywords: u32,
    /// Question budget per chunk; zero disables question generation.
    #[serde(default)]
    pub auto_questions: u32,
    /// Weight of the title vector when fusing title and content embeddings.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename_embd_weight: Option<f32>,
    /// Recursive summarization settings; absent disables RAPTOR.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raptor: Option<RaptorConfig>,
}

fn default_true() -> bool {
    true
}

impl Default for ParserConfig {
    fn default() -> Self {
        Self {
            pages: Vec::new(),
            task_page_size: None,
            layout_recognize: true,
            auto_keywords: 0,
            auto_questions: 0,
            filename_embd_weight: None,
            raptor: None,
        }
    }
}

/// Settings for the recursive summarization stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RaptorConfig {
    /// Master switch; partitioned tasks only reach RAPTOR when set.
    #[serde(default)]
    pub use_raptor: bool,
    /// Upper bound on clusters per layer.
    #[serde(default = "default_max_cluster")]
    pub max_cluster: usize,
    /// Summarization prompt template; must contain `{cluster_content}`.
    pub prompt: String,
    /// Token budget per cluster summary.
    pub max_token: usize,
    /// Cosine similarity above which neighboring clusters merge.
    pub threshold: f32,
    /// Seed for reproducible clustering.
    #[serde(default)]
    pub random_seed: u64,
}

fn default_max_cluster() -> usize {
    64
}

/// Full task context returned by the claim-and-fetch join.
///
/// One read returns the task row joined with its document, knowledge base,
/// and tenant attributes, so no stage needs a second metadata round-trip.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskContext {
    /// Task identifier.
    pub id: String,
    /// Parent document identifier.
    pub doc_id: String,
    /// Start of the page or row range, 0-based inclusive.
    pub from_page: i64,
    /// End of the page or row range, exclusive; `-1` means whole document.
    pub to_page: i64,
    /// Number of prior claim attempts.
    pub retry_count: u32,
    /// Knowledge base the document belongs to.
    pub kb_id: String,
    /// Parser profile selected for the document.
    pub parser_id: String,
    /// Parser settings.
    #[serde(default)]
    pub parser_config: ParserConfig,
    /// Document display name.
    pub name: String,
    /// Document file type (`pdf`, `doc`, ...).
    #[serde(rename = "type")]
    pub doc_type: String,
    /// Storage location of the raw document.
    pub location: String,
    /// Raw document size in bytes.
    pub size: u64,
    /// Owning tenant.
    pub tenant_id: String,
    /// Knowledge base language.
    pub language: String,
    /// Embedding model binding (`provider/model`).
    pub embedding_id: String,
    /// Tenant's image-to-text model binding.
    #[serde(default)]
    pub img2txt_id: String,
    /// Tenant's speech-recognition model binding.
    #[serde(default)]
    pub asr_id: String,
    /// Tenant's chat model binding.
    #[serde(default)]
    pub chat_id: String,
    /// Last update time of the task row, epoch milliseconds.
    #[serde(default)]
    pub update_time: i64,
}

/// A task row created by the partitioner.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NewTask {
    /// Generated task identifier.
    pub id: String,
    /// Parent document identifier.
    pub doc_id: String,
    /// Start of the page or row range, 0-based inclusive.
    pub from_page: i64,
    /// End of the page or row range, exclusive; `-1` means whole document.
    pub to_page: i64,
}

/// Progress fields written back to a task row.
///
/// The message is append-only on the store side; the value replaces the
/// previous one. Either side may be absent.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProgressUpdate {
    /// Message appended to the task's progress log.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Progress value in `[-1, 1]`; `-1` is failed or cancelled, `1` complete.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<f32>,
}

impl ProgressUpdate {
    /// Update carrying only a message.
    pub fn message(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            progress: None,
        }
    }

    /// Update carrying a message and a progress value.
    pub fn with_progress(message: impl Into<String>, progress: f32) -> Self {
        Self {
            message: Some(message.into()),
            progress: Some(progress),
        }
    }
}

/// Document attributes the partitioner needs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentDescriptor {
    /// Document identifier.
    pub id: String,
    /// Knowledge base the document belongs to.
    pub kb_id: String,
    /// Parser profile selected for the document.
    pub parser_id: String,
    /// Parser settings.
    #[serde(default)]
    pub parser_config: ParserConfig,
    /// Document display name.
    pub name: String,
    /// Document file type.
    #[serde(rename = "type")]
    pub doc_type: String,
    /// Storage location of the raw document.
    pub location: String,
    /// Raw document size in bytes.
    pub size: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parser_config_defaults_are_permissive() {
        let config: ParserConfig = serde_json::from_str("{}").expect("decode");
        assert!(config.pages.is_empty());
        assert!(config.layout_recognize);
        assert_eq!(config.auto_keywords, 0);
        assert_eq!(config.auto_questions, 0);
        assert!(config.raptor.is_none());
    }

    #[test]
    fn raptor_config_decodes_with_defaults() {
        let config: RaptorConfig = serde_json::from_str(
            r#"{"prompt":"Summarize:\n{cluster_content}","max_token":256,"threshold":0.1}"#,
        )
        .expect("decode");
        assert_eq!(config.max_cluster, 64);
        assert_eq!(config.random_seed, 0);
        assert!(!config.use_raptor);
    }

    #[test]
    fn task_context_decodes_joined_row() {
        let context: TaskContext = serde_json::from_str(
            r#"{
                "id": "t1", "doc_id": "d1", "from_page": 0, "to_page": 12,
                "retry_count": 1, "kb_id": "kb1", "parser_id": "naive",
                "parser_config": {"auto_keywords": 5},
                "name": "report.pdf", "type": "pdf", "location": "kb1/report.pdf",
                "size": 1024, "tenant_id": "tn1", "language": "English",
                "embedding_id": "hashed/8", "chat_id": "ollama/llama3"
            }"#,
        )
        .expect("decode");
        assert_eq!(context.parser_config.auto_keywords, 5);
        assert_eq!(context.doc_type, "pdf");
        assert!(context.img2txt_id.is_empty());
    }
}
