//! Metadata store boundary.
//!
//! The relational store is the single source of truth for task state. The
//! pipeline reaches it through the [`MetadataStore`] capability so stages can
//! be exercised against an in-memory fake, while production workers use the
//! HTTP adapter in [`http`]. Progress writes are serialized by the store
//! itself; the worker never caches task or document state across stages.

mod http;
mod types;

pub use http::HttpMetadataStore;
pub use types::{
    DocumentDescriptor, NewTask, ParserConfig, ProgressUpdate, RaptorConfig, StoreError,
    TaskContext,
};

use async_trait::async_trait;
use rand::Rng;

/// Claim attempts beyond this prior retry count abandon the task.
pub const MAX_RETRY_COUNT: u32 = 3;

/// Operations the pipeline needs from the relational metadata store.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Fetch the joined task context, or `None` when the task row is gone.
    async fn task_context(&self, task_id: &str) -> Result<Option<TaskContext>, StoreError>;

    /// Append a progress message and/or set the progress value for a task.
    async fn update_progress(
        &self,
        task_id: &str,
        update: &ProgressUpdate,
    ) -> Result<(), StoreError>;

    /// Increment the task's retry count by one.
    async fn bump_retry_count(&self, task_id: &str) -> Result<(), StoreError>;

    /// Whether cancellation has been requested for the task's document.
    async fn cancel_requested(&self, task_id: &str) -> Result<bool, StoreError>;

    /// Persist a batch of freshly partitioned tasks in one operation.
    async fn insert_tasks(&self, tasks: &[NewTask]) -> Result<(), StoreError>;

    /// Flip the document's status to "parsing in progress".
    async fn begin_parsing(&self, doc_id: &str) -> Result<(), StoreError>;

    /// Resolve the blob storage `(bucket, name)` address of a document.
    async fn storage_address(&self, doc_id: &str) -> Result<(String, String), StoreError>;

    /// Additively increment the document's token and chunk counters.
    async fn increment_document_stats(
        &self,
        doc_id: &str,
        kb_id: &str,
        token_count: usize,
        chunk_count: usize,
    ) -> Result<(), StoreError>;
}

/// Claim a task for processing.
///
/// Reads the joined context, then applies the claim protocol: a task whose
/// prior retry count has reached [`MAX_RETRY_COUNT`] is abandoned (progress
/// forced to `-1` with an explanatory message) and `None` is returned;
/// otherwise a receipt message with a small nonzero progress is appended, the
/// retry count is incremented, and the context is handed to the pipeline.
pub async fn claim_task(
    store: &dyn MetadataStore,
    task_id: &str,
) -> Result<Option<TaskContext>, StoreError> {
    let Some(context) = store.task_context(task_id).await? else {
        tracing::warn!(task_id, "Empty task; nothing to claim");
        return Ok(None);
    };

    if context.retry_count >= MAX_RETRY_COUNT {
        store
            .update_progress(
                task_id,
                &ProgressUpdate::with_progress(
                    format!("ERROR: Task is abandoned after {MAX_RETRY_COUNT} times attempts."),
                    -1.0,
                ),
            )
            .await?;
        tracing::warn!(task_id, retry_count = context.retry_count, "Task abandoned");
        return Ok(None);
    }

    // Small nonzero progress signals the task left the queue.
    let receipt = rand::thread_rng().gen_range(0.0..0.1);
    store
        .update_progress(
            task_id,
            &ProgressUpdate::with_progress("Task has been received.", receipt),
        )
        .await?;
    store.bump_retry_count(task_id).await?;

    Ok(Some(context))
}
