//! Index commit stage with compensating rollback.

use crate::pipeline::progress::ProgressHandle;
use crate::pipeline::{Chunk, StageError};
use crate::search::{SearchIndex, index_name};
use crate::store::{MetadataStore, TaskContext};
use std::collections::HashSet;

/// Chunks per bulk call; small enough to bound any single oversized payload.
const BULK_SIZE: usize = 4;
/// Progress is reported once per this many chunks.
const PROGRESS_EVERY: usize = 128;

/// Commit chunks into the tenant index, all-or-nothing per run.
///
/// Ensures the per-tenant index exists, writes in fixed-size bulk batches,
/// and on any bulk failure deletes everything already written for the
/// document before reporting the task failed. A cancellation observed during
/// or right after the writes also triggers the compensating delete, so a
/// cancelled task never leaves chunks searchable. On success the document's
/// aggregate counters are incremented and the task completes at progress 1.0.
pub async fn commit_chunks(
    context: &TaskContext,
    chunks: &[Chunk],
    token_count: usize,
    search: &SearchIndex,
    store: &dyn MetadataStore,
    progress: &ProgressHandle,
) -> Result<(), StageError> {
    let index = index_name(&context.tenant_id);
    // Cancellation check before the commit; a cancelled task must not leave
    // chunks from this or any earlier partial run searchable.
    if let Err(cancelled) = progress.checkpoint().await {
        rollback(search, &index, &context.doc_id).await;
        return Err(cancelled.into());
    }
    if let Err(error) = search.ensure_index(&index).await {
        progress
            .set(Some(-1.0), &format!("Failed to prepare index: {error}"))
            .await?;
        return Err(StageError::Failed);
    }

    let distinct: HashSet<&str> = chunks.iter().map(|chunk| chunk.id.as_str()).collect();
    let chunk_count = distinct.len();
    let started = std::time::Instant::now();

    for (offset, batch) in chunks.chunks(BULK_SIZE).enumerate() {
        let written = offset * BULK_SIZE;
        if let Err(error) = search.bulk_upsert(&index, batch).await {
            tracing::error!(
                index = %index,
                doc_id = %context.doc_id,
                error = %error,
                "Bulk insert failed; rolling back document"
            );
            rollback(search, &index, &context.doc_id).await;
            progress
                .set(
                    Some(-1.0),
                    "Insert chunk error, detail info please check the worker log. Please also check the index service status!",
                )
                .await?;
            return Err(StageError::Failed);
        }
        if written % PROGRESS_EVERY == 0 {
            let fraction = (written + 1) as f32 / chunks.len() as f32;
            if let Err(cancelled) = progress.value(0.8 + 0.1 * fraction).await {
                rollback(search, &index, &context.doc_id).await;
                return Err(cancelled.into());
            }
        }
    }
    tracing::info!(
        index = %index,
        doc_id = %context.doc_id,
        chunks = chunks.len(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Indexing finished"
    );

    // A cancel racing the final writes must not leave the document searchable.
    if let Err(cancelled) = progress.checkpoint().await {
        rollback(search, &index, &context.doc_id).await;
        return Err(cancelled.into());
    }

    progress.set(Some(1.0), "Done!").await?;
    if let Err(error) = store
        .increment_document_stats(&context.doc_id, &context.kb_id, token_count, chunk_count)
        .await
    {
        tracing::error!(
            doc_id = %context.doc_id,
            error = %error,
            "Failed to increment document counters"
        );
    }
    tracing::info!(
        task_id = %context.id,
        doc_id = %context.doc_id,
        tokens = token_count,
        chunks = chunk_count,
        "Task completed"
    );
    Ok(())
}

async fn rollback(search: &SearchIndex, index: &str, doc_id: &str) {
    if let Err(error) = search.delete_by_document(index, doc_id).await {
        tracing::error!(
            index = %index,
            doc_id = %doc_id,
            error = %error,
            "Compensating delete failed; stale chunks may remain"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::testing::{FakeStore, sample_context};
    use httpmock::{Method::HEAD, Method::POST, MockServer};
    use serde_json::json;
    use std::sync::Arc;

    fn chunks_of(count: usize) -> Vec<Chunk> {
        (0..count)
            .map(|i| {
                let mut chunk = Chunk::from_content(format!("content {i}"), "d1", "kb1");
                chunk.vector = Some(vec![0.5, 0.25]);
                chunk
            })
            .collect()
    }

    async fn mock_index_exists(server: &MockServer) {
        server
            .mock_async(|when, then| {
                when.method(HEAD).path("/docmill_tn1");
                then.status(200);
            })
            .await;
    }

    #[tokio::test]
    async fn successful_commit_completes_task_and_counters() {
        let server = MockServer::start_async().await;
        mock_index_exists(&server).await;
        let bulk = server
            .mock_async(|when, then| {
                when.method(POST).path("/docmill_tn1/_bulk");
                then.status(200).json_body(json!({"errors": false, "items": []}));
            })
            .await;

        let search = SearchIndex::with_base_url(&server.base_url(), None).expect("search client");
        let store = Arc::new(FakeStore::default());
        let context = sample_context();
        let progress = ProgressHandle::new(store.clone(), &context);

        commit_chunks(&context, &chunks_of(6), 99, &search, store.as_ref(), &progress)
            .await
            .expect("commit");

        assert_eq!(bulk.hits_async().await, 2);
        let update = store.last_progress().expect("progress");
        assert_eq!(update.progress, Some(1.0));
        assert_eq!(update.message.as_deref(), Some("Done!"));
        let stats = store.stats.lock().expect("lock");
        assert_eq!(stats.as_slice(), &[("d1".into(), "kb1".into(), 99, 6)]);
    }

    #[tokio::test]
    async fn bulk_failure_rolls_back_whole_document() {
        let server = MockServer::start_async().await;
        mock_index_exists(&server).await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/docmill_tn1/_bulk");
                then.status(200).json_body(json!({
                    "errors": true,
                    "items": [{"index": {"error": {"reason": "mapper_parsing_exception"}}}]
                }));
            })
            .await;
        let delete = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/docmill_tn1/_delete_by_query")
                    .json_body(json!({"query": {"term": {"doc_id": "d1"}}}));
                then.status(200).json_body(json!({"deleted": 4}));
            })
            .await;

        let search = SearchIndex::with_base_url(&server.base_url(), None).expect("search client");
        let store = Arc::new(FakeStore::default());
        let context = sample_context();
        let progress = ProgressHandle::new(store.clone(), &context);

        let result = commit_chunks(&context, &chunks_of(4), 10, &search, store.as_ref(), &progress)
            .await;

        assert_eq!(result.unwrap_err(), StageError::Failed);
        delete.assert_async().await;
        let update = store.last_progress().expect("progress");
        assert_eq!(update.progress, Some(-1.0));
        assert!(update.message.expect("message").contains("Insert chunk error"));
        assert!(store.stats.lock().expect("lock").is_empty());
    }

    #[tokio::test]
    async fn cancellation_deletes_document_and_skips_completion() {
        let server = MockServer::start_async().await;
        mock_index_exists(&server).await;
        let delete = server
            .mock_async(|when, then| {
                when.method(POST).path("/docmill_tn1/_delete_by_query");
                then.status(200).json_body(json!({"deleted": 2}));
            })
            .await;

        let search = SearchIndex::with_base_url(&server.base_url(), None).expect("search client");
        let store = Arc::new(FakeStore::default());
        let context = sample_context();
        let progress = ProgressHandle::new(store.clone(), &context);

        // Cancel lands before the commit starts; nothing may stay searchable.
        store.cancel();

        let result = commit_chunks(&context, &chunks_of(2), 5, &search, store.as_ref(), &progress)
            .await;

        assert_eq!(result.unwrap_err(), StageError::Cancelled);
        delete.assert_async().await;
        assert!(store.stats.lock().expect("lock").is_empty());
        let updates = store.updates.lock().expect("lock");
        assert!(updates.iter().all(|update| update.progress != Some(1.0)));
        let terminal = updates.last().expect("terminal progress");
        assert_eq!(terminal.progress, Some(-1.0));
        assert!(terminal.message.as_deref().expect("message").contains("[Canceled]"));
    }

    #[tokio::test]
    async fn cancellation_after_successful_writes_still_rolls_back() {
        use crate::store::{NewTask, ProgressUpdate, StoreError, TaskContext};
        use async_trait::async_trait;
        use std::sync::Mutex;
        use std::sync::atomic::{AtomicUsize, Ordering};

        /// Reports cancellation only from the N-th probe on, so the bulk
        /// writes succeed before the cancel is observed.
        struct LateCancelStore {
            probes: AtomicUsize,
            cancel_from: usize,
            updates: Mutex<Vec<ProgressUpdate>>,
            stats: Mutex<Vec<(String, String, usize, usize)>>,
        }

        #[async_trait]
        impl crate::store::MetadataStore for LateCancelStore {
            async fn task_context(&self, _: &str) -> Result<Option<TaskContext>, StoreError> {
                Ok(None)
            }

            async fn update_progress(
                &self,
                _: &str,
                update: &ProgressUpdate,
            ) -> Result<(), StoreError> {
                self.updates.lock().expect("lock").push(update.clone());
                Ok(())
            }

            async fn bump_retry_count(&self, _: &str) -> Result<(), StoreError> {
                Ok(())
            }

            async fn cancel_requested(&self, _: &str) -> Result<bool, StoreError> {
                Ok(self.probes.fetch_add(1, Ordering::SeqCst) + 1 >= self.cancel_from)
            }

            async fn insert_tasks(&self, _: &[NewTask]) -> Result<(), StoreError> {
                Ok(())
            }

            async fn begin_parsing(&self, _: &str) -> Result<(), StoreError> {
                Ok(())
            }

            async fn storage_address(&self, _: &str) -> Result<(String, String), StoreError> {
                Ok((String::new(), String::new()))
            }

            async fn increment_document_stats(
                &self,
                doc_id: &str,
                kb_id: &str,
                token_count: usize,
                chunk_count: usize,
            ) -> Result<(), StoreError> {
                self.stats.lock().expect("lock").push((
                    doc_id.to_string(),
                    kb_id.to_string(),
                    token_count,
                    chunk_count,
                ));
                Ok(())
            }
        }

        let server = MockServer::start_async().await;
        mock_index_exists(&server).await;
        let bulk = server
            .mock_async(|when, then| {
                when.method(POST).path("/docmill_tn1/_bulk");
                then.status(200).json_body(json!({"errors": false, "items": []}));
            })
            .await;
        let delete = server
            .mock_async(|when, then| {
                when.method(POST).path("/docmill_tn1/_delete_by_query");
                then.status(200).json_body(json!({"deleted": 2}));
            })
            .await;

        let search = SearchIndex::with_base_url(&server.base_url(), None).expect("search client");
        // Probe 1 is the pre-commit checkpoint, probe 2 the batch progress;
        // probe 3 is the post-write checkpoint, where the cancel lands.
        let store = Arc::new(LateCancelStore {
            probes: AtomicUsize::new(0),
            cancel_from: 3,
            updates: Mutex::new(Vec::new()),
            stats: Mutex::new(Vec::new()),
        });
        let context = sample_context();
        let progress = ProgressHandle::new(store.clone(), &context);

        let result =
            commit_chunks(&context, &chunks_of(2), 5, &search, store.as_ref(), &progress).await;

        assert_eq!(result.unwrap_err(), StageError::Cancelled);
        assert_eq!(bulk.hits_async().await, 1);
        delete.assert_async().await;
        assert!(store.stats.lock().expect("lock").is_empty());
        let updates = store.updates.lock().expect("lock");
        assert!(updates.iter().all(|update| update.progress != Some(1.0)));
        let terminal = updates.last().expect("terminal progress");
        assert_eq!(terminal.progress, Some(-1.0));
        assert!(terminal.message.as_deref().expect("message").contains("[Canceled]"));
    }

    #[tokio::test]
    async fn index_preparation_failure_is_terminal() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(HEAD).path("/docmill_tn1");
                then.status(500);
            })
            .await;

        let search = SearchIndex::with_base_url(&server.base_url(), None).expect("search client");
        let store = Arc::new(FakeStore::default());
        let context = sample_context();
        let progress = ProgressHandle::new(store.clone(), &context);

        let result = commit_chunks(&context, &chunks_of(1), 1, &search, store.as_ref(), &progress)
            .await;

        assert_eq!(result.unwrap_err(), StageError::Failed);
        let update = store.last_progress().expect("progress");
        assert_eq!(update.progress, Some(-1.0));
    }
}
