//! Progress reporting and cooperative cancellation.

use crate::store::{MetadataStore, ProgressUpdate, TaskContext};
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Cancellation was observed while recording progress.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("task cancelled")]
pub struct Cancelled;

/// Per-task progress channel.
///
/// Every write re-reads the store's cancellation flag, so external cancel
/// requests are observed at the next stage boundary: the message gains a
/// ` [Canceled]` suffix, progress is forced to `-1`, the token trips, and the
/// caller receives [`Cancelled`]. Once the token is tripped the pipeline
/// stops issuing further external calls for the task.
#[derive(Clone)]
pub struct ProgressHandle {
    store: Arc<dyn MetadataStore>,
    task_id: String,
    from_page: i64,
    to_page: i64,
    cancel: CancellationToken,
}

impl ProgressHandle {
    /// Build a handle for a claimed task.
    pub fn new(store: Arc<dyn MetadataStore>, context: &TaskContext) -> Self {
        Self::for_task(store, &context.id, context.from_page, context.to_page)
    }

    /// Build a handle from explicit task coordinates.
    pub fn for_task(
        store: Arc<dyn MetadataStore>,
        task_id: &str,
        from_page: i64,
        to_page: i64,
    ) -> Self {
        Self {
            store,
            task_id: task_id.to_string(),
            from_page,
            to_page,
            cancel: CancellationToken::new(),
        }
    }

    /// Whether cancellation has already been observed.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Record a progress message without changing the value.
    pub async fn message(&self, message: &str) -> Result<(), Cancelled> {
        self.set(None, message).await
    }

    /// Record a progress value without a message.
    pub async fn value(&self, progress: f32) -> Result<(), Cancelled> {
        self.set(Some(progress), "").await
    }

    /// Record progress and/or a message for the task.
    ///
    /// Negative progress marks the message with an `[ERROR]` prefix; page
    /// ranged tasks gain a `Page(a~b):` prefix so observers can tell windows
    /// apart. Store write failures are logged, not escalated; losing one
    /// progress line must not fail the pipeline.
    pub async fn set(&self, progress: Option<f32>, message: &str) -> Result<(), Cancelled> {
        let mut message = message.to_string();
        let mut progress = progress;
        if matches!(progress, Some(value) if value < 0.0) {
            message = format!("[ERROR]{message}");
        }

        let cancelled = match self.store.cancel_requested(&self.task_id).await {
            Ok(cancelled) => cancelled,
            Err(error) => {
                tracing::warn!(task_id = %self.task_id, error = %error, "Cancellation probe failed");
                false
            }
        };
        if cancelled {
            message.push_str(" [Canceled]");
            progress = Some(-1.0);
        }

        if self.to_page > 0 && !message.is_empty() {
            message = format!(
                "Page({}~{}): {}",
                self.from_page + 1,
                self.to_page + 1,
                message
            );
        }

        let update = ProgressUpdate {
            message: (!message.is_empty()).then_some(message),
            progress,
        };
        if update.message.is_some() || update.progress.is_some() {
            if let Err(error) = self.store.update_progress(&self.task_id, &update).await {
                tracing::error!(task_id = %self.task_id, error = %error, "Failed to record progress");
            }
        }

        if cancelled {
            self.cancel.cancel();
            return Err(Cancelled);
        }
        Ok(())
    }

    /// Observe cancellation without contributing a progress line.
    ///
    /// Used at the edges of the indexing commit: a no-op when the task is
    /// live, but a cancel still lands the terminal `-1` with the
    /// ` [Canceled]` suffix and trips the token.
    pub async fn checkpoint(&self) -> Result<(), Cancelled> {
        self.set(None, "").await
    }
}
