//! Queue consumer loop, per-task driver, and liveness heartbeat.
//!
//! One worker process runs one consumer loop: recover this consumer's
//! unacknowledged message if any, otherwise claim new work, drive the claimed
//! task through the full pipeline, and only then acknowledge the queue
//! message. A single task's failure never crashes the loop; only queue
//! connectivity problems pause it briefly. Horizontal scale-out is achieved
//! by running more worker processes under the same consumer group.

use crate::blob::{BlobError, BlobStorage};
use crate::config::get_config;
use crate::llm::{resolve_chat_model, resolve_embedding_model};
use crate::pipeline::{
    ProgressHandle, StageError, build_chunks, commit_chunks, embed_chunks, run_raptor,
};
use crate::queue::{Delivery, QueueError, TaskMessage, TaskQueue};
use crate::search::{SearchError, SearchIndex};
use crate::store::{HttpMetadataStore, MetadataStore, StoreError, TaskContext, claim_task};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use time::OffsetDateTime;

/// How long a claim blocks waiting for new work when not overridden, in
/// milliseconds.
const DEFAULT_POLL_BLOCK_MS: u64 = 1000;
/// Pause after a queue connectivity error before polling again.
const QUEUE_RETRY_DELAY: Duration = Duration::from_secs(1);
/// Seconds between liveness records.
const HEARTBEAT_INTERVAL_SECS: u64 = 30;
/// Bounded ring of recent heartbeat timestamps.
const HEARTBEAT_RING_CAPACITY: usize = 60;
/// Time-to-live of the published liveness record.
const HEARTBEAT_TTL_SECS: u64 = 120;

/// Errors raised while bootstrapping a worker.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// Queue connection failed.
    #[error("Queue setup failed: {0}")]
    Queue(#[from] QueueError),
    /// Metadata store client could not be constructed.
    #[error("Metadata store setup failed: {0}")]
    Store(#[from] StoreError),
    /// Blob storage client could not be constructed.
    #[error("Blob storage setup failed: {0}")]
    Blob(#[from] BlobError),
    /// Search index client could not be constructed.
    #[error("Search index setup failed: {0}")]
    Search(#[from] SearchError),
}

/// A worker process's consumer loop and its service handles.
pub struct Worker {
    queue: TaskQueue,
    store: Arc<dyn MetadataStore>,
    blob: BlobStorage,
    search: SearchIndex,
    consumer: String,
    max_doc_size_bytes: u64,
    poll_block_ms: u64,
}

impl Worker {
    /// Connect every service client and register the consumer identity.
    pub async fn connect(ordinal: u32) -> Result<Self, WorkerError> {
        let config = get_config();
        let queue = TaskQueue::connect(
            &config.redis_url,
            &config.task_stream,
            &config.consumer_group,
        )
        .await?;
        let consumer = format!("task_consumer_{ordinal}");
        tracing::info!(consumer = %consumer, "Worker connected");
        Ok(Self {
            queue,
            store: Arc::new(HttpMetadataStore::new()?),
            blob: BlobStorage::new()?,
            search: SearchIndex::new()?,
            consumer,
            max_doc_size_bytes: config.max_doc_size_bytes(),
            poll_block_ms: DEFAULT_POLL_BLOCK_MS,
        })
    }

    /// Override how long a poll blocks waiting for new work.
    pub fn with_poll_block_ms(mut self, poll_block_ms: u64) -> Self {
        self.poll_block_ms = poll_block_ms;
        self
    }

    /// Queue handle, used to attach the heartbeat task.
    pub fn queue(&self) -> &TaskQueue {
        &self.queue
    }

    /// Consumer identity owned by this worker.
    pub fn consumer(&self) -> &str {
        &self.consumer
    }

    /// Run the consumer loop forever.
    pub async fn run(&self) {
        loop {
            self.poll_once().await;
        }
    }

    /// One poll cycle: recover or claim, process, acknowledge.
    pub async fn poll_once(&self) {
        let delivery = match self.next_delivery().await {
            Ok(Some(delivery)) => delivery,
            Ok(None) => return,
            Err(error) => {
                tracing::error!(error = %error, "Get task event from queue failed");
                tokio::time::sleep(QUEUE_RETRY_DELAY).await;
                return;
            }
        };

        let should_ack = handle_message(
            &delivery.message,
            self.store.clone(),
            &self.blob,
            &self.search,
            self.max_doc_size_bytes,
        )
        .await;

        if should_ack {
            if let Err(error) = self.queue.ack(&delivery.stream_id).await {
                tracing::warn!(
                    stream_id = %delivery.stream_id,
                    error = %error,
                    "Failed to acknowledge message"
                );
            }
        }
    }

    async fn next_delivery(&self) -> Result<Option<Delivery>, QueueError> {
        if let Some(delivery) = self.queue.recover_unacked(&self.consumer).await? {
            tracing::info!(
                stream_id = %delivery.stream_id,
                task_id = %delivery.message.id,
                "Recovered unacknowledged message"
            );
            return Ok(Some(delivery));
        }
        self.queue.claim_new(&self.consumer, self.poll_block_ms).await
    }
}

/// Process one claimed message end to end.
///
/// Returns whether the message should be acknowledged: `true` after any
/// completed handling (success, controlled failure, cancellation, or an
/// already-cancelled or abandoned task), `false` only when the claim itself
/// hit a store outage, in which case the message stays pending and is
/// recovered on a later cycle.
pub async fn handle_message(
    message: &TaskMessage,
    store: Arc<dyn MetadataStore>,
    blob: &BlobStorage,
    search: &SearchIndex,
    max_doc_size_bytes: u64,
) -> bool {
    match store.cancel_requested(&message.id).await {
        Ok(true) => {
            tracing::info!(task_id = %message.id, "Task has been canceled; skipping");
            return true;
        }
        Ok(false) => {}
        Err(error) => {
            tracing::warn!(task_id = %message.id, error = %error, "Cancellation probe failed");
        }
    }

    let context = match claim_task(store.as_ref(), &message.id).await {
        Ok(Some(context)) => context,
        Ok(None) => return true,
        Err(error) => {
            tracing::error!(task_id = %message.id, error = %error, "Claim failed; leaving message pending");
            return false;
        }
    };

    process_task(
        &context,
        message.is_raptor(),
        store,
        blob,
        search,
        max_doc_size_bytes,
    )
    .await;
    true
}

/// Drive a claimed task through its stages.
///
/// Every stage converts its own failures into progress updates; by the time
/// this returns the task is in a terminal or abandoned state and the caller
/// only has to acknowledge the queue message.
pub async fn process_task(
    context: &TaskContext,
    raptor: bool,
    store: Arc<dyn MetadataStore>,
    blob: &BlobStorage,
    search: &SearchIndex,
    max_doc_size_bytes: u64,
) {
    let progress = ProgressHandle::new(store.clone(), context);

    let embedding = match resolve_embedding_model(&context.embedding_id) {
        Ok(model) => model,
        Err(error) => {
            tracing::error!(task_id = %context.id, error = %error, "Embedding model unavailable");
            let _ = progress.set(Some(-1.0), &error.to_string()).await;
            return;
        }
    };

    let (chunks, token_count) = if raptor {
        let Some(raptor_config) = context
            .parser_config
            .raptor
            .as_ref()
            .filter(|config| config.use_raptor)
        else {
            let _ = progress
                .set(Some(-1.0), "Recursive summarization is not configured for this document.")
                .await;
            return;
        };
        let chat = match resolve_chat_model(&context.chat_id) {
            Ok(model) => model,
            Err(error) => {
                tracing::error!(task_id = %context.id, error = %error, "Chat model unavailable");
                let _ = progress.set(Some(-1.0), &error.to_string()).await;
                return;
            }
        };
        match run_raptor(
            context,
            raptor_config,
            chat.as_ref(),
            embedding.as_ref(),
            search,
            &progress,
        )
        .await
        {
            Ok(outcome) => (outcome.chunks, outcome.token_count),
            Err(StageError::Cancelled) => return,
            Err(StageError::Failed) => return,
        }
    } else {
        let needs_chat = context.parser_config.auto_keywords > 0
            || context.parser_config.auto_questions > 0;
        let chat = if needs_chat {
            match resolve_chat_model(&context.chat_id) {
                Ok(model) => Some(model),
                Err(error) => {
                    tracing::error!(task_id = %context.id, error = %error, "Chat model unavailable");
                    let _ = progress.set(Some(-1.0), &error.to_string()).await;
                    return;
                }
            }
        } else {
            None
        };

        let mut chunks = match build_chunks(
            context,
            store.as_ref(),
            blob,
            chat.as_deref(),
            max_doc_size_bytes,
            &progress,
        )
        .await
        {
            Ok(chunks) => chunks,
            Err(_) => return,
        };
        if chunks.is_empty() {
            let _ = progress.set(Some(1.0), "No chunk! Done!").await;
            return;
        }
        if progress
            .message(&format!(
                "Finished slicing files({}). Start to embedding the content.",
                chunks.len()
            ))
            .await
            .is_err()
        {
            return;
        }

        let token_count = match embed_chunks(
            &mut chunks,
            embedding.as_ref(),
            &context.parser_config,
            &progress,
        )
        .await
        {
            Ok(token_count) => token_count,
            Err(_) => return,
        };
        if progress
            .message("Finished embedding! Start to build index!")
            .await
            .is_err()
        {
            return;
        }
        (chunks, token_count)
    };

    let _ = commit_chunks(context, &chunks, token_count, search, store.as_ref(), &progress).await;
}

/// Spawn the background liveness heartbeat.
///
/// Appends a timestamp to a mutex-guarded bounded ring every interval and
/// publishes the ring under the consumer's liveness key with a short
/// time-to-live, so operators can spot stalled workers.
pub fn spawn_heartbeat(queue: TaskQueue, consumer: String) -> tokio::task::JoinHandle<()> {
    let ring: Arc<Mutex<VecDeque<f64>>> = Arc::new(Mutex::new(VecDeque::new()));
    tokio::spawn(async move {
        let mut ticker =
            tokio::time::interval(Duration::from_secs(HEARTBEAT_INTERVAL_SECS));
        loop {
            ticker.tick().await;
            let payload = {
                let mut ring = ring.lock().expect("heartbeat ring lock");
                push_heartbeat(&mut ring, now_epoch_seconds());
                serde_json::to_string(&ring.iter().copied().collect::<Vec<f64>>())
                    .unwrap_or_default()
            };
            let key = format!("docmill:liveness:{consumer}");
            if let Err(error) = queue
                .publish_liveness(&key, &payload, HEARTBEAT_TTL_SECS)
                .await
            {
                tracing::warn!(error = %error, "Failed to publish liveness record");
            }
        }
    })
}

fn push_heartbeat(ring: &mut VecDeque<f64>, timestamp: f64) {
    ring.push_back(timestamp);
    while ring.len() > HEARTBEAT_RING_CAPACITY {
        ring.pop_front();
    }
}

fn now_epoch_seconds() -> f64 {
    let now = OffsetDateTime::now_utc();
    now.unix_timestamp() as f64 + f64::from(now.nanosecond()) / 1e9
}
