//! Chunk build stage: fetch, dispatch, stamp, and optional enrichment.

use crate::blob::{BlobError, BlobStorage};
use crate::chunking::{ChunkRequest, resolve_chunker};
use crate::llm::{ChatModel, extract_keywords, propose_questions};
use crate::pipeline::progress::ProgressHandle;
use crate::pipeline::{Chunk, StageError};
use crate::store::{MetadataStore, TaskContext};
use crate::tokenize::{fine_grained_tokenize, tokenize};

/// Turn a claimed task into stamped content chunks.
///
/// Enforces the document size ceiling before any byte is fetched, dispatches
/// to the chunker registered for the document's parser profile, stamps every
/// fragment with its deterministic id and linkage, moves embedded images into
/// blob storage, and runs the optional keyword/question enrichment passes.
/// Failures are recorded as progress `-1` before returning.
pub async fn build_chunks(
    context: &TaskContext,
    store: &dyn MetadataStore,
    blob: &BlobStorage,
    chat: Option<&dyn ChatModel>,
    max_doc_size_bytes: u64,
    progress: &ProgressHandle,
) -> Result<Vec<Chunk>, StageError> {
    if context.size > max_doc_size_bytes {
        progress
            .set(
                Some(-1.0),
                &format!(
                    "File size exceeds( <= {}Mb )",
                    max_doc_size_bytes / 1024 / 1024
                ),
            )
            .await?;
        return Err(StageError::Failed);
    }

    let started = std::time::Instant::now();
    let bytes = match fetch_document(context, store, blob).await {
        Ok(bytes) => bytes,
        Err(FetchFailure::NotFound) => {
            progress
                .set(
                    Some(-1.0),
                    &format!(
                        "Can not find file <{}> from storage. Could you try it again?",
                        context.name
                    ),
                )
                .await?;
            return Err(StageError::Failed);
        }
        Err(FetchFailure::Other(detail)) => {
            progress
                .set(Some(-1.0), &format!("Get file from storage: {detail}"))
                .await?;
            return Err(StageError::Failed);
        }
    };
    tracing::info!(
        doc_id = %context.doc_id,
        location = %context.location,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Fetched document from storage"
    );

    let chunker = match resolve_chunker(&context.parser_id) {
        Ok(chunker) => chunker,
        Err(error) => {
            progress.set(Some(-1.0), &error.to_string()).await?;
            return Err(StageError::Failed);
        }
    };

    let started = std::time::Instant::now();
    let request = ChunkRequest {
        name: &context.name,
        bytes: &bytes,
        from_page: context.from_page,
        to_page: context.to_page,
        language: &context.language,
        parser_config: &context.parser_config,
    };
    let fragments = match chunker.chunk(&request) {
        Ok(fragments) => fragments,
        Err(error) => {
            progress
                .set(
                    Some(-1.0),
                    &format!("Internal server error while chunking: {error}"),
                )
                .await?;
            tracing::error!(
                doc_id = %context.doc_id,
                location = %context.location,
                error = %error,
                "Chunking failed"
            );
            return Err(StageError::Failed);
        }
    };
    tracing::info!(
        doc_id = %context.doc_id,
        fragments = fragments.len(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Chunking finished"
    );

    let title_tks = tokenize(&context.name);
    let mut chunks = Vec::with_capacity(fragments.len());
    for fragment in fragments {
        let mut chunk = Chunk::from_content(fragment.content, &context.doc_id, &context.kb_id);
        chunk.docnm_kwd = Some(context.name.clone());
        chunk.title_tks = Some(title_tks.clone());

        if let Some(image) = fragment.image {
            if let Err(error) = blob.put(&context.kb_id, &chunk.id, image).await {
                tracing::error!(
                    kb_id = %context.kb_id,
                    chunk_id = %chunk.id,
                    error = %error,
                    "Failed to store chunk image"
                );
            }
            chunk.img_id = Some(format!("{}-{}", context.kb_id, chunk.id));
        }
        chunks.push(chunk);
    }

    if context.parser_config.auto_keywords > 0 {
        let Some(chat) = chat else {
            progress
                .set(Some(-1.0), "Chat model is not configured for keyword extraction.")
                .await?;
            return Err(StageError::Failed);
        };
        progress
            .message("Start to generate keywords for every chunk ...")
            .await?;
        for chunk in &mut chunks {
            let keywords = match extract_keywords(
                chat,
                &chunk.content_with_weight,
                context.parser_config.auto_keywords,
            )
            .await
            {
                Ok(keywords) => keywords,
                Err(error) => {
                    progress
                        .set(Some(-1.0), &format!("Keyword extraction error: {error}"))
                        .await?;
                    return Err(StageError::Failed);
                }
            };
            chunk.important_kwd = keywords
                .split(',')
                .map(str::trim)
                .filter(|keyword| !keyword.is_empty())
                .map(str::to_string)
                .collect();
            chunk.important_tks = Some(tokenize(&chunk.important_kwd.join(" ")));
        }
    }

    if context.parser_config.auto_questions > 0 {
        let Some(chat) = chat else {
            progress
                .set(Some(-1.0), "Chat model is not configured for question generation.")
                .await?;
            return Err(StageError::Failed);
        };
        progress
            .message("Start to generate questions for every chunk ...")
            .await?;
        for chunk in &mut chunks {
            let questions = match propose_questions(
                chat,
                &chunk.content_with_weight,
                context.parser_config.auto_questions,
            )
            .await
            {
                Ok(questions) => questions,
                Err(error) => {
                    progress
                        .set(Some(-1.0), &format!("Question generation error: {error}"))
                        .await?;
                    return Err(StageError::Failed);
                }
            };
            chunk.content_with_weight = format!(
                "Question: \n{questions}\n\nAnswer:\n{}",
                chunk.content_with_weight
            );
            let question_tks = tokenize(&questions);
            chunk.content_ltks.push(' ');
            chunk.content_ltks.push_str(&question_tks);
            chunk.content_sm_ltks.push(' ');
            chunk
                .content_sm_ltks
                .push_str(&fine_grained_tokenize(&question_tks));
        }
    }

    Ok(chunks)
}

enum FetchFailure {
    NotFound,
    Other(String),
}

async fn fetch_document(
    context: &TaskContext,
    store: &dyn MetadataStore,
    blob: &BlobStorage,
) -> Result<Vec<u8>, FetchFailure> {
    let (bucket, name) = store
        .storage_address(&context.doc_id)
        .await
        .map_err(|error| FetchFailure::Other(error.to_string()))?;
    match blob.get(&bucket, &name).await {
        Ok(bytes) => Ok(bytes),
        Err(BlobError::NotFound { .. }) => Err(FetchFailure::NotFound),
        Err(error) => Err(FetchFailure::Other(error.to_string())),
    }
}
