//! Embedding stage: batch vectorization and title/content fusion.

use crate::llm::EmbeddingModel;
use crate::pipeline::progress::ProgressHandle;
use crate::pipeline::{Chunk, StageError};
use crate::store::ParserConfig;
use crate::tokenize::normalize_space;
use regex::Regex;
use std::sync::OnceLock;

/// Texts per batch-encode call.
const BATCH_SIZE: usize = 32;
/// Title weight when the parser config does not override it.
const DEFAULT_TITLE_WEIGHT: f32 = 0.1;

fn table_tag_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"</?(table|td|caption|tr|th)( [^<>]{0,12})?>").expect("valid pattern")
    })
}

/// Strip HTML table structural tags before embedding.
///
/// Table chunkers keep markup in the indexed content for rendering, but the
/// tags only add noise to the vector space.
fn strip_table_tags(content: &str) -> String {
    table_tag_pattern().replace_all(content, " ").into_owned()
}

/// Vectorize chunks in place and return the consumed token count.
///
/// Titles and contents are batched separately; when every chunk carries a
/// title vector the stored vector is `w * title + (1 - w) * content` with the
/// configured `filename_embd_weight`, otherwise the content vector alone.
/// Progress advances from 0.6 to 0.9 across the batches so observers see
/// continuous movement rather than a stage-sized jump.
pub async fn embed_chunks(
    chunks: &mut [Chunk],
    model: &dyn EmbeddingModel,
    parser_config: &ParserConfig,
    progress: &ProgressHandle,
) -> Result<usize, StageError> {
    if chunks.is_empty() {
        return Ok(0);
    }

    let titles: Vec<String> = chunks
        .iter()
        .filter_map(|chunk| chunk.title_tks.as_deref())
        .map(normalize_space)
        .collect();
    let contents: Vec<String> = chunks
        .iter()
        .map(|chunk| strip_table_tags(&chunk.content_with_weight))
        .collect();

    let mut token_count = 0usize;

    // Title vectors participate only when every chunk produced one.
    let title_vectors = if titles.len() == contents.len() {
        let mut vectors = Vec::with_capacity(titles.len());
        for (index, batch) in titles.chunks(BATCH_SIZE).enumerate() {
            let (batch_vectors, tokens) = match model.encode(batch).await {
                Ok(encoded) => encoded,
                Err(error) => {
                    progress
                        .set(Some(-1.0), &format!("Embedding error:{error}"))
                        .await?;
                    return Err(StageError::Failed);
                }
            };
            vectors.extend(batch_vectors);
            token_count += tokens;
            let done = (index * BATCH_SIZE + batch.len()) as f32;
            progress.value(0.6 + 0.1 * done / titles.len() as f32).await?;
        }
        Some(vectors)
    } else {
        None
    };

    let mut content_vectors = Vec::with_capacity(contents.len());
    for (index, batch) in contents.chunks(BATCH_SIZE).enumerate() {
        let (batch_vectors, tokens) = match model.encode(batch).await {
            Ok(encoded) => encoded,
            Err(error) => {
                progress
                    .set(Some(-1.0), &format!("Embedding error:{error}"))
                    .await?;
                return Err(StageError::Failed);
            }
        };
        content_vectors.extend(batch_vectors);
        token_count += tokens;
        let done = (index * BATCH_SIZE + batch.len()) as f32;
        progress.value(0.7 + 0.2 * done / contents.len() as f32).await?;
    }

    let title_weight = parser_config
        .filename_embd_weight
        .unwrap_or(DEFAULT_TITLE_WEIGHT);
    for (index, chunk) in chunks.iter_mut().enumerate() {
        let content_vector = &content_vectors[index];
        let vector = match &title_vectors {
            Some(title_vectors) => fuse(
                &title_vectors[index],
                content_vector,
                title_weight,
            ),
            None => content_vector.clone(),
        };
        chunk.vector = Some(vector);
    }

    Ok(token_count)
}

fn fuse(title: &[f32], content: &[f32], weight: f32) -> Vec<f32> {
    title
        .iter()
        .zip(content.iter())
        .map(|(t, c)| weight * t + (1.0 - weight) * c)
        .collect()
}
