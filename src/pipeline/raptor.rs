//! Recursive clustering and summarization over a document's chunks.
//!
//! RAPTOR builds a tree of synthetic chunks above the leaves: each round
//! clusters the most recent layer of `(text, vector)` pairs, summarizes every
//! cluster through the chat capability, re-embeds the summaries, and appends
//! them as the next layer. The loop ends when a layer collapses to a single
//! item. Only the synthesized pairs become new chunks; the leaves are never
//! duplicated.

use crate::llm::{ChatModel, EmbeddingModel};
use crate::pipeline::progress::ProgressHandle;
use crate::pipeline::{Chunk, StageError};
use crate::search::{SearchIndex, index_name};
use crate::store::{RaptorConfig, TaskContext};
use crate::tokenize::{count_tokens, tokenize, truncate_tokens};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::index::sample;

/// Hard bound on summary layers; the clustering already guarantees each
/// layer shrinks, this only guards against degenerate configs.
const MAX_LAYERS: usize = 32;
/// K-means assignment/update rounds per layer.
const KMEANS_ROUNDS: usize = 64;

/// Result of a RAPTOR run: the synthetic chunks and their token footprint.
#[derive(Debug)]
pub struct RaptorOutcome {
    /// Newly synthesized summary chunks, ready for the index commit.
    pub chunks: Vec<Chunk>,
    /// Token count across the synthesized contents.
    pub token_count: usize,
}

/// Build the recursive summary tree for a document.
///
/// Reads the document's already-indexed chunks back from the search index,
/// iterates cluster→summarize→re-embed until the working set collapses, and
/// returns the synthesized chunks stamped with the document's title
/// tokenization so they participate in the same retrieval fields as leaves.
pub async fn run_raptor(
    context: &TaskContext,
    config: &RaptorConfig,
    chat: &dyn ChatModel,
    embed: &dyn EmbeddingModel,
    search: &SearchIndex,
    progress: &ProgressHandle,
) -> Result<RaptorOutcome, StageError> {
    // Probe the model's output dimension to learn the vector field name.
    let vector_field = match embed.encode(&["ok".to_string()]).await {
        Ok((vectors, _)) if !vectors.is_empty() => Chunk::vector_field_name(vectors[0].len()),
        Ok(_) => {
            progress
                .set(Some(-1.0), "Embedding model returned no probe vector.")
                .await?;
            return Err(StageError::Failed);
        }
        Err(error) => {
            progress
                .set(Some(-1.0), &format!("Embedding error:{error}"))
                .await?;
            return Err(StageError::Failed);
        }
    };

    let index = index_name(&context.tenant_id);
    let mut items = match search
        .list_chunks(&index, &context.doc_id, &vector_field)
        .await
    {
        Ok(items) => items,
        Err(error) => {
            progress
                .set(Some(-1.0), &format!("Failed to read back chunks: {error}"))
                .await?;
            return Err(StageError::Failed);
        }
    };

    let original_count = items.len();
    let mut rng = StdRng::seed_from_u64(config.random_seed);
    let mut start = 0usize;
    let mut end = items.len();

    for _ in 0..MAX_LAYERS {
        if end - start <= 1 {
            break;
        }
        let layer: Vec<&[f32]> = items[start..end]
            .iter()
            .map(|(_, vector)| vector.as_slice())
            .collect();
        let clusters = cluster_layer(&layer, config.max_cluster, config.threshold, &mut rng);
        progress
            .message(&format!(
                "Cluster one layer: {} -> {}",
                end - start,
                clusters.len()
            ))
            .await?;

        let mut summaries = Vec::with_capacity(clusters.len());
        for cluster in &clusters {
            let cluster_content = cluster
                .iter()
                .map(|&member| items[start + member].0.as_str())
                .collect::<Vec<_>>()
                .join("\n");
            let prompt = config.prompt.replace("{cluster_content}", &cluster_content);
            let summary = match chat.chat(&prompt, "Output:").await {
                Ok(summary) => truncate_tokens(&summary, config.max_token),
                Err(error) => {
                    progress
                        .set(Some(-1.0), &format!("Summarization error: {error}"))
                        .await?;
                    return Err(StageError::Failed);
                }
            };
            summaries.push(summary);
        }

        let (vectors, _) = match embed.encode(&summaries).await {
            Ok(encoded) => encoded,
            Err(error) => {
                progress
                    .set(Some(-1.0), &format!("Embedding error:{error}"))
                    .await?;
                return Err(StageError::Failed);
            }
        };
        items.extend(summaries.into_iter().zip(vectors));

        start = end;
        end = items.len();
    }

    let title_tks = tokenize(&context.name);
    let mut token_count = 0usize;
    let chunks = items
        .drain(..)
        .skip(original_count)
        .map(|(content, vector)| {
            token_count += count_tokens(&content);
            let mut chunk = Chunk::from_content(content, &context.doc_id, &context.kb_id);
            chunk.docnm_kwd = Some(context.name.clone());
            chunk.title_tks = Some(title_tks.clone());
            chunk.vector = Some(vector);
            chunk
        })
        .collect();

    Ok(RaptorOutcome {
        chunks,
        token_count,
    })
}

/// Cluster one layer of vectors.
///
/// Seeded k-means bounded by `max_cluster` (and by `len - 1` so every layer
/// strictly shrinks), followed by a merge pass that unions clusters whose
/// centroids are more similar than `threshold`. Returns non-empty member
/// index lists.
fn cluster_layer(
    vectors: &[&[f32]],
    max_cluster: usize,
    threshold: f32,
    rng: &mut StdRng,
) -> Vec<Vec<usize>> {
    let count = vectors.len();
    if count <= 1 {
        return vec![(0..count).collect()];
    }

    let k = (count as f64).sqrt().ceil() as usize;
    let k = k.clamp(1, max_cluster.max(1)).min(count - 1);

    let mut centroids: Vec<Vec<f32>> = sample(rng, count, k)
        .into_iter()
        .map(|index| vectors[index].to_vec())
        .collect();
    let mut assignments = vec![0usize; count];

    for _ in 0..KMEANS_ROUNDS {
        let mut changed = false;
        for (index, vector) in vectors.iter().enumerate() {
            let nearest = centroids
                .iter()
                .enumerate()
                .max_by(|(_, a), (_, b)| {
                    cosine(vector, a)
                        .partial_cmp(&cosine(vector, b))
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .map(|(cluster, _)| cluster)
                .unwrap_or(0);
            if assignments[index] != nearest {
                assignments[index] = nearest;
                changed = true;
            }
        }
        if !changed {
            break;
        }
        for (cluster, centroid) in centroids.iter_mut().enumerate() {
            let members: Vec<&[f32]> = assignments
                .iter()
                .enumerate()
                .filter(|&(_, &assigned)| assigned == cluster)
                .map(|(index, _)| vectors[index])
                .collect();
            if !members.is_empty() {
                *centroid = mean(&members);
            }
        }
    }

    // Union clusters whose centroids sit above the merge threshold.
    let mut target: Vec<usize> = (0..k).collect();
    for i in 0..k {
        for j in (i + 1)..k {
            if target[j] == j && cosine(&centroids[i], &centroids[j]) > threshold {
                target[j] = resolve(&target, i);
            }
        }
    }

    let mut members: Vec<Vec<usize>> = vec![Vec::new(); k];
    for (index, &assigned) in assignments.iter().enumerate() {
        members[resolve(&target, assigned)].push(index);
    }
    members.retain(|cluster| !cluster.is_empty());
    members
}

fn resolve(target: &[usize], mut cluster: usize) -> usize {
    while target[cluster] != cluster {
        cluster = target[cluster];
    }
    cluster
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

fn mean(vectors: &[&[f32]]) -> Vec<f32> {
    let dimension = vectors[0].len();
    let mut out = vec![0.0f32; dimension];
    for vector in vectors {
        for (slot, value) in out.iter_mut().zip(vector.iter()) {
            *slot += value;
        }
    }
    for slot in &mut out {
        *slot /= vectors.len() as f32;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{ChatError, EmbeddingError, HashedEmbedding};
    use crate::store::testing::{FakeStore, sample_context};
    use async_trait::async_trait;
    use httpmock::{Method::POST, MockServer};
    use serde_json::json;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn clustering_is_deterministic_per_seed() {
        let data: Vec<Vec<f32>> = (0..10)
            .map(|i| vec![(i % 3) as f32, (i % 5) as f32, 1.0])
            .collect();
        let refs: Vec<&[f32]> = data.iter().map(Vec::as_slice).collect();

        let first = cluster_layer(&refs, 64, 0.95, &mut StdRng::seed_from_u64(7));
        let second = cluster_layer(&refs, 64, 0.95, &mut StdRng::seed_from_u64(7));
        assert_eq!(first, second);
    }

    #[test]
    fn orthogonal_groups_stay_separate() {
        let data: Vec<Vec<f32>> = vec![
            vec![1.0, 0.0],
            vec![0.9, 0.0],
            vec![0.0, 1.0],
            vec![0.0, 0.9],
        ];
        let refs: Vec<&[f32]> = data.iter().map(Vec::as_slice).collect();

        let clusters = cluster_layer(&refs, 64, 0.95, &mut StdRng::seed_from_u64(1));
        assert_eq!(clusters.len(), 2);
        let mut sizes: Vec<usize> = clusters.iter().map(Vec::len).collect();
        sizes.sort_unstable();
        assert_eq!(sizes, vec![2, 2]);
    }

    #[test]
    fn similar_centroids_merge_into_one_cluster() {
        let data: Vec<Vec<f32>> = (0..6).map(|_| vec![0.5, 0.5]).collect();
        let refs: Vec<&[f32]> = data.iter().map(Vec::as_slice).collect();

        let clusters = cluster_layer(&refs, 64, 0.5, &mut StdRng::seed_from_u64(3));
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].len(), 6);
    }

    #[test]
    fn every_layer_shrinks() {
        // Even adversarial two-item layers must produce a single cluster.
        let data: Vec<Vec<f32>> = vec![vec![1.0, 0.0], vec![0.0, 1.0]];
        let refs: Vec<&[f32]> = data.iter().map(Vec::as_slice).collect();

        let clusters = cluster_layer(&refs, 64, 0.99, &mut StdRng::seed_from_u64(5));
        assert_eq!(clusters.len(), 1);
    }

    struct CountingChat {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ChatModel for CountingChat {
        async fn chat(&self, _system: &str, _user: &str) -> Result<String, ChatError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(format!("summary {call} of the cluster"))
        }
    }

    fn raptor_config() -> RaptorConfig {
        serde_json::from_value(json!({
            "use_raptor": true,
            "max_cluster": 64,
            "prompt": "Summarize the following:\n{cluster_content}",
            "max_token": 128,
            "threshold": 0.98,
            "random_seed": 42
        }))
        .expect("config")
    }

    #[tokio::test]
    async fn raptor_emits_only_synthetic_chunks() {
        let server = MockServer::start_async().await;
        let embed = HashedEmbedding::new(4);
        let probe = embed
            .encode(&["leaf one".to_string(), "leaf two".to_string(), "leaf three".to_string()])
            .await
            .expect("probe");
        server
            .mock_async(move |when, then| {
                when.method(POST).path("/docmill_tn1/_search");
                then.status(200).json_body(json!({
                    "hits": {"hits": [
                        {"_source": {"content_with_weight": "leaf one", "q_4_vec": probe.0[0]}},
                        {"_source": {"content_with_weight": "leaf two", "q_4_vec": probe.0[1]}},
                        {"_source": {"content_with_weight": "leaf three", "q_4_vec": probe.0[2]}}
                    ]}
                }));
            })
            .await;

        let search = SearchIndex::with_base_url(&server.base_url(), None).expect("search client");
        let store = Arc::new(FakeStore::default());
        let context = sample_context();
        let progress = ProgressHandle::new(store.clone(), &context);
        let chat = CountingChat {
            calls: AtomicUsize::new(0),
        };

        let outcome = run_raptor(&context, &raptor_config(), &chat, &embed, &search, &progress)
            .await
            .expect("raptor");

        assert!(!outcome.chunks.is_empty());
        assert!(outcome.token_count > 0);
        for chunk in &outcome.chunks {
            assert!(chunk.content_with_weight.starts_with("summary"));
            assert!(chunk.vector.is_some());
            assert_eq!(chunk.title_tks.as_deref(), Some("notes txt"));
        }
        // Leaves are never re-emitted.
        let leaf_id = Chunk::content_id("leaf one", "d1");
        assert!(outcome.chunks.iter().all(|chunk| chunk.id != leaf_id));
    }

    #[tokio::test]
    async fn single_chunk_documents_build_no_tree() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/docmill_tn1/_search");
                then.status(200).json_body(json!({
                    "hits": {"hits": [
                        {"_source": {"content_with_weight": "only leaf", "q_4_vec": [1.0, 0.0, 0.0, 0.0]}}
                    ]}
                }));
            })
            .await;

        let search = SearchIndex::with_base_url(&server.base_url(), None).expect("search client");
        let store = Arc::new(FakeStore::default());
        let context = sample_context();
        let progress = ProgressHandle::new(store.clone(), &context);
        let chat = CountingChat {
            calls: AtomicUsize::new(0),
        };
        let embed = HashedEmbedding::new(4);

        let outcome = run_raptor(&context, &raptor_config(), &chat, &embed, &search, &progress)
            .await
            .expect("raptor");

        assert!(outcome.chunks.is_empty());
        assert_eq!(outcome.token_count, 0);
        assert_eq!(chat.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn summarization_failure_marks_task_failed() {
        struct FailingChat;

        #[async_trait]
        impl ChatModel for FailingChat {
            async fn chat(&self, _system: &str, _user: &str) -> Result<String, ChatError> {
                Err(ChatError::GenerationFailed("model offline".into()))
            }
        }

        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/docmill_tn1/_search");
                then.status(200).json_body(json!({
                    "hits": {"hits": [
                        {"_source": {"content_with_weight": "a", "q_4_vec": [1.0, 0.0, 0.0, 0.0]}},
                        {"_source": {"content_with_weight": "b", "q_4_vec": [0.0, 1.0, 0.0, 0.0]}}
                    ]}
                }));
            })
            .await;

        let search = SearchIndex::with_base_url(&server.base_url(), None).expect("search client");
        let store = Arc::new(FakeStore::default());
        let context = sample_context();
        let progress = ProgressHandle::new(store.clone(), &context);
        let embed = HashedEmbedding::new(4);

        let result = run_raptor(
            &context,
            &raptor_config(),
            &FailingChat,
            &embed,
            &search,
            &progress,
        )
        .await;

        assert_eq!(result.unwrap_err(), StageError::Failed);
        let update = store.last_progress().expect("progress");
        assert_eq!(update.progress, Some(-1.0));
        assert!(update.message.expect("message").contains("Summarization error"));
    }

    #[tokio::test]
    async fn embedding_is_unused_when_probe_fails() {
        struct BrokenEmbedding;

        #[async_trait]
        impl crate::llm::EmbeddingModel for BrokenEmbedding {
            async fn encode(
                &self,
                _texts: &[String],
            ) -> Result<(Vec<Vec<f32>>, usize), EmbeddingError> {
                Err(EmbeddingError::GenerationFailed("no backend".into()))
            }

            async fn encode_queries(
                &self,
                _text: &str,
            ) -> Result<(Vec<f32>, usize), EmbeddingError> {
                Err(EmbeddingError::GenerationFailed("no backend".into()))
            }
        }

        let search = SearchIndex::with_base_url("http://127.0.0.1:1", None).expect("search client");
        let store = Arc::new(FakeStore::default());
        let context = sample_context();
        let progress = ProgressHandle::new(store.clone(), &context);
        let chat = CountingChat {
            calls: AtomicUsize::new(0),
        };

        let result = run_raptor(
            &context,
            &raptor_config(),
            &chat,
            &BrokenEmbedding,
            &search,
            &progress,
        )
        .await;

        assert_eq!(result.unwrap_err(), StageError::Failed);
    }
}
