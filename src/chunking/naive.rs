//! Generic token-budgeted text chunker.

use crate::chunking::{ChunkRequest, ChunkingError, DocumentChunker, Fragment, decode_text};
use crate::tokenize::count_tokens;
use semchunk_rs::Chunker;

/// Default token budget per fragment.
const DEFAULT_TOKEN_BUDGET: usize = 512;

/// Semantic text chunker backing the `naive`/`general` profile.
///
/// Splits decoded text into fragments bounded by a token budget, preferring
/// paragraph and sentence boundaries over hard cuts.
pub struct NaiveChunker {
    token_budget: usize,
}

impl NaiveChunker {
    /// Build a chunker with an explicit per-fragment token budget.
    pub fn new(token_budget: usize) -> Self {
        Self {
            token_budget: token_budget.max(1),
        }
    }
}

impl Default for NaiveChunker {
    fn default() -> Self {
        Self::new(DEFAULT_TOKEN_BUDGET)
    }
}

impl DocumentChunker for NaiveChunker {
    fn chunk(&self, request: &ChunkRequest<'_>) -> Result<Vec<Fragment>, ChunkingError> {
        let text = decode_text(request.bytes);
        if text.trim().is_empty() {
            return Ok(Vec::new());
        }

        let chunker = Chunker::new(
            self.token_budget,
            Box::new(|segment: &str| count_tokens(segment)),
        );
        let fragments = chunker
            .chunk(&text)
            .into_iter()
            .filter(|segment| !segment.trim().is_empty())
            .map(Fragment::text)
            .collect();
        Ok(fragments)
    }
}
