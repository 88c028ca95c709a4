//! Parser registry and chunker capabilities.
//!
//! Each document declares a parser profile; the registry maps that profile to
//! a [`DocumentChunker`] implementation. Profiles are a fixed set: an
//! unrecognized id is a configuration error surfaced to the caller, never a
//! silent fallback. The `general` id is an explicit alias of the `naive`
//! profile. Profiles whose specialized transforms live outside this worker
//! (picture, audio, resume, ...) are routed through the generic text chunker
//! so their documents still index; their dedicated capabilities plug in here
//! when registered.

mod naive;
mod table;

pub use naive::NaiveChunker;
pub use table::TableChunker;

use crate::store::ParserConfig;
use std::sync::Arc;
use thiserror::Error;

/// Errors produced while turning raw documents into content fragments.
#[derive(Debug, Error)]
pub enum ChunkingError {
    /// Document declared a parser profile this worker does not know.
    #[error("Unknown parser id '{0}'")]
    UnknownParser(String),
    /// Raw bytes could not be interpreted by the selected chunker.
    #[error("Failed to parse document content: {0}")]
    Parse(String),
}

/// A content fragment produced by a chunker, before pipeline stamping.
#[derive(Debug, Clone, Default)]
pub struct Fragment {
    /// Fragment text as it will be indexed and embedded.
    pub content: String,
    /// Raw image bytes extracted alongside the text, if any.
    pub image: Option<Vec<u8>>,
}

impl Fragment {
    /// Build a text-only fragment.
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            image: None,
        }
    }
}

/// Inputs handed to a chunker for one task.
pub struct ChunkRequest<'a> {
    /// Document display name.
    pub name: &'a str,
    /// Raw document bytes fetched from blob storage.
    pub bytes: &'a [u8],
    /// Start of the page or row range, 0-based inclusive.
    pub from_page: i64,
    /// End of the page or row range, exclusive; `-1` means whole document.
    pub to_page: i64,
    /// Knowledge base language.
    pub language: &'a str,
    /// Parser settings from the document.
    pub parser_config: &'a ParserConfig,
}

/// Capability implemented by per-profile chunking transforms.
pub trait DocumentChunker: Send + Sync {
    /// Split the requested slice of a document into content fragments.
    fn chunk(&self, request: &ChunkRequest<'_>) -> Result<Vec<Fragment>, ChunkingError>;
}

/// Resolve the chunker registered for a parser profile.
pub fn resolve_chunker(parser_id: &str) -> Result<Arc<dyn DocumentChunker>, ChunkingError> {
    match parser_id.to_lowercase().as_str() {
        "general" | "naive" => Ok(Arc::new(NaiveChunker::default())),
        "paper" | "book" | "laws" | "manual" | "presentation" | "qa" | "resume" | "picture"
        | "one" | "audio" | "email" | "knowledge_graph" => Ok(Arc::new(NaiveChunker::default())),
        "table" => Ok(Arc::new(TableChunker)),
        other => Err(ChunkingError::UnknownParser(other.to_string())),
    }
}

/// Decode document bytes as text.
///
/// Chunkers for text-bearing profiles share this; invalid UTF-8 is replaced
/// rather than rejected so partially corrupt documents still index.
pub(crate) fn decode_text(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}
