//! Embedding and chat model capabilities.
//!
//! Model backends are entirely swappable: each provider adapter implements a
//! small capability trait ([`EmbeddingModel`] or [`ChatModel`]) and is
//! selected at runtime from a `provider/model` binding string carried on the
//! knowledge base or tenant. An unknown provider is a configuration error
//! surfaced to the caller, never a silent default.

mod chat;
mod embedding;

pub use chat::{
    ChatError, ChatModel, OllamaChat, OpenAiChat, extract_keywords, propose_questions,
    resolve_chat_model,
};
pub use embedding::{
    EmbeddingError, EmbeddingModel, HashedEmbedding, OllamaEmbedding, OpenAiEmbedding,
    resolve_embedding_model,
};

/// Split a `provider/model` binding into its parts.
///
/// The model part may itself contain slashes (vendor-scoped model names), so
/// only the first separator is significant.
pub(crate) fn split_binding(binding: &str) -> Option<(&str, &str)> {
    let (provider, model) = binding.split_once('/')?;
    if provider.is_empty() || model.is_empty() {
        return None;
    }
    Some((provider, model))
}
