//! Chat-completion backends and the prompt helpers built on them.

use crate::config::get_config;
use crate::llm::split_binding;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;

/// Errors raised by chat providers.
#[derive(Debug, Error)]
pub enum ChatError {
    /// Model binding referenced a provider this worker does not know.
    #[error("Unknown chat provider in binding '{0}'")]
    UnknownProvider(String),
    /// Provider requires credentials or endpoints that are not configured.
    #[error("Chat provider misconfigured: {0}")]
    Misconfigured(String),
    /// HTTP layer failed before receiving a response.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    /// Provider returned an error or an undecodable body.
    #[error("Failed to generate completion: {0}")]
    GenerationFailed(String),
}

/// Interface implemented by chat-completion backends.
#[async_trait]
pub trait ChatModel: Send + Sync {
    /// Run one system+user exchange and return the assistant text.
    async fn chat(&self, system: &str, user: &str) -> Result<String, ChatError>;
}

/// Resolve a chat backend from a `provider/model` binding.
pub fn resolve_chat_model(binding: &str) -> Result<Box<dyn ChatModel>, ChatError> {
    let Some((provider, model)) = split_binding(binding) else {
        return Err(ChatError::UnknownProvider(binding.to_string()));
    };
    match provider {
        "openai" => {
            let config = get_config();
            let base_url = config
                .openai_base_url
                .clone()
                .unwrap_or_else(|| "https://api.openai.com".to_string());
            let api_key = config.openai_api_key.clone().ok_or_else(|| {
                ChatError::Misconfigured("DOCMILL_OPENAI_API_KEY is not set".to_string())
            })?;
            Ok(Box::new(OpenAiChat::new(base_url, api_key, model)))
        }
        "ollama" => {
            let config = get_config();
            let base_url = config
                .ollama_url
                .clone()
                .unwrap_or_else(|| "http://127.0.0.1:11434".to_string());
            Ok(Box::new(OllamaChat::new(base_url, model)))
        }
        _ => Err(ChatError::UnknownProvider(binding.to_string())),
    }
}

/// OpenAI-compatible chat-completions endpoint.
pub struct OpenAiChat {
    http: Client,
    base_url: String,
    api_key: String,
    model: String,
}

#[derive(Deserialize)]
struct OpenAiChatResponse {
    choices: Vec<OpenAiChoice>,
}

#[derive(Deserialize)]
struct OpenAiChoice {
    message: OpenAiChatMessage,
}

#[derive(Deserialize)]
struct OpenAiChatMessage {
    content: String,
}

impl OpenAiChat {
    /// Build an adapter for an OpenAI-compatible endpoint.
    pub fn new(base_url: String, api_key: String, model: &str) -> Self {
        let http = Client::builder()
            .user_agent("docmill/chat")
            .build()
            .expect("Failed to construct reqwest::Client for chat");
        Self {
            http,
            base_url,
            api_key,
            model: model.to_string(),
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/v1/chat/completions", self.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl ChatModel for OpenAiChat {
    async fn chat(&self, system: &str, user: &str) -> Result<String, ChatError> {
        let payload = json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": user},
            ],
            "temperature": 0.1,
        });

        let response = self
            .http
            .post(self.endpoint())
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ChatError::GenerationFailed(format!(
                "provider returned {status}: {body}"
            )));
        }

        let body: OpenAiChatResponse = response.json().await.map_err(|error| {
            ChatError::GenerationFailed(format!("undecodable response: {error}"))
        })?;
        let choice = body
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| ChatError::GenerationFailed("empty choices".to_string()))?;
        Ok(choice.message.content.trim().to_string())
    }
}

/// Local Ollama generation endpoint.
pub struct OllamaChat {
    http: Client,
    base_url: String,
    model: String,
}

#[derive(Debug, Deserialize)]
struct OllamaGenerateResponse {
    response: String,
    done: bool,
}

impl OllamaChat {
    /// Build an adapter for a local Ollama runtime.
    pub fn new(base_url: String, model: &str) -> Self {
        let http = Client::builder()
            .user_agent("docmill/chat")
            .build()
            .expect("Failed to construct reqwest::Client for chat");
        Self {
            http,
            base_url,
            model: model.to_string(),
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/api/generate", self.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl ChatModel for OllamaChat {
    async fn chat(&self, system: &str, user: &str) -> Result<String, ChatError> {
        let payload = json!({
            "model": self.model,
            "system": system,
            "prompt": user,
            "stream": false,
            "options": {
                // Lower temperature for reproducible extraction.
                "temperature": 0.1,
            }
        });

        let response = self.http.post(self.endpoint()).json(&payload).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ChatError::GenerationFailed(format!(
                "Ollama returned {status}: {body}"
            )));
        }

        let body: OllamaGenerateResponse = response.json().await.map_err(|error| {
            ChatError::GenerationFailed(format!("undecodable response: {error}"))
        })?;
        if !body.done {
            return Err(ChatError::GenerationFailed(
                "Ollama response incomplete (streaming not supported)".into(),
            ));
        }
        Ok(body.response.trim().to_string())
    }
}

/// Extract up to `topn` keywords from a content fragment.
///
/// Returns the provider's comma-separated keyword list.
pub async fn extract_keywords(
    model: &dyn ChatModel,
    content: &str,
    topn: u32,
) -> Result<String, ChatError> {
    let system = format!(
        "You are a text analyzer. Extract the {topn} most important keywords \
         from the given text. Answer with the keywords only, in the language \
         of the text, separated by commas, without numbering or explanation."
    );
    model.chat(&system, content).await
}

/// Propose `num` representative questions a reader might ask of the fragment.
pub async fn propose_questions(
    model: &dyn ChatModel,
    content: &str,
    num: u32,
) -> Result<String, ChatError> {
    let system = format!(
        "You are a text analyzer. Propose {num} questions that the given text \
         answers. Answer with the questions only, in the language of the text, \
         one per line, without numbering or explanation."
    );
    model.chat(&system, content).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::{Method::POST, MockServer};

    #[tokio::test]
    async fn openai_chat_returns_first_choice() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/v1/chat/completions");
                then.status(200).json_body(json!({
                    "choices": [
                        {"message": {"role": "assistant", "content": "alpha, beta"}}
                    ]
                }));
            })
            .await;

        let model = OpenAiChat::new(server.base_url(), "key".into(), "gpt-4o-mini");
        let answer = model.chat("system", "user").await.expect("chat");
        assert_eq!(answer, "alpha, beta");
    }

    #[tokio::test]
    async fn ollama_chat_requires_completed_response() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/api/generate");
                then.status(200).json_body(json!({
                    "response": "partial",
                    "done": false
                }));
            })
            .await;

        let model = OllamaChat::new(server.base_url(), "llama3");
        let error = model.chat("system", "user").await.expect_err("incomplete");
        assert!(matches!(error, ChatError::GenerationFailed(_)));
    }

    #[tokio::test]
    async fn keyword_prompt_carries_budget() {
        struct Capture;

        #[async_trait]
        impl ChatModel for Capture {
            async fn chat(&self, system: &str, _user: &str) -> Result<String, ChatError> {
                assert!(system.contains("5 most important keywords"));
                Ok("alpha, beta".to_string())
            }
        }

        let keywords = extract_keywords(&Capture, "content", 5).await.expect("keywords");
        assert_eq!(keywords, "alpha, beta");
    }

    #[test]
    fn unknown_provider_is_a_configuration_error() {
        let error = resolve_chat_model("mystery/model").err().expect("unknown provider");
        assert!(matches!(error, ChatError::UnknownProvider(_)));
    }
}
