use serde::Deserialize;
use std::env;
use std::sync::OnceLock;
use thiserror::Error;

/// Errors encountered while loading configuration from environment variables.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Required environment variable was not provided.
    #[error("Missing environment variable: {0}")]
    MissingVariable(String),
    /// Environment variable contained a value that could not be parsed.
    #[error("Invalid value for environment variable: {0}")]
    InvalidValue(String),
}

/// Maximum accepted document size when no override is configured, in megabytes.
const DEFAULT_MAX_DOC_SIZE_MB: u64 = 128;

/// Runtime configuration for a docmill worker process.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Redis endpoint backing the shared task queue.
    pub redis_url: String,
    /// Stream key holding pending task messages.
    pub task_stream: String,
    /// Consumer group shared by every worker process.
    pub consumer_group: String,
    /// Base URL of the metadata store service.
    pub store_url: String,
    /// Base URL of the blob storage service.
    pub blob_url: String,
    /// Base URL of the search index service.
    pub search_url: String,
    /// Optional API key required by the search index service.
    pub search_api_key: Option<String>,
    /// Optional base URL for OpenAI-compatible model providers.
    pub openai_base_url: Option<String>,
    /// Optional API key for OpenAI-compatible model providers.
    pub openai_api_key: Option<String>,
    /// Optional base URL of a local Ollama runtime.
    pub ollama_url: Option<String>,
    /// Documents larger than this many megabytes are rejected before fetch.
    pub max_doc_size_mb: u64,
}

impl Config {
    /// Load configuration from environment variables, performing validation along the way.
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            redis_url: load_env("DOCMILL_REDIS_URL")?,
            task_stream: load_env_optional("DOCMILL_TASK_STREAM")
                .unwrap_or_else(|| "docmill_task_stream".to_string()),
            consumer_group: load_env_optional("DOCMILL_CONSUMER_GROUP")
                .unwrap_or_else(|| "docmill_task_broker".to_string()),
            store_url: load_env("DOCMILL_STORE_URL")?,
            blob_url: load_env("DOCMILL_BLOB_URL")?,
            search_url: load_env("DOCMILL_SEARCH_URL")?,
            search_api_key: load_env_optional("DOCMILL_SEARCH_API_KEY"),
            openai_base_url: load_env_optional("DOCMILL_OPENAI_BASE_URL"),
            openai_api_key: load_env_optional("DOCMILL_OPENAI_API_KEY"),
            ollama_url: load_env_optional("DOCMILL_OLLAMA_URL"),
            max_doc_size_mb: load_env_optional("DOCMILL_MAX_DOC_SIZE_MB")
                .map(|value| {
                    value
                        .parse()
                        .map_err(|_| ConfigError::InvalidValue("DOCMILL_MAX_DOC_SIZE_MB".into()))
                })
                .transpose()?
                .unwrap_or(DEFAULT_MAX_DOC_SIZE_MB),
        })
    }

    /// Document size ceiling in bytes.
    pub fn max_doc_size_bytes(&self) -> u64 {
        self.max_doc_size_mb * 1024 * 1024
    }
}

fn load_env(key: &str) -> Result<String, ConfigError> {
    env::var(key).map_err(|_| ConfigError::MissingVariable(key.to_string()))
}

fn load_env_optional(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

/// Global configuration cache populated during process start.
pub static CONFIG: OnceLock<Config> = OnceLock::new();

/// Retrieve the loaded configuration, panicking if initialization has not occurred.
pub fn get_config() -> &'static Config {
    CONFIG.get().expect("Config not initialized")
}

/// Load configuration from the environment and install it in the global cache.
pub fn init_config() {
    dotenvy::dotenv().ok();
    let config = Config::from_env().expect("Failed to load config from environment");
    tracing::debug!(
        redis_url = %config.redis_url,
        task_stream = %config.task_stream,
        consumer_group = %config.consumer_group,
        store_url = %config.store_url,
        search_url = %config.search_url,
        max_doc_size_mb = config.max_doc_size_mb,
        "Loaded configuration"
    );
    CONFIG.set(config).expect("Failed to set config");
}
