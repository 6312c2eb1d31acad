//! OpenAI-compatible LLM client implementation.
//!
//! Implements the LlmClient trait against any OpenAI-compatible endpoint
//! (api.openai.com, vLLM, Ollama). Transient transport errors are retried
//! with exponential backoff; auth and quota failures surface immediately.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::warn;

use crate::error::{GatewayError, Result};
use crate::llm::{LlmClient, Message};

/// Default timeout for a single API attempt.
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Default API base.
const OPENAI_API_BASE: &str = "https://api.openai.com/v1";

/// Maximum tokens to generate.
const DEFAULT_MAX_TOKENS: u32 = 4096;

/// Retry schedule for transient transport errors.
const RETRY_DELAYS_SECS: [u64; 3] = [1, 2, 4];

/// OpenAI-compatible client configuration.
#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    /// API key for authentication.
    pub api_key: String,
    /// Chat model (e.g. "gpt-4o-mini").
    pub model: String,
    /// Embedding model (e.g. "text-embedding-3-small").
    pub embedding_model: String,
    /// Dimensionality of the embedding model's vectors.
    pub embedding_dimension: usize,
    /// API base URL.
    pub base_url: String,
    /// Request timeout in seconds.
    pub timeout_secs: u64,
    /// Maximum tokens to generate.
    pub max_tokens: u32,
    /// Sampling temperature.
    pub temperature: f32,
}

impl OpenAiConfig {
    /// Creates a new config with the given API key and model.
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            model: model.into(),
            embedding_model: "text-embedding-3-small".to_string(),
            embedding_dimension: 1536,
            base_url: OPENAI_API_BASE.to_string(),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            max_tokens: DEFAULT_MAX_TOKENS,
            temperature: 0.0,
        }
    }

    /// Sets the API base URL (for vLLM/Ollama style endpoints).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Sets the embedding model and its dimensionality.
    pub fn with_embedding_model(mut self, model: impl Into<String>, dimension: usize) -> Self {
        self.embedding_model = model.into();
        self.embedding_dimension = dimension;
        self
    }

    /// Sets the request timeout.
    pub fn with_timeout(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }
}

/// OpenAI-compatible LLM client.
#[derive(Debug, Clone)]
pub struct OpenAiClient {
    config: OpenAiConfig,
    client: Client,
}

impl OpenAiClient {
    /// Creates a new client with the given configuration.
    pub fn new(config: OpenAiConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| GatewayError::llm(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self { config, client })
    }

    /// Creates a client from environment variables.
    ///
    /// Reads `OPENAI_API_KEY`, optionally `OPENAI_MODEL` and
    /// `OPENAI_BASE_URL`.
    pub fn from_env() -> Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| GatewayError::llm("OPENAI_API_KEY environment variable not set"))?;
        let model = std::env::var("OPENAI_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string());

        let mut config = OpenAiConfig::new(api_key, model);
        if let Ok(base) = std::env::var("OPENAI_BASE_URL") {
            config = config.with_base_url(base);
        }
        Self::new(config)
    }

    /// Sends one request, classifying the outcome for the retry loop.
    async fn post_json<T: Serialize, R: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        body: &T,
    ) -> std::result::Result<R, AttemptError> {
        let url = format!("{}{}", self.config.base_url, path);
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.config.api_key)
            .json(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() || e.is_connect() {
                    AttemptError::Transient(format!("request failed: {e}"))
                } else {
                    AttemptError::Fatal(GatewayError::llm(format!("request failed: {e}")))
                }
            })?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| AttemptError::Transient(format!("failed to read response: {e}")))?;

        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(AttemptError::Fatal(GatewayError::llm(
                "authentication failed; check the API key",
            )));
        }
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(AttemptError::Fatal(GatewayError::llm(
                "provider quota exceeded; wait and retry",
            )));
        }
        if status.is_server_error() {
            return Err(AttemptError::Transient(format!(
                "server error {status}: {text}"
            )));
        }
        if !status.is_success() {
            return Err(AttemptError::Fatal(GatewayError::llm(format!(
                "API error ({status}): {text}"
            ))));
        }

        serde_json::from_str(&text)
            .map_err(|e| AttemptError::Fatal(GatewayError::llm(format!("bad response body: {e}"))))
    }

    /// Runs a request with the 1s/2s/4s retry schedule for transient
    /// failures.
    async fn with_retries<T: Serialize, R: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        body: &T,
    ) -> Result<R> {
        let mut last_transient = String::new();
        for (attempt, delay_secs) in RETRY_DELAYS_SECS.iter().enumerate() {
            match self.post_json(path, body).await {
                Ok(response) => return Ok(response),
                Err(AttemptError::Fatal(e)) => return Err(e),
                Err(AttemptError::Transient(cause)) => {
                    warn!(
                        "LLM attempt {} failed (transient): {}, retrying in {}s",
                        attempt + 1,
                        cause,
                        delay_secs
                    );
                    last_transient = cause;
                    tokio::time::sleep(Duration::from_secs(*delay_secs)).await;
                }
            }
        }
        // Final attempt after the last backoff.
        match self.post_json(path, body).await {
            Ok(response) => Ok(response),
            Err(AttemptError::Fatal(e)) => Err(e),
            Err(AttemptError::Transient(cause)) => Err(GatewayError::llm(format!(
                "transport failed after retries: {} (previous: {})",
                cause, last_transient
            ))),
        }
    }
}

enum AttemptError {
    Transient(String),
    Fatal(GatewayError),
}

#[async_trait]
impl LlmClient for OpenAiClient {
    async fn complete(&self, messages: &[Message]) -> Result<String> {
        let request = ChatRequest {
            model: self.config.model.clone(),
            messages: messages
                .iter()
                .map(|m| ChatMessage {
                    role: m.role.as_str().to_string(),
                    content: m.content.clone(),
                })
                .collect(),
            max_tokens: self.config.max_tokens,
            temperature: self.config.temperature,
        };

        let response: ChatResponse = self.with_retries("/chat/completions", &request).await?;

        let text = response
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .unwrap_or_default();

        if text.is_empty() {
            return Err(GatewayError::llm("empty completion from provider"));
        }

        Ok(text)
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let request = EmbeddingRequest {
            model: self.config.embedding_model.clone(),
            input: texts.to_vec(),
        };

        let response: EmbeddingResponse = self.with_retries("/embeddings", &request).await?;

        let mut data = response.data;
        data.sort_by_key(|d| d.index);
        Ok(data.into_iter().map(|d| d.embedding).collect())
    }

    fn embedding_dimension(&self) -> usize {
        self.config.embedding_dimension
    }
}

// OpenAI API types

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest {
    model: String,
    input: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    index: usize,
    embedding: Vec<f32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_new() {
        let config = OpenAiConfig::new("sk-test", "gpt-4o-mini");
        assert_eq!(config.api_key, "sk-test");
        assert_eq!(config.model, "gpt-4o-mini");
        assert_eq!(config.timeout_secs, DEFAULT_TIMEOUT_SECS);
        assert_eq!(config.base_url, OPENAI_API_BASE);
    }

    #[test]
    fn test_config_with_base_url_strips_slash() {
        let config = OpenAiConfig::new("k", "m").with_base_url("http://localhost:11434/v1/");
        assert_eq!(config.base_url, "http://localhost:11434/v1");
    }

    #[test]
    fn test_config_with_embedding_model() {
        let config = OpenAiConfig::new("k", "m").with_embedding_model("nomic-embed-text", 768);
        assert_eq!(config.embedding_model, "nomic-embed-text");
        assert_eq!(config.embedding_dimension, 768);
    }

    #[test]
    fn test_chat_response_parsing() {
        let body = r#"{"choices":[{"message":{"role":"assistant","content":"SELECT 1"}}]}"#;
        let parsed: ChatResponse = serde_json::from_str(body).unwrap();
        assert_eq!(parsed.choices[0].message.content, "SELECT 1");
    }

    #[test]
    fn test_embedding_response_ordering() {
        let body = r#"{"data":[{"index":1,"embedding":[0.2]},{"index":0,"embedding":[0.1]}]}"#;
        let parsed: EmbeddingResponse = serde_json::from_str(body).unwrap();
        let mut data = parsed.data;
        data.sort_by_key(|d| d.index);
        assert_eq!(data[0].embedding, vec![0.1]);
    }
}
