//! Language model boundary and the Anthropic Messages API client.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use stone_config::ClaudeConfig;
use thiserror::Error;
use tracing::{debug, instrument};

/// Anthropic API version
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Errors from the language model.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("Claude network error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Claude API error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("Claude rate limit exceeded: {0}")]
    RateLimited(String),

    #[error("Claude service unavailable (overloaded): {0}")]
    Overloaded(String),

    #[error("Claude returned an empty response")]
    EmptyResponse,

    #[error("Claude API key missing: {0} is not set")]
    MissingApiKey(String),
}

/// Text generation used by the role handlers.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn generate(&self, prompt: &str, system_prompt: &str) -> Result<String, LlmError>;
}

#[derive(Debug, Serialize)]
struct MessageParam<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    #[serde(skip_serializing_if = "str::is_empty")]
    system: &'a str,
    messages: Vec<MessageParam<'a>>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    block_type: String,
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
}

/// Claude over the Messages API.
#[derive(Debug, Clone)]
pub struct ClaudeClient {
    client: reqwest::Client,
    api_url: String,
    api_key: String,
    model: String,
    max_tokens: u32,
}

impl ClaudeClient {
    pub fn new(config: &ClaudeConfig, api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_url: config.api_url.trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            model: config.model.clone(),
            max_tokens: config.max_tokens,
        }
    }

    /// Read the API key from the environment variable named in `config`.
    pub fn from_config(config: &ClaudeConfig) -> Result<Self, LlmError> {
        let key = std::env::var(&config.api_key_env)
            .ok()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| LlmError::MissingApiKey(config.api_key_env.clone()))?;
        Ok(Self::new(config, key))
    }
}

#[async_trait]
impl LanguageModel for ClaudeClient {
    #[instrument(skip_all, fields(model = %self.model, prompt_len = prompt.len()))]
    async fn generate(&self, prompt: &str, system_prompt: &str) -> Result<String, LlmError> {
        let request = MessagesRequest {
            model: &self.model,
            max_tokens: self.max_tokens,
            system: system_prompt,
            messages: vec![MessageParam {
                role: "user",
                content: prompt,
            }],
        };

        let response = self
            .client
            .post(format!("{}/v1/messages", self.api_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&request)
            .send()
            .await?;

        let status = response.status().as_u16();
        if !response.status().is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ApiErrorBody>(&body)
                .map(|b| b.error.message)
                .unwrap_or(body);
            return Err(match status {
                429 => LlmError::RateLimited(message),
                529 => LlmError::Overloaded(message),
                _ => LlmError::Api { status, message },
            });
        }

        let parsed: MessagesResponse = response.json().await?;
        let text = parsed
            .content
            .into_iter()
            .filter(|block| block.block_type == "text")
            .map(|block| block.text)
            .collect::<Vec<_>>()
            .join("");

        if text.trim().is_empty() {
            return Err(LlmError::EmptyResponse);
        }
        debug!(response_len = text.len(), "Claude response received");
        Ok(text)
    }
}
