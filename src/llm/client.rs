//! HTTP generation backends (Ollama and OpenAI-compatible chat endpoints)

use super::prompts::SectionPrompt;
use super::{Generation, GenerationService};
use crate::assemble::PromptPayload;
use crate::config::{GenerationConfig, GenerationProviderKind};
use crate::error::{PipelineError, Result};
use crate::retry::RetryPolicy;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

const BACKEND: &str = "generation";

/// Raw completion returned by a backend
#[derive(Debug, Clone)]
pub struct LlmResponse {
    pub content: String,
    /// Completion tokens, when the backend reports them
    pub tokens_used: Option<usize>,
}

/// Wire protocol spoken by the endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmApi {
    Ollama,
    OpenAi,
}

/// Resolved connection settings for one generation backend
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub api: LlmApi,
    /// Base URL without a trailing slash
    pub endpoint: String,
    pub model: String,
    pub api_key: Option<String>,
    pub max_tokens: usize,
    pub temperature: f32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api: LlmApi::Ollama,
            endpoint: "http://localhost:11434".to_string(),
            model: "llama3".to_string(),
            api_key: None,
            max_tokens: 2048,
            temperature: 0.2,
        }
    }
}

impl LlmConfig {
    /// Resolve the `[generation]` section; `None` when no generator is configured
    pub fn from_generation(config: &GenerationConfig) -> Result<Option<Self>> {
        let api = match config.provider {
            GenerationProviderKind::None => return Ok(None),
            GenerationProviderKind::Ollama => LlmApi::Ollama,
            GenerationProviderKind::Openai => LlmApi::OpenAi,
        };

        let endpoint = match (&config.endpoint, api) {
            (Some(endpoint), _) => endpoint.trim_end_matches('/').to_string(),
            (None, LlmApi::Ollama) => Self::default().endpoint,
            (None, LlmApi::OpenAi) => {
                return Err(PipelineError::Config(
                    "generation.endpoint is required for the openai provider".to_string(),
                ))
            }
        };

        Ok(Some(Self {
            api,
            endpoint,
            model: config.model.clone(),
            api_key: config
                .api_key_env
                .as_deref()
                .and_then(|var| std::env::var(var).ok()),
            max_tokens: config.max_tokens,
            temperature: config.temperature,
        }))
    }
}

/// LLM client for report sections
pub struct LlmClient {
    config: LlmConfig,
    client: reqwest::Client,
    retry: RetryPolicy,
}

impl LlmClient {
    /// Client for one endpoint, calls wrapped in the shared retry policy
    pub fn new(config: LlmConfig, retry: RetryPolicy) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
            retry,
        }
    }

    /// Generate a completion
    pub async fn complete(&self, prompt: &str) -> Result<LlmResponse> {
        match self.config.api {
            LlmApi::Ollama => self.complete_ollama(prompt).await,
            LlmApi::OpenAi => self.complete_openai(prompt).await,
        }
    }

    /// `POST /api/generate` with streaming disabled
    async fn complete_ollama(&self, prompt: &str) -> Result<LlmResponse> {
        let url = format!("{}/api/generate", self.config.endpoint);

        let request = OllamaGenerateRequest {
            model: self.config.model.clone(),
            prompt: prompt.to_string(),
            stream: false,
            options: OllamaOptions {
                temperature: self.config.temperature,
                num_predict: self.config.max_tokens as i32,
            },
        };

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| PipelineError::backend(BACKEND, e))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status, &body));
        }

        let result: OllamaGenerateResponse = response
            .json()
            .await
            .map_err(|e| PipelineError::backend(BACKEND, format!("malformed response: {}", e)))?;

        Ok(LlmResponse {
            content: result.response,
            tokens_used: result.eval_count.map(|n| n.max(0) as usize),
        })
    }

    /// `POST /v1/chat/completions` with a single user message
    async fn complete_openai(&self, prompt: &str) -> Result<LlmResponse> {
        let url = format!("{}/v1/chat/completions", self.config.endpoint);

        let request = OpenAIChatRequest {
            model: self.config.model.clone(),
            messages: vec![OpenAIMessage {
                role: "user".to_string(),
                content: prompt.to_string(),
            }],
            max_tokens: Some(self.config.max_tokens),
            temperature: Some(self.config.temperature),
        };

        let mut req_builder = self.client.post(&url).json(&request);

        if let Some(ref key) = self.config.api_key {
            req_builder = req_builder.header("Authorization", format!("Bearer {}", key));
        }

        let response = req_builder
            .send()
            .await
            .map_err(|e| PipelineError::backend(BACKEND, e))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status, &body));
        }

        let result: OpenAIChatResponse = response
            .json()
            .await
            .map_err(|e| PipelineError::backend(BACKEND, format!("malformed response: {}", e)))?;

        let content = result
            .choices
            .first()
            .map(|c| c.message.content.clone())
            .unwrap_or_default();

        Ok(LlmResponse {
            content,
            tokens_used: result.usage.map(|u| u.total_tokens.max(0) as usize),
        })
    }
}

#[async_trait]
impl GenerationService for LlmClient {
    fn model(&self) -> &str {
        &self.config.model
    }

    async fn generate(&self, payload: &PromptPayload) -> Result<Generation> {
        let prompt = SectionPrompt::render(payload);
        let response = self.retry.run(BACKEND, || self.complete(&prompt)).await?;

        let text = response.content.trim().to_string();
        Ok(Generation {
            success: !text.is_empty(),
            text,
            model: self.config.model.clone(),
            tokens_used: response.tokens_used,
        })
    }
}

/// Rate limiting and server faults are transient; other rejections are not
fn status_error(status: StatusCode, body: &str) -> PipelineError {
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        PipelineError::backend(BACKEND, format!("{} - {}", status, body))
    } else {
        PipelineError::Config(format!("generation request rejected: {} - {}", status, body))
    }
}

// Ollama API types

#[derive(Debug, Serialize)]
struct OllamaGenerateRequest {
    model: String,
    prompt: String,
    stream: bool,
    options: OllamaOptions,
}

#[derive(Debug, Serialize)]
struct OllamaOptions {
    temperature: f32,
    num_predict: i32,
}

#[derive(Debug, Deserialize)]
struct OllamaGenerateResponse {
    response: String,
    eval_count: Option<i32>,
}

// OpenAI API types

#[derive(Debug, Serialize)]
struct OpenAIChatRequest {
    model: String,
    messages: Vec<OpenAIMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Debug, Serialize, Deserialize)]
struct OpenAIMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct OpenAIChatResponse {
    choices: Vec<OpenAIChoice>,
    usage: Option<OpenAIUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAIChoice {
    message: OpenAIMessage,
}

#[derive(Debug, Deserialize)]
struct OpenAIUsage {
    total_tokens: i32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = LlmConfig::default();
        assert!(config.endpoint.contains("11434"));
        assert_eq!(config.api, LlmApi::Ollama);
    }

    #[test]
    fn test_from_generation_config() {
        let mut generation = GenerationConfig::default();
        assert!(LlmConfig::from_generation(&generation).unwrap().is_none());

        generation.provider = GenerationProviderKind::Ollama;
        let config = LlmConfig::from_generation(&generation).unwrap().unwrap();
        assert_eq!(config.endpoint, "http://localhost:11434");
        assert_eq!(config.model, "llama3");

        generation.provider = GenerationProviderKind::Openai;
        assert!(LlmConfig::from_generation(&generation).is_err());

        generation.endpoint = Some("https://llm.internal/".to_string());
        let config = LlmConfig::from_generation(&generation).unwrap().unwrap();
        assert_eq!(config.api, LlmApi::OpenAi);
        assert_eq!(config.endpoint, "https://llm.internal");
    }

    #[test]
    fn test_status_classification() {
        assert!(status_error(StatusCode::SERVICE_UNAVAILABLE, "loading").is_retryable());
        assert!(status_error(StatusCode::TOO_MANY_REQUESTS, "").is_retryable());
        assert!(!status_error(StatusCode::BAD_REQUEST, "bad prompt").is_retryable());
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_backend_unavailable() {
        let config = LlmConfig {
            endpoint: "http://127.0.0.1:9".to_string(),
            ..Default::default()
        };
        let retry = RetryPolicy {
            timeout: std::time::Duration::from_secs(2),
            max_retries: 0,
            initial_backoff: std::time::Duration::from_millis(1),
            max_backoff: std::time::Duration::from_millis(1),
        };
        let client = LlmClient::new(config, retry);

        let err = client.complete("hello").await.unwrap_err();
        assert!(err.is_retryable());
    }
}
