/// LLM Client: the only code in the screener that talks to the Anthropic API.
///
/// One request per call. Retrying is the engine's job: every failure is
/// mapped onto a `GenerationError` class and routed to a retry queue.
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::pipeline::client::{GenerationClient, GenerationError};

pub mod prompts;

const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";
pub const DEFAULT_MODEL: &str = "claude-sonnet-4-5";
const MAX_TOKENS: u32 = 4096;

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("LLM returned empty content")]
    EmptyContent,
}

impl LlmError {
    /// Maps client internals onto the engine's failure classes.
    fn into_generation_error(self, deadline: Duration) -> GenerationError {
        match self {
            LlmError::Http(e) if e.is_timeout() => GenerationError::Timeout(deadline),
            LlmError::Http(e) => GenerationError::Transient(e.to_string()),
            LlmError::Api { status, message } if is_retryable(status) => {
                GenerationError::Transient(format!("status {status}: {message}"))
            }
            LlmError::Api { status, message } => GenerationError::Rejected { status, message },
            LlmError::EmptyContent => {
                GenerationError::Transient("LLM returned empty content".to_string())
            }
        }
    }
}

fn is_retryable(status: u16) -> bool {
    StatusCode::from_u16(status)
        .map(|s| s == StatusCode::TOO_MANY_REQUESTS || s.is_server_error())
        .unwrap_or(false)
}

#[derive(Debug, Serialize)]
struct AnthropicRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    system: &'a str,
    messages: Vec<AnthropicMessage<'a>>,
}

#[derive(Debug, Serialize)]
struct AnthropicMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
pub struct LlmResponse {
    pub content: Vec<ContentBlock>,
    pub usage: Usage,
}

#[derive(Debug, Deserialize)]
pub struct ContentBlock {
    #[serde(rename = "type")]
    pub block_type: String,
    pub text: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

impl LlmResponse {
    /// Extracts the text content from the first text block.
    pub fn text(&self) -> Option<&str> {
        self.content
            .iter()
            .find(|b| b.block_type == "text")
            .and_then(|b| b.text.as_deref())
    }
}

#[derive(Debug, Deserialize)]
struct AnthropicError {
    error: AnthropicErrorBody,
}

#[derive(Debug, Deserialize)]
struct AnthropicErrorBody {
    message: String,
}

/// Wraps the Anthropic Messages API for resume analysis.
#[derive(Clone)]
pub struct LlmClient {
    client: Client,
    api_key: String,
    model: String,
    job_description: Option<String>,
}

impl LlmClient {
    pub fn new(api_key: String, model: String) -> Result<Self, LlmError> {
        Ok(Self {
            client: Client::builder().build()?,
            api_key,
            model,
            job_description: None,
        })
    }

    /// Role description the analysis is written against.
    pub fn with_job_description(mut self, job_description: Option<String>) -> Self {
        self.job_description = job_description;
        self
    }

    /// Makes a single call to the Claude API with a per-request timeout.
    pub async fn call(
        &self,
        prompt: &str,
        system: &str,
        timeout: Duration,
    ) -> Result<LlmResponse, LlmError> {
        let request_body = AnthropicRequest {
            model: &self.model,
            max_tokens: MAX_TOKENS,
            system,
            messages: vec![AnthropicMessage {
                role: "user",
                content: prompt,
            }],
        };

        let response = self
            .client
            .post(ANTHROPIC_API_URL)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .timeout(timeout)
            .json(&request_body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<AnthropicError>(&body)
                .map(|e| e.error.message)
                .unwrap_or(body);
            warn!("LLM API returned {}: {}", status, message);
            return Err(LlmError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let llm_response: LlmResponse = response.json().await?;

        debug!(
            "LLM call succeeded: input_tokens={}, output_tokens={}",
            llm_response.usage.input_tokens, llm_response.usage.output_tokens
        );

        Ok(llm_response)
    }
}

#[async_trait]
impl GenerationClient for LlmClient {
    fn model_id(&self) -> &str {
        &self.model
    }

    async fn generate(&self, payload: &str, deadline: Duration) -> Result<String, GenerationError> {
        let prompt = prompts::analysis_prompt(payload, self.job_description.as_deref());
        let response = self
            .call(&prompt, prompts::JSON_ONLY_SYSTEM, deadline)
            .await
            .map_err(|e| e.into_generation_error(deadline))?;

        match response.text() {
            Some(text) if !text.trim().is_empty() => Ok(text.to_string()),
            _ => Err(LlmError::EmptyContent.into_generation_error(deadline)),
        }
    }
}
