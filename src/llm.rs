use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::info;

use crate::config::LlmConfig;
use crate::error::{Error, Result};

/// LLM client for chat completion and embeddings via an Anthropic-compatible API.
///
/// Constructed explicitly and injected into the components that need it; there
/// is no module-level singleton, so tests can substitute a [`ChatModel`] double.
pub struct LlmClient {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
    embedding_model: String,
}

/// Seam for reasoning/instruction components: one JSON-contract chat call.
///
/// The production implementation is [`LlmClient`]; tests provide scripted doubles.
#[async_trait::async_trait]
pub trait ChatModel: Send + Sync {
    async fn chat_json(
        &self,
        system: &str,
        prompt: &str,
        temperature: f32,
    ) -> Result<serde_json::Value>;

    async fn chat_text(&self, system: &str, prompt: &str, temperature: f32) -> Result<String>;

    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

#[derive(Debug, Clone, Serialize)]
struct ChatRequest {
    model: String,
    max_tokens: u32,
    temperature: f32,
    system: Option<String>,
    messages: Vec<ChatMessage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatResponse {
    content: Vec<ContentBlock>,
    #[allow(dead_code)]
    model: Option<String>,
    usage: Option<Usage>,
}

#[derive(Debug, Clone, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    content_type: String,
    text: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct Usage {
    input_tokens: u32,
    output_tokens: u32,
}

#[derive(Debug, Clone, Deserialize)]
struct ErrorResponse {
    error: Option<ErrorDetail>,
    msg: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct ErrorDetail {
    message: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
struct EmbedRequest {
    model: String,
    input: String,
}

#[derive(Debug, Clone, Deserialize)]
struct EmbedResponse {
    data: Vec<EmbedData>,
}

#[derive(Debug, Clone, Deserialize)]
struct EmbedData {
    embedding: Vec<f32>,
}

impl LlmClient {
    pub fn new(config: &LlmConfig) -> Self {
        Self {
            client: Client::builder()
                .timeout(Duration::from_secs(120))
                .build()
                .expect("failed to create HTTP client"),
            base_url: config.base_url.clone(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            embedding_model: config.embedding_model.clone(),
        }
    }

    /// Send a prompt and return the raw text response.
    pub async fn complete(
        &self,
        prompt: &str,
        system_prompt: Option<&str>,
        temperature: f32,
        max_tokens: u32,
    ) -> Result<String> {
        let url = format!("{}/v1/messages", self.base_url);

        let request = ChatRequest {
            model: self.model.clone(),
            max_tokens,
            temperature,
            system: system_prompt.map(|s| s.to_string()),
            messages: vec![ChatMessage {
                role: "user".to_string(),
                content: prompt.to_string(),
            }],
        };

        info!(
            model = %self.model,
            prompt_length = prompt.len(),
            temperature = temperature,
            "sending LLM request"
        );

        let response = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            if let Ok(err) = serde_json::from_str::<ErrorResponse>(&body) {
                let msg = err
                    .msg
                    .or_else(|| err.error.and_then(|e| e.message))
                    .unwrap_or_else(|| "unknown error".to_string());
                return Err(Error::llm(format!("API error {}: {}", status, msg)));
            }
            return Err(Error::llm(format!("API error {}: {}", status, body)));
        }

        let chat_response: ChatResponse = serde_json::from_str(&body)?;

        let content = chat_response
            .content
            .iter()
            .filter_map(|block| {
                if block.content_type == "text" {
                    block.text.clone()
                } else {
                    None
                }
            })
            .collect::<Vec<_>>()
            .join("");

        let usage = chat_response.usage.unwrap_or(Usage {
            input_tokens: 0,
            output_tokens: 0,
        });

        info!(
            model = %self.model,
            input_tokens = usage.input_tokens,
            output_tokens = usage.output_tokens,
            "LLM response received"
        );

        Ok(content)
    }
}

/// Strip a markdown code fence so JSON contracts survive chatty models.
fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let without_open = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .unwrap_or(trimmed);
    without_open.strip_suffix("```").unwrap_or(without_open).trim()
}

#[async_trait::async_trait]
impl ChatModel for LlmClient {
    async fn chat_json(
        &self,
        system: &str,
        prompt: &str,
        temperature: f32,
    ) -> Result<serde_json::Value> {
        let text = self.complete(prompt, Some(system), temperature, 4096).await?;
        let value = serde_json::from_str(strip_code_fence(&text))
            .map_err(|e| Error::llm(format!("response is not valid JSON: {}", e)))?;
        Ok(value)
    }

    async fn chat_text(&self, system: &str, prompt: &str, temperature: f32) -> Result<String> {
        self.complete(prompt, Some(system), temperature, 1024).await
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let url = format!("{}/v1/embeddings", self.base_url);
        let request = EmbedRequest {
            model: self.embedding_model.clone(),
            input: text.to_string(),
        };

        let response = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .header("x-api-key", &self.api_key)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(Error::llm(format!("embedding API error {}: {}", status, body)));
        }

        let parsed: EmbedResponse = serde_json::from_str(&body)?;
        parsed
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or_else(|| Error::llm("embedding response contained no vectors"))
    }
}
