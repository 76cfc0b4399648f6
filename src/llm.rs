//! Language-model bindings.
//!
//! A `ModelBinding` is the swappable handle a chat service talks to. The
//! concrete implementation speaks the OpenAI chat-completions format, which
//! covers Ollama, LM Studio, vLLM, DeepSeek and OpenAI itself.
//! `resolve_binding` routes a model name to the right endpoint by prefix,
//! replacing any notion of a process-wide "current model".

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::BotConfig;
use crate::error::CoreError;

const DEEPSEEK_API_URL: &str = "https://api.deepseek.com/v1";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatTurn {
    pub role: String,
    pub content: String,
}

impl ChatTurn {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

#[async_trait]
pub trait ModelBinding: Send + Sync {
    /// The name this binding was resolved under, e.g. "ollama/qwen2.5".
    fn name(&self) -> &str;

    async fn chat(&self, turns: &[ChatTurn]) -> Result<String>;
}

// Test harness plumbing: lets `.unwrap_err()` format `Arc<dyn ModelBinding>`.
#[cfg(test)]
impl std::fmt::Debug for dyn ModelBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn ModelBinding")
    }
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatTurn],
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChatTurn,
}

pub struct LlmClient {
    binding_name: String,
    api_url: String,
    api_key: String,
    model: String,
    client: reqwest::Client,
}

impl LlmClient {
    pub fn new(
        binding_name: impl Into<String>,
        api_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            binding_name: binding_name.into(),
            api_url: api_url.into(),
            api_key: api_key.into(),
            model: model.into(),
            client: reqwest::Client::new(),
        }
    }

    /// Generate a completion using the OpenAI API format
    async fn generate(&self, messages: &[ChatTurn]) -> Result<String> {
        let url = format!("{}/chat/completions", self.api_url);

        let request = ChatCompletionRequest {
            model: &self.model,
            messages,
            temperature: Some(0.7),
            max_tokens: Some(2000),
        };

        let mut req = self.client.post(&url).json(&request);

        // Add API key header if provided (not needed for local models)
        if !self.api_key.is_empty() {
            req = req.header("Authorization", format!("Bearer {}", self.api_key));
        }

        let response = req.send().await.context("Failed to send LLM request")?;

        // Check for HTTP errors and include response body for debugging
        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read body".to_string());
            anyhow::bail!("LLM API returned error {}: {}", status, body);
        }

        let completion: ChatCompletionResponse = response
            .json()
            .await
            .context("Failed to parse LLM response")?;

        let content = completion
            .choices
            .first()
            .map(|c| c.message.content.clone())
            .ok_or_else(|| anyhow::anyhow!("No response from LLM"))?;

        Ok(content)
    }
}

#[async_trait]
impl ModelBinding for LlmClient {
    fn name(&self) -> &str {
        &self.binding_name
    }

    async fn chat(&self, turns: &[ChatTurn]) -> Result<String> {
        self.generate(turns).await
    }
}

/// Resolve a model name to a binding.
///
/// Supported prefixes:
/// - `deepseek-`: DeepSeek API; requires `deepseek_api_key`.
/// - `ollama/`: local Ollama behind the configured OpenAI-compatible url.
///
/// Anything else is sent to the configured endpoint as-is.
pub fn resolve_binding(name: &str, config: &BotConfig) -> Result<Arc<dyn ModelBinding>, CoreError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(CoreError::Validation(
            "Please provide a model name.".to_string(),
        ));
    }

    if name.starts_with("deepseek-") {
        let api_key = config.deepseek_api_key.clone().ok_or_else(|| {
            CoreError::Validation(
                "DeepSeek API key is not configured (set DEEPSEEK_API_KEY).".to_string(),
            )
        })?;
        return Ok(Arc::new(LlmClient::new(
            name,
            DEEPSEEK_API_URL,
            api_key,
            name,
        )));
    }

    if let Some(model) = name.strip_prefix("ollama/") {
        if model.is_empty() {
            return Err(CoreError::Validation(
                "Ollama model name cannot be empty. E.g. 'ollama/qwen2.5'.".to_string(),
            ));
        }
        return Ok(Arc::new(LlmClient::new(
            name,
            config.llm_api_url.clone(),
            String::new(),
            model,
        )));
    }

    Ok(Arc::new(LlmClient::new(
        name,
        config.llm_api_url.clone(),
        config.llm_api_key.clone().unwrap_or_default(),
        name,
    )))
}

/// The binding every factory receives at startup, from `llm_model` in config.
pub fn default_binding(config: &BotConfig) -> Result<Arc<dyn ModelBinding>, CoreError> {
    resolve_binding(&config.llm_model, config)
}
