//! Client for the OpenAI-compatible inference server
//!
//! Only the endpoints the tooling needs: `/health`, `/v1/models` and
//! `/v1/chat/completions`. Also builds the `vllm serve` command line.

use crate::config::ServeConfig;
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Server stdout/stderr inside the container
pub const SERVER_LOG: &str = "/tmp/vllm_serve.log";
/// Pattern matching the server process for pgrep / pkill
pub const SERVER_PROCESS_PATTERN: &str = "vllm serve";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: &str) -> Self {
        Self {
            role: "user".to_string(),
            content: content.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub max_tokens: u32,
    pub temperature: f32,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AssistantMessage {
    pub content: Option<String>,
    /// Set by models that separate reasoning from the final answer
    pub reasoning_content: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Choice {
    pub message: AssistantMessage,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatResponse {
    pub model: Option<String>,
    pub choices: Vec<Choice>,
    pub usage: Option<Usage>,
}

impl ChatResponse {
    pub fn completion_tokens(&self) -> u64 {
        self.usage.as_ref().map(|u| u.completion_tokens).unwrap_or(0)
    }

    /// Final answer, falling back to the reasoning text when content is empty
    pub fn text(&self) -> Option<&str> {
        let message = &self.choices.first()?.message;
        message
            .content
            .as_deref()
            .filter(|c| !c.trim().is_empty())
            .or(message.reasoning_content.as_deref())
    }

    pub fn reasoning(&self) -> Option<&str> {
        self.choices.first()?.message.reasoning_content.as_deref()
    }
}

#[derive(Debug, Deserialize)]
struct ModelList {
    data: Vec<ModelEntry>,
}

#[derive(Debug, Deserialize)]
struct ModelEntry {
    id: String,
}

#[derive(Debug, Clone)]
pub struct InferenceClient {
    base_url: String,
    http: reqwest::Client,
}

impl InferenceClient {
    pub fn new(base_url: &str, request_timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// HTTP status of `GET /health`
    pub async fn health(&self) -> Result<u16> {
        let url = format!("{}/health", self.base_url);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .with_context(|| format!("GET {} failed", url))?;
        Ok(response.status().as_u16())
    }

    /// First model id served, if any
    pub async fn model_id(&self) -> Result<Option<String>> {
        let url = format!("{}/v1/models", self.base_url);
        let models: ModelList = self
            .http
            .get(&url)
            .send()
            .await
            .with_context(|| format!("GET {} failed", url))?
            .error_for_status()?
            .json()
            .await
            .context("Invalid /v1/models payload")?;

        Ok(models.data.into_iter().next().map(|m| m.id))
    }

    pub async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse> {
        let url = format!("{}/v1/chat/completions", self.base_url);
        let response = self
            .http
            .post(&url)
            .json(request)
            .send()
            .await
            .with_context(|| format!("POST {} failed", url))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("chat completion returned {}: {}", status, body.trim()));
        }

        response
            .json::<ChatResponse>()
            .await
            .context("Invalid chat completion payload")
    }
}

/// `vllm serve` invocation, output redirected to [`SERVER_LOG`]
pub fn serve_script(serve: &ServeConfig) -> String {
    let mut args = vec![
        "vllm".to_string(),
        "serve".to_string(),
        serve.model.clone(),
        "--host".to_string(),
        "0.0.0.0".to_string(),
        "--port".to_string(),
        serve.port.to_string(),
        "--tensor-parallel-size".to_string(),
        serve.tensor_parallel.to_string(),
        "--max-model-len".to_string(),
        serve.max_model_len.to_string(),
        "--gpu-memory-utilization".to_string(),
        format!("{:.2}", serve.gpu_memory_utilization),
    ];
    if serve.tensor_parallel > 1 {
        args.extend(["--distributed-executor-backend".to_string(), "ray".to_string()]);
    }
    args.extend(serve.extra_args.iter().cloned());

    format!("{} > {} 2>&1", shell_words::join(&args), SERVER_LOG)
}

/// Model download into the shared HF cache
pub fn download_script(model: &str) -> String {
    format!("huggingface-cli download {}", shell_words::quote(model))
}
