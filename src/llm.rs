use async_trait::async_trait;
use serde::Serialize;

use crate::error::{Error, Result};

/// Default OpenAI API endpoint.
const DEFAULT_API_URL: &str = "https://api.openai.com/v1/chat/completions";

/// One chat-style completion request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompletionRequest {
    pub model: String,
    pub system: Option<String>,
    pub prompt: String,
    pub temperature: f32,
}

impl CompletionRequest {
    pub fn new(model: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            system: None,
            prompt: prompt.into(),
            temperature: 0.2,
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

/// Anything that turns a prompt into text.
#[async_trait]
pub trait Completion: Send + Sync {
    /// Returns the trimmed completion text.
    async fn complete(&self, request: &CompletionRequest) -> Result<String>;
}

/// OpenAI-compatible chat completions over reqwest.
#[derive(Debug, Clone)]
pub struct OpenAiCompletion {
    api_key: String,
    api_url: String,
    client: reqwest::Client,
}

impl OpenAiCompletion {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            api_url: DEFAULT_API_URL.to_string(),
            client: reqwest::Client::new(),
        }
    }

    /// Read `OPENAI_API_KEY` and the optional `OPENAI_API_URL`.
    pub fn from_env() -> Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| Error::ConfigError("OPENAI_API_KEY is not set".into()))?;
        let provider = Self::new(api_key);
        Ok(match std::env::var("OPENAI_API_URL") {
            Ok(url) if !url.is_empty() => provider.with_api_url(url),
            _ => provider,
        })
    }

    /// Use a custom API endpoint (for compatible APIs).
    pub fn with_api_url(mut self, url: impl Into<String>) -> Self {
        self.api_url = url.into();
        self
    }

    fn body(request: &CompletionRequest) -> serde_json::Value {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = &request.system {
            messages.push(ChatMessage { role: "system", content: system });
        }
        messages.push(ChatMessage { role: "user", content: &request.prompt });
        serde_json::json!({
            "model": &request.model,
            "messages": messages,
            "temperature": request.temperature,
        })
    }
}

#[async_trait]
impl Completion for OpenAiCompletion {
    async fn complete(&self, request: &CompletionRequest) -> Result<String> {
        let response = self
            .client
            .post(&self.api_url)
            .bearer_auth(&self.api_key)
            .json(&Self::body(request))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(Error::CompletionError(format!("HTTP {status}: {error_text}")));
        }

        let json: serde_json::Value = response.json().await?;
        let content = json
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_str())
            .ok_or_else(|| Error::CompletionError("missing choices[0].message.content".into()))?;

        tracing::debug!(model = %request.model, chars = content.len(), "completion received");
        Ok(content.trim().to_string())
    }
}
