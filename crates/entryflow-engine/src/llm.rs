//! Completion client seam and the shared OpenAI-compatible implementation.
//!
//! Processors only see [`CompletionClient`]: a request in, an assistant
//! message (as JSON) out, and an error that is either a rate-limit signal or
//! anything else. The HTTP details live in [`OpenAiCompatibleClient`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

use entryflow_core::EntryPayload;

use crate::config::LlmConfig;

/// One chat-completion call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_format: Option<Value>,
}

impl CompletionRequest {
    /// Builds a request from an entry's prompt fields.
    pub fn from_payload(model: &str, payload: &EntryPayload) -> Self {
        CompletionRequest {
            model: model.to_string(),
            messages: payload.messages.clone(),
            tools: payload.tools.clone(),
            tool_choice: payload.tool_choice.clone(),
            response_format: payload.response_format.clone(),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum CompletionError {
    /// The upstream asked us to slow down (HTTP 429 or equivalent).
    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("completion failed: {0}")]
    Failed(String),
}

#[async_trait]
pub trait CompletionClient: Send + Sync {
    /// Rate-limiter key shared by every call this client makes.
    fn resource_key(&self) -> &str;

    /// Runs one completion and returns the assistant message object.
    async fn complete(&self, request: &CompletionRequest) -> Result<Value, CompletionError>;
}

/// Chat-completions client for OpenAI, OpenRouter and compatible servers.
pub struct OpenAiCompatibleClient {
    http: reqwest::Client,
    provider: String,
    /// `None` when no base URL could be resolved; every call then fails.
    endpoint: Option<String>,
    api_key: Option<String>,
}

impl OpenAiCompatibleClient {
    pub fn from_config(config: &LlmConfig) -> Self {
        let endpoint = config
            .resolved_base_url()
            .ok()
            .map(|base| format!("{}/chat/completions", base.trim_end_matches('/')));
        OpenAiCompatibleClient {
            http: reqwest::Client::new(),
            provider: config.provider.clone(),
            endpoint,
            api_key: config.api_key.clone(),
        }
    }
}

#[async_trait]
impl CompletionClient for OpenAiCompatibleClient {
    fn resource_key(&self) -> &str {
        &self.provider
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<Value, CompletionError> {
        let endpoint = self.endpoint.as_deref().ok_or_else(|| {
            CompletionError::Failed(format!(
                "provider '{}' has no base URL configured",
                self.provider
            ))
        })?;

        let mut req = self
            .http
            .post(endpoint)
            .header("Content-Type", "application/json")
            .json(request);
        if let Some(key) = &self.api_key {
            req = req.header("Authorization", format!("Bearer {}", key));
        }
        if self.provider == "openrouter" {
            req = req.header("X-Title", "entryflow");
        }

        let response = req
            .send()
            .await
            .map_err(|err| CompletionError::Failed(format!("provider request failed: {}", err)))?;

        let status = response.status();
        let body_text = response.text().await.map_err(|err| {
            CompletionError::Failed(format!("provider response read failed: {}", err))
        })?;

        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(CompletionError::RateLimited(format!(
                "provider returned 429: {}",
                body_text
            )));
        }
        if !status.is_success() {
            return Err(CompletionError::Failed(format!(
                "provider request failed ({}): {}",
                status, body_text
            )));
        }

        let parsed: ChatResponse = serde_json::from_str(&body_text).map_err(|err| {
            CompletionError::Failed(format!("provider response parse failed: {}", err))
        })?;

        parsed
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message)
            .filter(|message| !message.is_null())
            .ok_or_else(|| {
                CompletionError::Failed("provider response missing assistant message".to_string())
            })
    }
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    #[serde(default)]
    message: Value,
}

/// Assistant message with plain text content, as returned by providers.
pub fn assistant_message(content: &str) -> Value {
    json!({ "role": "assistant", "content": content })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_carries_prompt_fields_only() {
        let payload: EntryPayload = serde_json::from_value(json!({
            "messages": [{ "role": "user", "content": "hi" }],
            "response_format": { "type": "json_object" },
            "output": { "role": "assistant", "content": "old" },
            "content": "ignored"
        }))
        .unwrap();
        let request = CompletionRequest::from_payload("m", &payload);
        let body = serde_json::to_value(&request).unwrap();
        assert_eq!(body["model"], "m");
        assert_eq!(body["messages"][0]["content"], "hi");
        assert_eq!(body["response_format"]["type"], "json_object");
        assert!(body.get("tools").is_none());
        assert!(body.get("output").is_none());
    }

    #[test]
    fn response_message_is_extracted() {
        let parsed: ChatResponse = serde_json::from_value(json!({
            "choices": [{ "message": assistant_message("hello") }]
        }))
        .unwrap();
        assert_eq!(parsed.choices[0].message["content"], "hello");
    }

    #[tokio::test]
    async fn unconfigured_endpoint_fails_without_io() {
        let client = OpenAiCompatibleClient::from_config(&LlmConfig::default());
        let request = CompletionRequest::from_payload("m", &EntryPayload::default());
        let err = client.complete(&request).await.unwrap_err();
        assert!(matches!(err, CompletionError::Failed(_)));
        assert_eq!(client.resource_key(), "openai_compatible");
    }
}
