//! Gemini backend: `/v1beta/models/{model}:generateContent`, non-streaming
//! in this core.

use crate::config::TimeoutConfig;
use crate::error::{GatewayError, GatewayResult};
use crate::model::{ChatRequest, ChatResponse, Role};
use crate::provider::timeout::await_headers;
use crate::provider::{OnToken, Provider};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

/// Role `assistant` is remapped to `model`.
fn role_str(role: Role) -> &'static str {
    match role {
        Role::Assistant => "model",
        Role::User | Role::Tool | Role::System => "user",
    }
}

#[derive(Serialize)]
struct Part<'a> {
    text: &'a str,
}

#[derive(Serialize)]
struct Content<'a> {
    role: &'a str,
    parts: Vec<Part<'a>>,
}

#[derive(Serialize)]
struct SystemInstruction<'a> {
    parts: Vec<Part<'a>>,
}

#[derive(Serialize)]
struct WireRequest<'a> {
    contents: Vec<Content<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(rename = "systemInstruction")]
    system_instruction: Option<SystemInstruction<'a>>,
}

pub struct GeminiProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    timeouts: TimeoutConfig,
}

impl GeminiProvider {
    pub fn new(api_key: String) -> Self {
        GeminiProvider {
            client: reqwest::Client::new(),
            base_url: "https://generativelanguage.googleapis.com/v1beta".to_string(),
            api_key,
            timeouts: TimeoutConfig::REMOTE,
        }
    }
}

#[async_trait]
impl Provider for GeminiProvider {
    async fn chat(&self, req: ChatRequest, _cancel: CancellationToken) -> GatewayResult<ChatResponse> {
        let contents: Vec<Content> = req
            .messages
            .iter()
            .map(|m| Content { role: role_str(m.role), parts: vec![Part { text: &m.content }] })
            .collect();
        let system_instruction = req.system_prompt.as_deref().map(|s| SystemInstruction { parts: vec![Part { text: s }] });
        let body = WireRequest { contents, system_instruction };

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        // Never sent in the query string, to avoid log leakage.
        headers.insert("x-goog-api-key", HeaderValue::from_str(&self.api_key).map_err(|e| GatewayError::Internal(e.to_string()))?);

        let url = format!("{}/models/{}:generateContent", self.base_url, req.model);

        let response = await_headers(self.name(), self.timeouts, async {
            self.client.post(&url).headers(headers).json(&body).send().await.map_err(GatewayError::from)
        })
        .await?;

        if !response.status().is_success() {
            let (status, body) = super::bounded_error_body(response).await;
            return Err(super::status_error(status, body));
        }

        let json: Value = response.json().await.map_err(GatewayError::from)?;
        let content = json["candidates"][0]["content"]["parts"]
            .as_array()
            .map(|parts| parts.iter().filter_map(|p| p["text"].as_str()).collect::<Vec<_>>().join(""))
            .unwrap_or_default();
        let prompt_tokens = json["usageMetadata"]["promptTokenCount"].as_u64().unwrap_or(0) as u32;
        let completion_tokens = json["usageMetadata"]["candidatesTokenCount"].as_u64().unwrap_or(0) as u32;

        Ok(ChatResponse {
            content,
            model: req.model,
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
            duration_ms: 0,
            finish_reason: json["candidates"][0]["finishReason"].as_str().unwrap_or("stop").to_string(),
            tool_calls: Vec::new(),
        })
    }

    async fn chat_stream(&self, req: ChatRequest, on_token: &mut OnToken<'_>, cancel: CancellationToken) -> GatewayResult<ChatResponse> {
        let response = self.chat(req, cancel).await?;
        if !response.content.is_empty() {
            on_token(&response.content);
        }
        Ok(response)
    }

    fn name(&self) -> &str {
        "gemini"
    }

    async fn available(&self) -> bool {
        !self.api_key.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assistant_role_remaps_to_model() {
        assert_eq!(role_str(Role::Assistant), "model");
        assert_eq!(role_str(Role::User), "user");
    }
}
