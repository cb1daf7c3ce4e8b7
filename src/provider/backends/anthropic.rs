//! Anthropic backend: `/v1/messages`, non-streaming in this core.

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

const ANTHROPIC_VERSION: &str = "2023-06-01";

fn role_str(role: Role) -> &'static str {
    match role {
        Role::User | Role::Tool => "user",
        Role::Assistant => "assistant",
        // Anthropic has no "system" message role — callers route it through
        // the top-level `system` field instead.
        Role::System => "user",
    }
}

#[derive(Serialize)]
struct WireMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct WireRequest<'a> {
    model: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    messages: Vec<WireMessage<'a>>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

pub struct AnthropicProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    timeouts: TimeoutConfig,
}

impl AnthropicProvider {
    pub fn new(api_key: String) -> Self {
        AnthropicProvider {
            client: reqwest::Client::new(),
            base_url: "https://api.anthropic.com".to_string(),
            api_key,
            timeouts: TimeoutConfig::REMOTE,
        }
    }

    fn headers(&self) -> GatewayResult<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert("x-api-key", HeaderValue::from_str(&self.api_key).map_err(|e| GatewayError::Internal(e.to_string()))?);
        headers.insert("anthropic-version", HeaderValue::from_static(ANTHROPIC_VERSION));
        Ok(headers)
    }
}

#[async_trait]
impl Provider for AnthropicProvider {
    async fn chat(&self, req: ChatRequest, _cancel: CancellationToken) -> GatewayResult<ChatResponse> {
        let messages: Vec<WireMessage> = req.messages.iter().map(|m| WireMessage { role: role_str(m.role), content: &m.content }).collect();
        let body = WireRequest {
            model: &req.model,
            system: req.system_prompt.as_deref(),
            messages,
            max_tokens: if req.max_tokens > 0 { req.max_tokens } else { 4096 },
            temperature: if req.temperature > 0.0 { Some(req.temperature) } else { None },
        };
        let headers = self.headers()?;
        let url = format!("{}/v1/messages", self.base_url);

        let response = await_headers(self.name(), self.timeouts, async {
            self.client.post(&url).headers(headers).json(&body).send().await.map_err(GatewayError::from)
        })
        .await?;

        if !response.status().is_success() {
            let (status, body) = super::bounded_error_body(response).await;
            return Err(super::status_error(status, body));
        }

        let json: Value = response.json().await.map_err(GatewayError::from)?;
        let content = json["content"]
            .as_array()
            .map(|blocks| {
                blocks
                    .iter()
                    .filter(|b| b["type"] == "text")
                    .filter_map(|b| b["text"].as_str())
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default();
        let prompt_tokens = json["usage"]["input_tokens"].as_u64().unwrap_or(0) as u32;
        let completion_tokens = json["usage"]["output_tokens"].as_u64().unwrap_or(0) as u32;

        Ok(ChatResponse {
            content,
            model: req.model,
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
            duration_ms: 0,
            finish_reason: json["stop_reason"].as_str().unwrap_or("stop").to_string(),
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
        "anthropic"
    }

    async fn available(&self) -> bool {
        !self.api_key.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_mapping_has_no_system_role() {
        assert_eq!(role_str(Role::System), "user");
        assert_eq!(role_str(Role::Assistant), "assistant");
    }
}
