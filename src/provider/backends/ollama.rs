//! Ollama backend: native newline-delimited JSON frames over `/api/chat`,
//! liveness via `/api/tags`.

use crate::config::TimeoutConfig;
use crate::error::{GatewayError, GatewayResult};
use crate::model::{ChatRequest, ChatResponse, Frame, Role, ToolCall};
use crate::provider::timeout::{await_headers, supervise_stream};
use crate::provider::{OnToken, Provider};
use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Serialize)]
struct OllamaMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct OllamaOptions {
    temperature: f32,
    num_predict: u32,
}

#[derive(Serialize)]
struct OllamaRequest<'a> {
    model: &'a str,
    messages: Vec<OllamaMessage<'a>>,
    stream: bool,
    options: OllamaOptions,
}

#[derive(Deserialize)]
struct OllamaMessageFrame {
    #[serde(default)]
    content: String,
    #[serde(default)]
    tool_calls: Vec<Value>,
}

#[derive(Deserialize)]
struct OllamaFrame {
    #[serde(default)]
    message: Option<OllamaMessageFrame>,
    done: bool,
    prompt_eval_count: Option<u32>,
    eval_count: Option<u32>,
}

/// Resolves a model to warm up when none was configured, by asking the
/// local daemon what it already has pulled.
async fn first_available_model(client: &reqwest::Client, base_url: &str) -> Option<String> {
    let response = client.get(format!("{base_url}/api/tags")).send().await.ok()?;
    let body: Value = response.json().await.ok()?;
    body.get("models")?.as_array()?.first()?.get("name")?.as_str().map(str::to_string)
}

fn role_str(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    }
}

fn build_request<'a>(req: &'a ChatRequest) -> OllamaRequest<'a> {
    let mut messages: Vec<OllamaMessage<'a>> = Vec::new();
    if let Some(system) = &req.system_prompt {
        messages.push(OllamaMessage { role: "system", content: system });
    }
    for message in &req.messages {
        messages.push(OllamaMessage { role: role_str(message.role), content: &message.content });
    }
    OllamaRequest {
        model: &req.model,
        messages,
        stream: true,
        options: OllamaOptions { temperature: req.temperature, num_predict: req.max_tokens },
    }
}

fn decode_frame(line: &str) -> GatewayResult<Frame> {
    let raw: OllamaFrame = serde_json::from_str(line)?;
    let delta_content = raw.message.as_ref().map(|m| m.content.clone()).filter(|c| !c.is_empty());
    let tool_call_delta = raw
        .message
        .as_ref()
        .and_then(|m| m.tool_calls.first())
        .map(|tc| ToolCall {
            id: tc.get("id").and_then(Value::as_str).unwrap_or_default().to_string(),
            name: tc
                .get("function")
                .and_then(|f| f.get("name"))
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            arguments: tc
                .get("function")
                .and_then(|f| f.get("arguments"))
                .map(|v| v.to_string())
                .unwrap_or_default(),
        });
    Ok(Frame {
        delta_content,
        tool_call_delta,
        done: raw.done,
        usage: match (raw.prompt_eval_count, raw.eval_count) {
            (Some(p), Some(c)) => Some((p, c)),
            _ => None,
        },
    })
}

/// Ollama provider: local, unauthenticated, newline-delimited JSON streaming.
pub struct OllamaProvider {
    client: reqwest::Client,
    base_url: String,
    timeouts: TimeoutConfig,
    default_model: String,
}

impl OllamaProvider {
    /// `default_model` is the model the warm-up call loads into memory; it
    /// should match whatever model routing actually dispatches to this
    /// provider most often (e.g. the configured fast-lane model).
    pub fn new(base_url: String, default_model: String) -> Self {
        let timeouts = TimeoutConfig::for_host(
            url::Url::parse(&base_url).ok().and_then(|u| u.host_str().map(str::to_string)).unwrap_or_default().as_str(),
        );
        let provider = OllamaProvider { client: reqwest::Client::new(), base_url, timeouts, default_model };
        provider.spawn_warmup();
        provider
    }

    /// Schedules an async warm-up chat on construction; failures are logged
    /// and ignored, construction and admission are never blocked. If no
    /// default model was configured, resolves the first model reported by
    /// `/api/tags` instead so the call still loads something into memory.
    fn spawn_warmup(&self) {
        let client = self.client.clone();
        let base_url = self.base_url.clone();
        let configured_model = self.default_model.clone();
        let deadline = Duration::from_secs(self.timeouts.first_token_sec);
        tokio::spawn(async move {
            let model = if !configured_model.is_empty() {
                Some(configured_model)
            } else {
                first_available_model(&client, &base_url).await
            };
            let Some(model) = model else {
                tracing::debug!(provider = "ollama", "warm-up skipped; no model configured or reported by /api/tags");
                return;
            };
            let body = serde_json::json!({
                "model": model,
                "messages": [{"role": "user", "content": "Hi"}],
                "stream": false,
                "options": {"num_predict": 1},
            });
            let result = tokio::time::timeout(deadline, client.post(format!("{base_url}/api/chat")).json(&body).send()).await;
            if let Err(_) | Ok(Err(_)) = result {
                tracing::debug!(provider = "ollama", model, "warm-up request failed or timed out; ignoring");
            }
        });
    }

    async fn raw_stream(&self, req: &ChatRequest) -> GatewayResult<impl futures::Stream<Item = GatewayResult<Frame>>> {
        let body = build_request(req);
        let url = format!("{}/api/chat", self.base_url);

        let response = await_headers(self.name(), self.timeouts, async {
            self.client.post(&url).json(&body).send().await.map_err(GatewayError::from)
        })
        .await?;

        if !response.status().is_success() {
            let (status, body) = super::bounded_error_body(response).await;
            return Err(super::status_error(status, body));
        }

        let byte_stream = response.bytes_stream();
        let lines = byte_stream
            .map(|chunk| chunk.map_err(GatewayError::from))
            .flat_map(|chunk| {
                let lines: Vec<GatewayResult<Frame>> = match chunk {
                    Ok(bytes) => String::from_utf8_lossy(&bytes)
                        .lines()
                        .filter(|l| !l.trim().is_empty())
                        .map(|l| decode_frame(l))
                        .collect(),
                    Err(err) => vec![Err(err)],
                };
                futures::stream::iter(lines)
            });
        Ok(lines)
    }
}

#[async_trait]
impl Provider for OllamaProvider {
    async fn chat(&self, req: ChatRequest, cancel: CancellationToken) -> GatewayResult<ChatResponse> {
        let mut noop = |_: &str| {};
        self.chat_stream(req, &mut noop, cancel).await
    }

    async fn chat_stream(&self, req: ChatRequest, on_token: &mut OnToken<'_>, cancel: CancellationToken) -> GatewayResult<ChatResponse> {
        let model = req.model.clone();
        let stream = self.raw_stream(&req).await?;
        supervise_stream(Box::pin(stream), self.name(), &model, self.timeouts, on_token, cancel).await
    }

    fn name(&self) -> &str {
        "ollama"
    }

    async fn available(&self) -> bool {
        let fut = self.client.get(format!("{}/api/tags", self.base_url)).send();
        let Ok(Ok(response)) = tokio::time::timeout(Duration::from_secs(5), fut).await else {
            return false;
        };
        let Ok(body) = response.json::<Value>().await else {
            return false;
        };
        body.get("models").and_then(Value::as_array).map(|models| !models.is_empty()).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_delta_and_done_frame() {
        let line = r#"{"model":"llama3.2:3b","message":{"role":"assistant","content":"Hello"},"done":false}"#;
        let frame = decode_frame(line).unwrap();
        assert_eq!(frame.delta_content.as_deref(), Some("Hello"));
        assert!(!frame.done);

        let done_line = r#"{"model":"llama3.2:3b","message":{"role":"assistant","content":""},"done":true,"prompt_eval_count":10,"eval_count":4}"#;
        let done_frame = decode_frame(done_line).unwrap();
        assert!(done_frame.done);
        assert_eq!(done_frame.usage, Some((10, 4)));
    }

    #[test]
    fn malformed_frame_yields_protocol_decode_error() {
        let result = decode_frame("not json");
        assert!(matches!(result, Err(GatewayError::ProtocolDecode(_))));
    }
}
