//! OpenAI-compatible backend: SSE streaming over `/v1/chat/completions`,
//! shared by openai, grok, groq, dnet, mlx and openrouter.

use crate::config::TimeoutConfig;
use crate::error::{GatewayError, GatewayResult};
use crate::model::{ChatRequest, ChatResponse, Frame, Role};
use crate::provider::timeout::{await_headers, supervise_stream};
use crate::provider::{OnToken, Provider};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn role_str(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
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
    messages: Vec<WireMessage<'a>>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

fn build_body<'a>(req: &'a ChatRequest) -> WireRequest<'a> {
    let mut messages = Vec::new();
    if let Some(system) = &req.system_prompt {
        messages.push(WireMessage { role: "system", content: system });
    }
    for message in &req.messages {
        messages.push(WireMessage { role: role_str(message.role), content: &message.content });
    }
    WireRequest {
        model: &req.model,
        messages,
        stream: true,
        max_tokens: if req.max_tokens > 0 { Some(req.max_tokens) } else { None },
        temperature: if req.temperature > 0.0 { Some(req.temperature) } else { None },
    }
}

/// Decodes one SSE `data: {...}` payload into a [`Frame`]; `[DONE]` yields
/// `None` (end of stream, distinct from an error).
fn decode_sse_data(payload: &str) -> Option<GatewayResult<Frame>> {
    if payload == "[DONE]" {
        return None;
    }
    Some(serde_json::from_str::<Value>(payload).map_err(GatewayError::from).map(|json| {
        let delta = json["choices"][0]["delta"]["content"].as_str().map(str::to_string).filter(|s| !s.is_empty());
        let usage = json.get("usage").map(|u| {
            (
                u.get("prompt_tokens").and_then(Value::as_u64).unwrap_or(0) as u32,
                u.get("completion_tokens").and_then(Value::as_u64).unwrap_or(0) as u32,
            )
        });
        let finish_reason = json["choices"][0]["finish_reason"].as_str();
        Frame { delta_content: delta, tool_call_delta: None, done: finish_reason.is_some(), usage }
    }))
}

/// Splits a byte stream on SSE event boundaries (`\n\n`) and yields the
/// `data:` field of each event as a [`Frame`].
struct SseFrameDecoder {
    buffer: String,
}

impl SseFrameDecoder {
    fn new() -> Self {
        SseFrameDecoder { buffer: String::new() }
    }

    fn push(&mut self, chunk: &str) -> Vec<GatewayResult<Frame>> {
        self.buffer.push_str(chunk);
        let mut out = Vec::new();
        while let Some(idx) = self.buffer.find("\n\n") {
            let event: String = self.buffer.drain(..idx + 2).collect();
            for line in event.lines() {
                if let Some(data) = line.strip_prefix("data:") {
                    if let Some(frame) = decode_sse_data(data.trim()) {
                        out.push(frame);
                    }
                }
            }
        }
        out
    }
}

pub enum AuthMode {
    Bearer(String),
    None,
}

/// OpenAI-compatible provider over SSE: openai, grok, groq, dnet, mlx,
/// openrouter.
pub struct OpenAiCompatProvider {
    client: reqwest::Client,
    base_url: String,
    provider_name: String,
    auth: AuthMode,
    timeouts: TimeoutConfig,
}

impl OpenAiCompatProvider {
    pub fn new(provider_name: String, base_url: String, auth: AuthMode) -> Self {
        let timeouts = TimeoutConfig::for_host(
            url::Url::parse(&base_url).ok().and_then(|u| u.host_str().map(str::to_string)).unwrap_or_default().as_str(),
        );
        OpenAiCompatProvider { client: reqwest::Client::new(), base_url, provider_name, auth, timeouts }
    }

    fn headers(&self) -> GatewayResult<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(ACCEPT, HeaderValue::from_static("text/event-stream"));
        if let AuthMode::Bearer(key) = &self.auth {
            let value = HeaderValue::from_str(&format!("Bearer {key}")).map_err(|e| GatewayError::Internal(e.to_string()))?;
            headers.insert(AUTHORIZATION, value);
        }
        Ok(headers)
    }

    async fn raw_stream(&self, req: &ChatRequest) -> GatewayResult<impl futures::Stream<Item = GatewayResult<Frame>>> {
        let body = build_body(req);
        let url = format!("{}/v1/chat/completions", self.base_url);
        let headers = self.headers()?;

        let response = await_headers(self.name(), self.timeouts, async {
            self.client.post(&url).headers(headers).json(&body).send().await.map_err(GatewayError::from)
        })
        .await?;

        if !response.status().is_success() {
            let (status, body) = super::bounded_error_body(response).await;
            return Err(super::status_error(status, body));
        }

        let mut decoder = SseFrameDecoder::new();
        let stream = response.bytes_stream().map(move |chunk| match chunk {
            Ok(bytes) => decoder.push(&String::from_utf8_lossy(&bytes)),
            Err(err) => vec![Err(GatewayError::from(err))],
        });
        Ok(stream.flat_map(futures::stream::iter))
    }
}

#[async_trait]
impl Provider for OpenAiCompatProvider {
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
        &self.provider_name
    }

    async fn available(&self) -> bool {
        match &self.auth {
            AuthMode::Bearer(key) => !key.is_empty(),
            AuthMode::None => {
                // dnet/mlx: liveness is GET /v1/models within 3-5s.
                let fut = self.client.get(format!("{}/v1/models", self.base_url)).send();
                matches!(tokio::time::timeout(Duration::from_secs(5), fut).await, Ok(Ok(r)) if r.status().is_success())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_delta_and_done_sentinel() {
        let mut decoder = SseFrameDecoder::new();
        let frames = decoder.push("data: {\"choices\":[{\"delta\":{\"content\":\"Hi\"}}]}\n\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].as_ref().unwrap().delta_content.as_deref(), Some("Hi"));

        let done = decoder.push("data: [DONE]\n\n");
        assert!(done.is_empty());
    }

    #[test]
    fn buffers_partial_events_across_chunks() {
        let mut decoder = SseFrameDecoder::new();
        assert!(decoder.push("data: {\"choices\":[{\"delta\":{\"content\":\"He").is_empty());
        let frames = decoder.push("llo\"}}]}\n\n");
        assert_eq!(frames[0].as_ref().unwrap().delta_content.as_deref(), Some("Hello"));
    }

    #[test]
    fn finish_reason_marks_done() {
        let mut decoder = SseFrameDecoder::new();
        let frames = decoder.push("data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"stop\"}],\"usage\":{\"prompt_tokens\":5,\"completion_tokens\":2}}\n\n");
        let frame = frames[0].as_ref().unwrap();
        assert!(frame.done);
        assert_eq!(frame.usage, Some((5, 2)));
    }
}
