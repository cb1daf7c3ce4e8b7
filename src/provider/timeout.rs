//! Three-phase streaming timeout state machine.
//!
//! ```text
//! INIT --(request sent)--> AWAIT_HEADERS --(headers)--> AWAIT_FIRST_TOKEN
//!           |                    |                              |
//!           |               (hdr timeout)--> FAIL               |
//!           |                                                   v
//!           |                              (first frame)--> STREAMING
//!           |                          (first-token timeout)--> FAIL
//!           |                                                   |
//!           |                                   (frame w/ done)--> SUCCESS
//!           |                                   (idle timeout)--> FAIL
//! ```
//!
//! `await_headers` covers INIT -> AWAIT_HEADERS; `supervise_stream` covers
//! AWAIT_FIRST_TOKEN through SUCCESS/FAIL. The caller owns the transport and
//! hands this module only the response-header future and the decoded frame
//! stream, so the same supervisor drives every backend.

use crate::config::TimeoutConfig;
use crate::error::{GatewayError, GatewayResult};
use crate::model::{ChatResponse, Frame, ToolCall};
use crate::provider::OnToken;
use futures::{Stream, StreamExt};
use std::pin::Pin;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Hard cap on aggregated streamed content; a generation past this is
/// treated as runaway and aborted.
pub const MAX_AGGREGATE_BYTES: usize = 50 * 1024 * 1024;

/// Trailing sentinel tokens stripped from aggregated content before return.
const SPECIAL_TOKENS: &[&str] = &["<|eot_id|>", "<|end_of_text|>"];

/// Bounds a future that resolves once response headers are available (TCP
/// connect + TLS + header receipt) by the connection-timeout phase. This is
/// deliberately NOT a whole-request timeout — a whole-request timeout would
/// corrupt long streams.
pub async fn await_headers<F, T>(provider: &str, timeouts: TimeoutConfig, fut: F) -> GatewayResult<T>
where
    F: std::future::Future<Output = GatewayResult<T>>,
{
    match tokio::time::timeout(Duration::from_secs(timeouts.connection_sec), fut).await {
        Ok(result) => result,
        Err(_) => Err(GatewayError::HeaderTimeout {
            provider: provider.to_string(),
            elapsed_ms: timeouts.connection_sec * 1000,
        }),
    }
}

/// Drives AWAIT_FIRST_TOKEN -> STREAMING -> SUCCESS/FAIL over a decoded frame
/// stream. A single producer (the `frames` stream) is raced
/// against the phase's current timer and the cancellation token on every
/// iteration, so cancellation is observed promptly and the idle timer resets
/// on every frame.
pub async fn supervise_stream(
    mut frames: Pin<Box<dyn Stream<Item = GatewayResult<Frame>> + Send>>,
    provider: &str,
    model: &str,
    timeouts: TimeoutConfig,
    on_token: &mut OnToken<'_>,
    cancel: CancellationToken,
) -> GatewayResult<ChatResponse> {
    let start = Instant::now();
    let mut content = String::new();
    let mut tool_calls: Vec<ToolCall> = Vec::new();
    let mut prompt_tokens = 0u32;
    let mut completion_tokens = 0u32;
    let mut first_token_received = false;

    loop {
        let phase_timeout = if first_token_received {
            Duration::from_secs(timeouts.stream_idle_sec)
        } else {
            Duration::from_secs(timeouts.first_token_sec)
        };

        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                return Err(GatewayError::Cancelled);
            }

            frame = frames.next() => {
                let frame = match frame {
                    Some(f) => f?,
                    None => break,
                };

                if let Some(delta) = &frame.delta_content {
                    if content.len() + delta.len() > MAX_AGGREGATE_BYTES {
                        return Err(GatewayError::RunawayGeneration { limit_bytes: MAX_AGGREGATE_BYTES });
                    }
                    content.push_str(delta);
                    on_token(delta);
                }
                if let Some(tool_call) = frame.tool_call_delta {
                    tool_calls.push(tool_call);
                }
                if let Some((p, c)) = frame.usage {
                    prompt_tokens = p;
                    completion_tokens = c;
                }

                first_token_received = true;
                if frame.done {
                    break;
                }
            }

            _ = tokio::time::sleep(phase_timeout) => {
                let elapsed_ms = start.elapsed().as_millis() as u64;
                return Err(if first_token_received {
                    GatewayError::StreamIdleTimeout { provider: provider.to_string(), elapsed_ms }
                } else {
                    GatewayError::FirstTokenTimeout { provider: provider.to_string(), elapsed_ms }
                });
            }
        }
    }

    for special in SPECIAL_TOKENS {
        if let Some(stripped) = content.strip_suffix(special) {
            content = stripped.to_string();
        }
    }

    let finish_reason = if !tool_calls.is_empty() { "tool_calls" } else { "stop" };

    Ok(ChatResponse {
        content,
        model: model.to_string(),
        prompt_tokens,
        completion_tokens,
        total_tokens: prompt_tokens + completion_tokens,
        duration_ms: start.elapsed().as_millis() as u64,
        finish_reason: finish_reason.to_string(),
        tool_calls,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    fn frame(delta: &str, done: bool) -> GatewayResult<Frame> {
        Ok(Frame { delta_content: Some(delta.to_string()), tool_call_delta: None, done, usage: if done { Some((10, 4)) } else { None } })
    }

    #[tokio::test]
    async fn happy_path_ollama_stream_concatenates_frames() {
        let frames = stream::iter(vec![frame("Hello", false), frame(" ", false), frame("world", false), frame("!", true)]);
        let mut collected = String::new();
        let result = supervise_stream(
            Box::pin(frames),
            "ollama",
            "llama3.2:3b",
            TimeoutConfig::LOCAL,
            &mut |delta: &str| collected.push_str(delta),
            CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(result.content, "Hello world!");
        assert_eq!(collected, "Hello world!");
        assert_eq!(result.prompt_tokens, 10);
        assert_eq!(result.completion_tokens, 4);
        assert_eq!(result.total_tokens, 14);
    }

    #[tokio::test]
    async fn first_token_timeout_fires_when_headers_flush_but_no_frame_arrives() {
        let frames = stream::pending::<GatewayResult<Frame>>();
        let timeouts = TimeoutConfig { connection_sec: 30, first_token_sec: 0, stream_idle_sec: 30 };
        let result = supervise_stream(
            Box::pin(frames),
            "ollama",
            "llama3.2:3b",
            timeouts,
            &mut |_: &str| {},
            CancellationToken::new(),
        )
        .await;
        assert!(matches!(result, Err(GatewayError::FirstTokenTimeout { .. })));
    }

    #[tokio::test]
    async fn idle_timeout_fires_after_a_pause_mid_stream() {
        let frames = stream::iter(vec![frame("first ", false)]).chain(stream::pending());
        let timeouts = TimeoutConfig { connection_sec: 30, first_token_sec: 30, stream_idle_sec: 0 };
        let mut collected = String::new();
        let result = supervise_stream(
            Box::pin(frames),
            "ollama",
            "llama3.2:3b",
            timeouts,
            &mut |delta: &str| collected.push_str(delta),
            CancellationToken::new(),
        )
        .await;
        assert!(matches!(result, Err(GatewayError::StreamIdleTimeout { .. })));
        assert_eq!(collected, "first ");
    }

    #[tokio::test]
    async fn cancellation_returns_promptly() {
        let frames = stream::pending::<GatewayResult<Frame>>();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = supervise_stream(
            Box::pin(frames),
            "ollama",
            "llama3.2:3b",
            TimeoutConfig::LOCAL,
            &mut |_: &str| {},
            cancel,
        )
        .await;
        assert!(matches!(result, Err(GatewayError::Cancelled)));
    }

    #[tokio::test]
    async fn special_tokens_are_stripped_from_aggregated_content() {
        let frames = stream::iter(vec![frame("done", false), frame("<|eot_id|>", true)]);
        let result = supervise_stream(
            Box::pin(frames),
            "ollama",
            "llama3.2:3b",
            TimeoutConfig::LOCAL,
            &mut |_: &str| {},
            CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(result.content, "done");
    }
}
