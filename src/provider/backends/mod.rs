//! Concrete backend adapters.

pub mod anthropic;
pub mod gemini;
pub mod ollama;
pub mod openai_compat;

use crate::error::GatewayError;
use futures::StreamExt;

/// Error bodies are read bounded to prevent a pathological upstream payload
/// from exhausting memory.
pub const MAX_ERROR_BODY_BYTES: usize = 1024 * 1024;

/// Reads the response body chunk by chunk, stopping (and dropping the rest
/// of the stream unread) as soon as `MAX_ERROR_BODY_BYTES` is reached, so an
/// oversized body is never fully buffered in memory.
pub(crate) async fn bounded_error_body(response: reqwest::Response) -> (u16, String) {
    let status = response.status().as_u16();
    let mut body = Vec::new();
    let mut stream = response.bytes_stream();
    while body.len() < MAX_ERROR_BODY_BYTES {
        match stream.next().await {
            Some(Ok(chunk)) => body.extend_from_slice(&chunk),
            _ => break,
        }
    }
    body.truncate(MAX_ERROR_BODY_BYTES);
    (status, String::from_utf8_lossy(&body).into_owned())
}

pub(crate) fn status_error(status: u16, body: String) -> GatewayError {
    GatewayError::UpstreamStatus { status, body }
}
