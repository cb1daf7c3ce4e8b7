//! Provider Engine
//!
//! A uniform chat contract over heterogeneous backends, plus the 3-phase
//! streaming timeout supervisor shared by all of them.

pub mod backends;
pub mod timeout;

use crate::error::GatewayResult;
use crate::model::{ChatRequest, ChatResponse};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// Callback invoked with each decoded delta as it arrives.
pub type OnToken<'a> = dyn FnMut(&str) + Send + 'a;

/// Uniform contract every backend exposes — deliberately narrow: no
/// `embeddings`, no downcast hook.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Non-streaming call; may internally stream and aggregate.
    async fn chat(&self, req: ChatRequest, cancel: CancellationToken) -> GatewayResult<ChatResponse>;

    /// Streams tokens to `on_token` as they arrive; returns the full
    /// aggregated (and special-token-stripped) text.
    async fn chat_stream(&self, req: ChatRequest, on_token: &mut OnToken<'_>, cancel: CancellationToken) -> GatewayResult<ChatResponse>;

    fn name(&self) -> &str;

    /// Cheap liveness probe; must not call the model itself.
    async fn available(&self) -> bool;
}
