//! Gateway-wide error taxonomy
//!
//! Every fallible operation in the request-handling core returns a
//! [`GatewayError`]. Variants line up with the failure classes the router's
//! fallback policy needs to discriminate between (see `router::Router`).

use thiserror::Error;

/// Unified error type for the gateway core.
#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    #[error("provider '{0}' is unavailable")]
    UpstreamUnavailable(String),

    #[error("upstream returned status {status}: {body}")]
    UpstreamStatus { status: u16, body: String },

    #[error("timed out waiting for response headers from '{provider}' after {elapsed_ms}ms")]
    HeaderTimeout { provider: String, elapsed_ms: u64 },

    #[error("timed out waiting for first token from '{provider}' after {elapsed_ms}ms")]
    FirstTokenTimeout { provider: String, elapsed_ms: u64 },

    #[error("stream idle for {elapsed_ms}ms from '{provider}', exceeding idle timeout")]
    StreamIdleTimeout { provider: String, elapsed_ms: u64 },

    #[error("request cancelled")]
    Cancelled,

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("budget exceeded: {0}")]
    BudgetExceeded(String),

    #[error("runaway generation: aggregated output exceeded {limit_bytes} bytes")]
    RunawayGeneration { limit_bytes: usize },

    #[error("failed to decode upstream protocol frame: {0}")]
    ProtocolDecode(String),

    #[error("vision is disabled by configuration")]
    VisionDisabled,

    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Whether the router's single-retry smart→fast fallback policy applies
    /// to this failure class.
    pub fn is_retryable_for_fallback(&self) -> bool {
        matches!(
            self,
            GatewayError::UpstreamUnavailable(_)
                | GatewayError::UpstreamStatus { status: 500..=599, .. }
                | GatewayError::HeaderTimeout { .. }
                | GatewayError::FirstTokenTimeout { .. }
        )
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            GatewayError::HeaderTimeout {
                provider: "unknown".to_string(),
                elapsed_ms: 0,
            }
        } else if err.is_connect() {
            GatewayError::UpstreamUnavailable(err.to_string())
        } else {
            GatewayError::Internal(err.to_string())
        }
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        GatewayError::ProtocolDecode(err.to_string())
    }
}

impl From<std::io::Error> for GatewayError {
    fn from(err: std::io::Error) -> Self {
        GatewayError::Internal(err.to_string())
    }
}

/// Result alias used throughout the gateway core.
pub type GatewayResult<T> = Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fallback_eligibility_matches_documented_table() {
        assert!(GatewayError::UpstreamUnavailable("x".into()).is_retryable_for_fallback());
        assert!(GatewayError::UpstreamStatus { status: 503, body: String::new() }
            .is_retryable_for_fallback());
        assert!(!GatewayError::UpstreamStatus { status: 404, body: String::new() }
            .is_retryable_for_fallback());
        assert!(GatewayError::HeaderTimeout { provider: "p".into(), elapsed_ms: 1 }
            .is_retryable_for_fallback());
        assert!(GatewayError::FirstTokenTimeout { provider: "p".into(), elapsed_ms: 1 }
            .is_retryable_for_fallback());
        assert!(!GatewayError::Cancelled.is_retryable_for_fallback());
        assert!(!GatewayError::StreamIdleTimeout { provider: "p".into(), elapsed_ms: 1 }
            .is_retryable_for_fallback());
    }
}
