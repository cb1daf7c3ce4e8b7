//! Rate Limiter
//!
//! Per-provider token bucket with a concurrency gate and a daily quota.
//! Buckets live for the process lifetime once a provider's limits are
//! first set.

use crate::config::RateLimitConfig;
use crate::error::{GatewayError, GatewayResult};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

struct TokenBucket {
    capacity: f64,
    tokens: Mutex<f64>,
    refill_per_sec: f64,
    last_refill: Mutex<Instant>,
}

impl TokenBucket {
    fn new(capacity: f64, refill_per_sec: f64) -> Self {
        TokenBucket {
            capacity,
            tokens: Mutex::new(capacity),
            refill_per_sec,
            last_refill: Mutex::new(Instant::now()),
        }
    }

    fn refill(&self) {
        let mut last = self.last_refill.lock();
        let elapsed = last.elapsed().as_secs_f64();
        if elapsed <= 0.0 {
            return;
        }
        let mut tokens = self.tokens.lock();
        *tokens = (*tokens + elapsed * self.refill_per_sec).min(self.capacity);
        *last = Instant::now();
    }

    /// Attempts to consume one token; returns whether it succeeded.
    fn try_acquire(&self) -> bool {
        self.refill();
        let mut tokens = self.tokens.lock();
        if *tokens >= 1.0 {
            *tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

struct ProviderLimiter {
    bucket: TokenBucket,
    concurrency: Arc<Semaphore>,
    daily_used: AtomicU64,
    tokens_per_day: u64,
}

/// A held admission slot; dropping it releases the concurrency gate.
pub struct Permit {
    _concurrency: tokio::sync::OwnedSemaphorePermit,
}

/// Per-provider token-bucket + concurrency-gate + daily-quota admission
/// control.
pub struct RateLimiter {
    providers: Mutex<HashMap<String, Arc<ProviderLimiter>>>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        RateLimiter::new()
    }
}

impl RateLimiter {
    pub fn new() -> Self {
        RateLimiter { providers: Mutex::new(HashMap::new()) }
    }

    fn limiter_for(&self, provider: &str, limits: &RateLimitConfig) -> Arc<ProviderLimiter> {
        let mut providers = self.providers.lock();
        providers
            .entry(provider.to_string())
            .or_insert_with(|| {
                Arc::new(ProviderLimiter {
                    bucket: TokenBucket::new(limits.burst_size as f64, limits.requests_per_minute / 60.0),
                    concurrency: Arc::new(Semaphore::new(limits.concurrent_requests as usize)),
                    daily_used: AtomicU64::new(0),
                    tokens_per_day: limits.tokens_per_day,
                })
            })
            .clone()
    }

    /// `acquire(provider, estimated_tokens)`: admits the call or
    /// fails with `RateLimited`. Blocks on the concurrency gate up to
    /// `cancel`'s firing; never blocks on the token bucket itself (a miss is
    /// an immediate rejection, matching the bucket's "continuous refill, no
    /// queueing" semantics).
    pub async fn acquire(
        &self,
        provider: &str,
        estimated_tokens: u64,
        limits: &RateLimitConfig,
        cancel: &CancellationToken,
    ) -> GatewayResult<Permit> {
        let limiter = self.limiter_for(provider, limits);

        let used = limiter.daily_used.load(Ordering::SeqCst);
        if used + estimated_tokens > limiter.tokens_per_day {
            return Err(GatewayError::RateLimited(format!(
                "daily token limit exceeded for '{provider}' ({used}+{estimated_tokens} > {})",
                limiter.tokens_per_day
            )));
        }

        if !limiter.bucket.try_acquire() {
            return Err(GatewayError::RateLimited(format!(
                "request rate limit exceeded for '{provider}'"
            )));
        }

        let concurrency = limiter.concurrency.clone();
        tokio::select! {
            permit = concurrency.acquire_owned() => {
                let permit = permit.map_err(|_| GatewayError::Internal("rate limiter semaphore closed".to_string()))?;
                Ok(Permit { _concurrency: permit })
            }
            _ = cancel.cancelled() => Err(GatewayError::Cancelled),
        }
    }

    /// Convenience wrapper bounding the wait with a fixed deadline instead of
    /// an explicit cancellation token.
    pub async fn acquire_with_timeout(
        &self,
        provider: &str,
        estimated_tokens: u64,
        limits: &RateLimitConfig,
        deadline: Duration,
    ) -> GatewayResult<Permit> {
        let cancel = CancellationToken::new();
        let guard = cancel.clone();
        let sleeper = tokio::spawn(async move {
            tokio::time::sleep(deadline).await;
            guard.cancel();
        });
        let result = self.acquire(provider, estimated_tokens, limits, &cancel).await;
        sleeper.abort();
        result
    }

    /// `record_usage`: increments daily counters after upstream
    /// completion with actual tokens.
    pub fn record_usage(&self, provider: &str, limits: &RateLimitConfig, actual_tokens: u64) {
        let limiter = self.limiter_for(provider, limits);
        limiter.daily_used.fetch_add(actual_tokens, Ordering::SeqCst);
    }

    /// `reset_daily`: invoked at midnight or process start.
    pub fn reset_daily(&self) {
        for limiter in self.providers.lock().values() {
            limiter.daily_used.store(0, Ordering::SeqCst);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits(rpm: f64, burst: u32, concurrent: u32, daily: u64) -> RateLimitConfig {
        RateLimitConfig {
            requests_per_minute: rpm,
            tokens_per_minute: rpm * 100.0,
            tokens_per_day: daily,
            concurrent_requests: concurrent,
            burst_size: burst,
        }
    }

    #[tokio::test]
    async fn burst_capacity_then_exhaustion() {
        let limiter = RateLimiter::new();
        let limits = limits(60.0, 2, 10, 1_000_000);
        let cancel = CancellationToken::new();

        let p1 = limiter.acquire("openai", 10, &limits, &cancel).await;
        assert!(p1.is_ok());
        let p2 = limiter.acquire("openai", 10, &limits, &cancel).await;
        assert!(p2.is_ok());
        let p3 = limiter.acquire("openai", 10, &limits, &cancel).await;
        assert!(matches!(p3, Err(GatewayError::RateLimited(_))));
    }

    #[tokio::test]
    async fn daily_quota_rejects_with_reason_mentioning_daily_limit() {
        let limiter = RateLimiter::new();
        let limits = limits(6000.0, 100, 10, 1000);
        let cancel = CancellationToken::new();
        limiter.record_usage("groq", &limits, 999);

        let result = limiter.acquire("groq", 2, &limits, &cancel).await;
        match result {
            Err(GatewayError::RateLimited(reason)) => assert!(reason.contains("daily token limit")),
            other => panic!("expected RateLimited, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn cancellation_unblocks_a_saturated_concurrency_gate() {
        let limiter = RateLimiter::new();
        let limits = limits(6000.0, 100, 1, 1_000_000);
        let cancel = CancellationToken::new();

        let _held = limiter.acquire("ollama", 1, &limits, &cancel).await.unwrap();
        let cancel2 = CancellationToken::new();
        cancel2.cancel();
        let result = limiter.acquire("ollama", 1, &limits, &cancel2).await;
        assert!(matches!(result, Err(GatewayError::Cancelled)));
    }
}
