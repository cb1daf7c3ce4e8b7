//! Typed configuration knobs the gateway core reads.
//!
//! Loading these from a file or environment is out of scope for the core
//! (it belongs to the surrounding CLI/onboarding layer); this module only
//! defines the shapes and their defaults.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Per-provider timeout bundle for the streaming state machine.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TimeoutConfig {
    pub connection_sec: u64,
    pub first_token_sec: u64,
    pub stream_idle_sec: u64,
}

impl TimeoutConfig {
    pub const LOCAL: TimeoutConfig = TimeoutConfig {
        connection_sec: 30,
        first_token_sec: 120,
        stream_idle_sec: 30,
    };

    pub const REMOTE: TimeoutConfig = TimeoutConfig {
        connection_sec: 60,
        first_token_sec: 300,
        stream_idle_sec: 60,
    };

    /// Select the default bundle for a given endpoint host.
    pub fn for_host(host: &str) -> TimeoutConfig {
        const LOCAL_HOSTS: &[&str] = &[
            "localhost",
            "127.0.0.1",
            "::1",
            "host.docker.internal",
            "docker.for.mac.localhost",
        ];
        if LOCAL_HOSTS.contains(&host) {
            TimeoutConfig::LOCAL
        } else {
            TimeoutConfig::REMOTE
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderEndpointConfig {
    pub endpoint: String,
    pub api_key: String,
    pub model: String,
    pub timeouts: TimeoutConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub requests_per_minute: f64,
    pub tokens_per_minute: f64,
    pub tokens_per_day: u64,
    pub concurrent_requests: u32,
    pub burst_size: u32,
}

impl RateLimitConfig {
    /// Per-provider defaults.
    pub fn default_for(provider: &str) -> RateLimitConfig {
        match provider {
            "groq" => RateLimitConfig {
                requests_per_minute: 30.0,
                tokens_per_minute: 30_000.0,
                tokens_per_day: 1_000_000,
                concurrent_requests: 2,
                burst_size: 5,
            },
            "ollama" => RateLimitConfig {
                requests_per_minute: 120.0,
                tokens_per_minute: 120_000.0,
                tokens_per_day: 10_000_000,
                concurrent_requests: 2,
                burst_size: 5,
            },
            _ => RateLimitConfig {
                requests_per_minute: 60.0,
                tokens_per_minute: 60_000.0,
                tokens_per_day: 1_000_000,
                concurrent_requests: 5,
                burst_size: 10,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderCost {
    pub input_per_1m: f64,
    pub output_per_1m: f64,
}

impl Default for ProviderCost {
    fn default() -> Self {
        ProviderCost { input_per_1m: 1.0, output_per_1m: 2.0 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetConfig {
    pub daily_token_limit: u64,
    pub daily_dollar_limit: f64,
    pub monthly_token_limit: u64,
    pub monthly_dollar_limit: f64,
    pub max_tokens_per_request: u64,
    pub warn_threshold: f64,
    pub critical_threshold: f64,
    pub provider_costs: HashMap<String, ProviderCost>,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        BudgetConfig {
            daily_token_limit: 2_000_000,
            daily_dollar_limit: 50.0,
            monthly_token_limit: 40_000_000,
            monthly_dollar_limit: 1000.0,
            max_tokens_per_request: 100_000,
            warn_threshold: 0.80,
            critical_threshold: 0.95,
            provider_costs: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VisionConfig {
    pub enabled: bool,
    pub fallback_enabled: bool,
    pub health_check_interval_sec: u64,
    pub fast_model_timeout_sec: u64,
    pub smart_model_timeout_sec: u64,
    pub max_image_size_mb: u64,
}

impl Default for VisionConfig {
    fn default() -> Self {
        VisionConfig {
            enabled: true,
            fallback_enabled: true,
            health_check_interval_sec: 30,
            fast_model_timeout_sec: 30,
            smart_model_timeout_sec: 120,
            max_image_size_mb: 20,
        }
    }
}

/// Aggregate configuration the gateway core reads.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub rate_limits: HashMap<String, RateLimitConfig>,
    pub budget: BudgetConfig,
    pub providers: HashMap<String, ProviderEndpointConfig>,
    pub vision: VisionConfig,
}
