//! Metrics Registry
//!
//! Per-call latency/token/cost accounting aggregated across all providers.
//! One set of counters is created per provider at construction and lives
//! in a process-global registry.

use crate::config::ProviderCost;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// 6-bucket latency histogram boundaries: `<100ms, <500ms, <1s, <2s, <5s, 5s+`.
const HISTOGRAM_BOUNDS_MS: [u64; 5] = [100, 500, 1_000, 2_000, 5_000];

#[derive(Debug, Default)]
struct Histogram {
    buckets: [AtomicU64; 6],
}

impl Histogram {
    fn record(&self, latency_ms: u64) {
        let idx = HISTOGRAM_BOUNDS_MS
            .iter()
            .position(|&bound| latency_ms < bound)
            .unwrap_or(HISTOGRAM_BOUNDS_MS.len());
        self.buckets[idx].fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> [u64; 6] {
        let mut out = [0u64; 6];
        for (i, bucket) in self.buckets.iter().enumerate() {
            out[i] = bucket.load(Ordering::Relaxed);
        }
        out
    }
}

#[derive(Debug, Default)]
struct ModelCounters {
    calls: AtomicU64,
    errors: AtomicU64,
    prompt_tokens: AtomicU64,
    completion_tokens: AtomicU64,
}

/// Accumulated counters for one provider.
#[derive(Debug, Default)]
struct ProviderMetrics {
    total_calls: AtomicU64,
    total_errors: AtomicU64,
    prompt_tokens: AtomicU64,
    completion_tokens: AtomicU64,
    total_tokens: AtomicU64,
    duration_ms_sum: AtomicU64,
    min_latency_ms: AtomicU64,
    max_latency_ms: AtomicU64,
    histogram: Histogram,
    cost_micros: AtomicU64,
    per_model: DashMap<String, ModelCounters>,
}

impl ProviderMetrics {
    fn new() -> Self {
        ProviderMetrics { min_latency_ms: AtomicU64::new(u64::MAX), ..Default::default() }
    }
}

/// Read-only snapshot returned by `get_metrics()`.
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub total_calls: u64,
    pub total_errors: u64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub avg_latency_ms: f64,
    pub min_latency_ms: u64,
    pub max_latency_ms: u64,
    pub latency_histogram: [u64; 6],
    pub estimated_cost_usd: f64,
}

/// One call's outcome, as fed into `MetricsRegistry::record`.
pub struct CallRecord<'a> {
    pub provider: &'a str,
    pub model: &'a str,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub duration_ms: u64,
    pub is_error: bool,
}

/// Process-global per-provider call accounting.
#[derive(Default)]
pub struct MetricsRegistry {
    providers: DashMap<String, ProviderMetrics>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        MetricsRegistry::default()
    }

    fn metrics_for(&self, provider: &str) -> dashmap::mapref::one::RefMut<'_, String, ProviderMetrics> {
        self.providers.entry(provider.to_string()).or_insert_with(ProviderMetrics::new)
    }

    /// Records one completed call's latency/token/cost accounting.
    pub fn record(&self, record: CallRecord<'_>, cost_table: &ProviderCost) {
        let metrics = self.metrics_for(record.provider);

        metrics.total_calls.fetch_add(1, Ordering::Relaxed);
        if record.is_error {
            metrics.total_errors.fetch_add(1, Ordering::Relaxed);
        }
        metrics.prompt_tokens.fetch_add(record.prompt_tokens, Ordering::Relaxed);
        metrics.completion_tokens.fetch_add(record.completion_tokens, Ordering::Relaxed);
        metrics.total_tokens.fetch_add(record.prompt_tokens + record.completion_tokens, Ordering::Relaxed);
        metrics.duration_ms_sum.fetch_add(record.duration_ms, Ordering::Relaxed);
        metrics.min_latency_ms.fetch_min(record.duration_ms, Ordering::Relaxed);
        metrics.max_latency_ms.fetch_max(record.duration_ms, Ordering::Relaxed);
        metrics.histogram.record(record.duration_ms);

        let cost = (record.prompt_tokens as f64 / 1e6) * cost_table.input_per_1m
            + (record.completion_tokens as f64 / 1e6) * cost_table.output_per_1m;
        metrics.cost_micros.fetch_add((cost * 1_000_000.0) as u64, Ordering::Relaxed);

        let model_counters = metrics.per_model.entry(record.model.to_string()).or_default();
        model_counters.calls.fetch_add(1, Ordering::Relaxed);
        if record.is_error {
            model_counters.errors.fetch_add(1, Ordering::Relaxed);
        }
        model_counters.prompt_tokens.fetch_add(record.prompt_tokens, Ordering::Relaxed);
        model_counters.completion_tokens.fetch_add(record.completion_tokens, Ordering::Relaxed);
    }

    pub fn get_metrics(&self, provider: &str) -> Option<MetricsSnapshot> {
        let metrics = self.providers.get(provider)?;
        let total_calls = metrics.total_calls.load(Ordering::Relaxed);
        let duration_sum = metrics.duration_ms_sum.load(Ordering::Relaxed);
        let min_latency = metrics.min_latency_ms.load(Ordering::Relaxed);
        Some(MetricsSnapshot {
            total_calls,
            total_errors: metrics.total_errors.load(Ordering::Relaxed),
            prompt_tokens: metrics.prompt_tokens.load(Ordering::Relaxed),
            completion_tokens: metrics.completion_tokens.load(Ordering::Relaxed),
            total_tokens: metrics.total_tokens.load(Ordering::Relaxed),
            avg_latency_ms: if total_calls > 0 { duration_sum as f64 / total_calls as f64 } else { 0.0 },
            min_latency_ms: if min_latency == u64::MAX { 0 } else { min_latency },
            max_latency_ms: metrics.max_latency_ms.load(Ordering::Relaxed),
            latency_histogram: metrics.histogram.snapshot(),
            estimated_cost_usd: metrics.cost_micros.load(Ordering::Relaxed) as f64 / 1_000_000.0,
        })
    }

    /// Zeroes all counters for every provider.
    pub fn reset(&self) {
        self.providers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_accumulate_per_provider() {
        let registry = MetricsRegistry::new();
        let cost = ProviderCost { input_per_1m: 1.0, output_per_1m: 2.0 };

        registry.record(
            CallRecord { provider: "openai", model: "gpt-4o", prompt_tokens: 100, completion_tokens: 50, duration_ms: 250, is_error: false },
            &cost,
        );
        registry.record(
            CallRecord { provider: "openai", model: "gpt-4o", prompt_tokens: 200, completion_tokens: 100, duration_ms: 600, is_error: true },
            &cost,
        );

        let snapshot = registry.get_metrics("openai").unwrap();
        assert_eq!(snapshot.total_calls, 2);
        assert_eq!(snapshot.total_errors, 1);
        assert_eq!(snapshot.prompt_tokens, 300);
        assert_eq!(snapshot.total_tokens, 450);
        assert_eq!(snapshot.min_latency_ms, 250);
        assert_eq!(snapshot.max_latency_ms, 600);
        assert!(snapshot.estimated_cost_usd > 0.0);
    }

    #[test]
    fn histogram_buckets_latencies_correctly() {
        let registry = MetricsRegistry::new();
        let cost = ProviderCost::default();
        for latency in [50, 450, 900, 1_500, 4_000, 9_000] {
            registry.record(
                CallRecord { provider: "ollama", model: "llama3.2:3b", prompt_tokens: 1, completion_tokens: 1, duration_ms: latency, is_error: false },
                &cost,
            );
        }
        let snapshot = registry.get_metrics("ollama").unwrap();
        assert_eq!(snapshot.latency_histogram, [1, 1, 1, 1, 1, 1]);
    }

    #[test]
    fn reset_clears_all_providers() {
        let registry = MetricsRegistry::new();
        let cost = ProviderCost::default();
        registry.record(
            CallRecord { provider: "openai", model: "gpt-4o", prompt_tokens: 1, completion_tokens: 1, duration_ms: 1, is_error: false },
            &cost,
        );
        registry.reset();
        assert!(registry.get_metrics("openai").is_none());
    }
}
