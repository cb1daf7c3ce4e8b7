//! Token Budget
//!
//! Daily/monthly token and dollar tracking, independent of the rate limiter
//!: the rate limiter governs pace, this governs spend.

use crate::config::BudgetConfig;
use crate::model::{BudgetState, ProviderUsage};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

const SECS_PER_DAY: i64 = 86_400;

fn now_unix() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs() as i64
}

fn day_start(ts: i64) -> i64 {
    ts - ts.rem_euclid(SECS_PER_DAY)
}

/// Rough month boundary: aligned to 30-day buckets from the epoch. This only
/// needs to be a monotonic period boundary derived from "now" — calendar-
/// month accounting belongs to a richer clock the core doesn't depend on.
fn month_start(ts: i64) -> i64 {
    const SECS_PER_MONTH: i64 = SECS_PER_DAY * 30;
    ts - ts.rem_euclid(SECS_PER_MONTH)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertLevel {
    Warn,
    Critical,
    Exceeded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetMetric {
    DailyTokens,
    DailyCost,
    MonthlyTokens,
    MonthlyCost,
}

#[derive(Debug, Clone, Copy)]
pub struct BudgetAlert {
    pub level: AlertLevel,
    pub metric: BudgetMetric,
    pub percentage: f64,
}

/// Why `can_spend` declined a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetCap {
    PerRequest,
    DailyTokens,
    DailyCost,
    MonthlyTokens,
    MonthlyCost,
}

impl std::fmt::Display for BudgetCap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BudgetCap::PerRequest => "per-request token cap",
            BudgetCap::DailyTokens => "daily token limit",
            BudgetCap::DailyCost => "daily cost limit",
            BudgetCap::MonthlyTokens => "monthly token limit",
            BudgetCap::MonthlyCost => "monthly cost limit",
        };
        write!(f, "{}", s)
    }
}

/// `on_alert` handlers run detached so a slow handler never stalls the
/// caller.
pub type AlertHandler = std::sync::Arc<dyn Fn(BudgetAlert) + Send + Sync>;

struct Inner {
    state: BudgetState,
}

/// Daily/monthly token and cost tracker, persisted to a JSON file after
/// every mutation.
pub struct TokenBudget {
    config: BudgetConfig,
    persist_path: Option<PathBuf>,
    inner: RwLock<Inner>,
    on_alert: Option<AlertHandler>,
}

impl TokenBudget {
    pub fn new(config: BudgetConfig, persist_path: Option<PathBuf>) -> Self {
        let state = persist_path
            .as_deref()
            .and_then(Self::load_from_disk)
            .unwrap_or_else(|| Self::fresh_state(now_unix()));
        TokenBudget {
            config,
            persist_path,
            inner: RwLock::new(Inner { state }),
            on_alert: None,
        }
    }

    pub fn with_alert_handler(mut self, handler: AlertHandler) -> Self {
        self.on_alert = Some(handler);
        self
    }

    fn fresh_state(now: i64) -> BudgetState {
        BudgetState {
            day_start: day_start(now),
            month_start: month_start(now),
            daily_tokens: 0,
            daily_cost: 0.0,
            monthly_tokens: 0,
            monthly_cost: 0.0,
            total_tokens: 0,
            total_cost: 0.0,
            per_provider: HashMap::new(),
        }
    }

    fn load_from_disk(path: &Path) -> Option<BudgetState> {
        let bytes = std::fs::read(path).ok()?;
        match serde_json::from_slice(&bytes) {
            Ok(state) => Some(state),
            Err(err) => {
                tracing::warn!(error = %err, path = %path.display(), "failed to load budget state; starting fresh");
                None
            }
        }
    }

    fn persist(&self, state: &BudgetState) {
        let Some(path) = &self.persist_path else { return };
        match serde_json::to_vec_pretty(state) {
            Ok(bytes) => {
                if let Err(err) = std::fs::write(path, bytes) {
                    tracing::warn!(error = %err, path = %path.display(), "failed to persist budget state");
                }
            }
            Err(err) => tracing::warn!(error = %err, "failed to serialize budget state"),
        }
    }

    /// Rolls daily/monthly counters forward if "now" has crossed a period
    /// boundary.
    fn roll_periods(&self, state: &mut BudgetState) {
        let now = now_unix();
        if day_start(now) != state.day_start {
            state.day_start = day_start(now);
            state.daily_tokens = 0;
            state.daily_cost = 0.0;
        }
        if month_start(now) != state.month_start {
            state.month_start = month_start(now);
            state.monthly_tokens = 0;
            state.monthly_cost = 0.0;
        }
    }

    fn cost_for(&self, provider: &str, input_tokens: u64, output_tokens: u64) -> f64 {
        let pricing = self
            .config
            .provider_costs
            .get(provider)
            .cloned()
            .unwrap_or_default();
        (input_tokens as f64 / 1e6) * pricing.input_per_1m
            + (output_tokens as f64 / 1e6) * pricing.output_per_1m
    }

    /// `can_spend`: would adding this estimate cross any cap?
    pub fn can_spend(&self, provider: &str, input_tokens: u64, output_tokens: u64) -> Result<(), BudgetCap> {
        let mut guard = self.inner.write();
        self.roll_periods(&mut guard.state);
        let total = input_tokens + output_tokens;
        let cost = self.cost_for(provider, input_tokens, output_tokens);

        if total > self.config.max_tokens_per_request {
            return Err(BudgetCap::PerRequest);
        }
        if guard.state.daily_tokens + total > self.config.daily_token_limit {
            return Err(BudgetCap::DailyTokens);
        }
        if guard.state.daily_cost + cost > self.config.daily_dollar_limit {
            return Err(BudgetCap::DailyCost);
        }
        if guard.state.monthly_tokens + total > self.config.monthly_token_limit {
            return Err(BudgetCap::MonthlyTokens);
        }
        if guard.state.monthly_cost + cost > self.config.monthly_dollar_limit {
            return Err(BudgetCap::MonthlyCost);
        }
        Ok(())
    }

    /// `spend`: records usage, then fires any threshold alerts
    /// crossed by this spend. Alert handlers run detached.
    pub fn spend(&self, provider: &str, input_tokens: u64, output_tokens: u64) {
        let total = input_tokens + output_tokens;
        let cost = self.cost_for(provider, input_tokens, output_tokens);

        let (before, after, snapshot) = {
            let mut guard = self.inner.write();
            self.roll_periods(&mut guard.state);
            let before = guard.state.clone();

            guard.state.daily_tokens += total;
            guard.state.daily_cost += cost;
            guard.state.monthly_tokens += total;
            guard.state.monthly_cost += cost;
            guard.state.total_tokens += total;
            guard.state.total_cost += cost;
            let entry = guard.state.per_provider.entry(provider.to_string()).or_insert_with(ProviderUsage::default);
            entry.tokens += total;
            entry.cost += cost;

            let after = guard.state.clone();
            (before, after, guard.state.clone())
        };

        self.persist(&snapshot);
        self.fire_alerts(&before, &after);
    }

    fn fire_alerts(&self, before: &BudgetState, after: &BudgetState) {
        let Some(handler) = self.on_alert.clone() else { return };
        let checks: [(BudgetMetric, f64, f64, f64); 4] = [
            (BudgetMetric::DailyTokens, before.daily_tokens as f64, after.daily_tokens as f64, self.config.daily_token_limit as f64),
            (BudgetMetric::DailyCost, before.daily_cost, after.daily_cost, self.config.daily_dollar_limit),
            (BudgetMetric::MonthlyTokens, before.monthly_tokens as f64, after.monthly_tokens as f64, self.config.monthly_token_limit as f64),
            (BudgetMetric::MonthlyCost, before.monthly_cost, after.monthly_cost, self.config.monthly_dollar_limit),
        ];

        for (metric, before_val, after_val, cap) in checks {
            if cap <= 0.0 {
                continue;
            }
            let before_pct = before_val / cap;
            let after_pct = after_val / cap;
            let level = if before_pct < 1.0 && after_pct >= 1.0 {
                Some(AlertLevel::Exceeded)
            } else if before_pct < self.config.critical_threshold && after_pct >= self.config.critical_threshold {
                Some(AlertLevel::Critical)
            } else if before_pct < self.config.warn_threshold && after_pct >= self.config.warn_threshold {
                Some(AlertLevel::Warn)
            } else {
                None
            };
            if let Some(level) = level {
                let alert = BudgetAlert { level, metric, percentage: after_pct * 100.0 };
                let handler = handler.clone();
                tokio::spawn(async move { handler(alert) });
            }
        }
    }

    /// Snapshot read: all fields observed under one lock acquisition.
    pub fn state(&self) -> BudgetState {
        let mut guard = self.inner.write();
        self.roll_periods(&mut guard.state);
        guard.state.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> BudgetConfig {
        BudgetConfig {
            daily_token_limit: 1000,
            daily_dollar_limit: 1.0,
            monthly_token_limit: 100_000,
            monthly_dollar_limit: 100.0,
            max_tokens_per_request: 500,
            warn_threshold: 0.80,
            critical_threshold: 0.95,
            provider_costs: HashMap::new(),
        }
    }

    #[test]
    fn per_request_cap_is_enforced() {
        let budget = TokenBudget::new(test_config(), None);
        assert_eq!(budget.can_spend("openai", 300, 300), Err(BudgetCap::PerRequest));
    }

    #[test]
    fn daily_token_cap_is_enforced() {
        let budget = TokenBudget::new(test_config(), None);
        budget.spend("openai", 400, 0);
        budget.spend("openai", 400, 0);
        assert_eq!(budget.can_spend("openai", 300, 0), Err(BudgetCap::DailyTokens));
    }

    #[test]
    fn spends_accumulate_within_a_day() {
        let budget = TokenBudget::new(test_config(), None);
        budget.spend("openai", 100, 50);
        budget.spend("openai", 50, 25);
        let state = budget.state();
        assert_eq!(state.daily_tokens, 225);
        assert_eq!(state.total_tokens, 225);
    }

    #[tokio::test]
    async fn warn_alert_fires_once_crossing_threshold() {
        // daily_dollar_limit=$1.00, warn_threshold=0.80: a spend moving
        // daily_cost from $0.70 to $0.82 fires exactly one Warn alert.
        let mut cfg = test_config();
        cfg.daily_dollar_limit = 1.0;
        cfg.warn_threshold = 0.80;
        cfg.max_tokens_per_request = 1_000_000;
        cfg.provider_costs.insert(
            "openai".to_string(),
            crate::config::ProviderCost { input_per_1m: 1.0, output_per_1m: 0.0 },
        );

        let fired = std::sync::Arc::new(std::sync::atomic::AtomicU32::new(0));
        let fired_clone = fired.clone();
        let budget = TokenBudget::new(cfg, None).with_alert_handler(std::sync::Arc::new(move |alert| {
            if matches!(alert.level, AlertLevel::Warn) {
                fired_clone.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            }
        }));

        budget.spend("openai", 700_000, 0); // daily_cost -> $0.70
        budget.spend("openai", 120_000, 0); // daily_cost -> $0.82, crosses 0.80
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(fired.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
