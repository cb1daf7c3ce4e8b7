//! Outcome Store
//!
//! Persistent record of routing decisions and their graded outcomes,
//! supporting success-rate queries the router's learning loop consumes.
//! The core only specifies the interface it consumes; schema ownership
//! belongs to the caller's storage layer, but a reference
//! `SqliteOutcomeStore` is provided with a fixed column set.

use crate::model::RoutingOutcome;
use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::Connection;

/// A single routing outcome row as persisted.
#[derive(Debug, Clone)]
pub struct OutcomeRecord {
    pub provider: String,
    pub model: String,
    pub task_type: String,
    pub routing_lane: String,
    pub routing_reason: String,
    pub routing_forced: bool,
    pub routing_constraint: Option<String>,
    pub success: bool,
    pub outcome_score: Option<f64>,
    pub duration_ms: u64,
    pub created_at: i64,
}

impl OutcomeRecord {
    pub fn from_routing_outcome(outcome: &RoutingOutcome, provider: &str, model: &str, task_type: &str, score: f64, created_at: i64) -> Self {
        OutcomeRecord {
            provider: provider.to_string(),
            model: model.to_string(),
            task_type: task_type.to_string(),
            routing_lane: outcome.lane.to_string(),
            routing_reason: outcome.reason.clone(),
            routing_forced: outcome.forced,
            routing_constraint: outcome.constraint.clone(),
            success: outcome.success,
            outcome_score: Some(score),
            duration_ms: outcome.latency_ms,
            created_at,
        }
    }

    /// Mean-reduction input: `outcome_score` when present, else `success`
    /// coerced to `{0.0, 1.0}`.
    fn effective_score(&self) -> f64 {
        self.outcome_score.unwrap_or(if self.success { 1.0 } else { 0.0 })
    }
}

/// Distribution of requests across lanes over a trailing window.
#[derive(Debug, Clone, Default)]
pub struct LaneDistribution {
    pub fast: u64,
    pub smart: u64,
}

/// A model ranked by success rate, with its sample count.
#[derive(Debug, Clone)]
pub struct RankedModel {
    pub provider: String,
    pub model: String,
    pub success_rate: f64,
    pub samples: u64,
}

/// Minimum sample count below which success-rate queries are considered
/// "insufficient data".
pub const MIN_SAMPLES: u64 = 5;

#[async_trait]
pub trait OutcomeStore: Send + Sync {
    /// `log_outcome`: updates the most recent prior entry for
    /// `(provider, model)` with routing fields and a graded score.
    async fn log_outcome(&self, outcome: &RoutingOutcome, provider: &str, model: &str, task: &str, latency_ms: u64);

    /// `record_outcome`: used when no prior conversation log
    /// exists; creates a lightweight row directly.
    async fn record_outcome(&self, record: OutcomeRecord);

    /// `get_model_stats`: `(success_rate, n)`.
    async fn get_model_stats(&self, provider: &str, model: &str, task: Option<&str>) -> (f64, u64);

    /// `get_lane_stats`: `(success_rate, n)`.
    async fn get_lane_stats(&self, lane: &str, task: Option<&str>) -> (f64, u64);

    async fn get_recent_outcomes(&self, limit: usize) -> Vec<OutcomeRecord>;

    async fn get_model_performance_history(&self, provider: &str, model: &str, days: u32) -> Vec<OutcomeRecord>;

    async fn get_lane_distribution(&self, days: u32) -> LaneDistribution;

    /// Requires at least [`MIN_SAMPLES`] samples per candidate.
    async fn get_top_performing_models(&self, task: Option<&str>, limit: usize) -> Vec<RankedModel>;
}

/// Default in-process implementation; used in tests and by callers that
/// don't need cross-restart persistence.
#[derive(Default)]
pub struct InMemoryOutcomeStore {
    rows: Mutex<Vec<OutcomeRecord>>,
}

impl InMemoryOutcomeStore {
    pub fn new() -> Self {
        InMemoryOutcomeStore::default()
    }
}

#[async_trait]
impl OutcomeStore for InMemoryOutcomeStore {
    async fn log_outcome(&self, outcome: &RoutingOutcome, provider: &str, model: &str, task: &str, latency_ms: u64) {
        let mut rows = self.rows.lock();
        if let Some(row) = rows.iter_mut().rev().find(|r| r.provider == provider && r.model == model) {
            row.routing_lane = outcome.lane.to_string();
            row.routing_reason = outcome.reason.clone();
            row.routing_forced = outcome.forced;
            row.routing_constraint = outcome.constraint.clone();
            row.success = outcome.success;
            row.outcome_score = Some(outcome.score as f64);
            row.duration_ms = latency_ms;
        } else {
            rows.push(OutcomeRecord {
                provider: provider.to_string(),
                model: model.to_string(),
                task_type: task.to_string(),
                routing_lane: outcome.lane.to_string(),
                routing_reason: outcome.reason.clone(),
                routing_forced: outcome.forced,
                routing_constraint: outcome.constraint.clone(),
                success: outcome.success,
                outcome_score: Some(outcome.score as f64),
                duration_ms: latency_ms,
                created_at: 0,
            });
        }
    }

    async fn record_outcome(&self, record: OutcomeRecord) {
        self.rows.lock().push(record);
    }

    async fn get_model_stats(&self, provider: &str, model: &str, task: Option<&str>) -> (f64, u64) {
        let rows = self.rows.lock();
        let matching: Vec<&OutcomeRecord> = rows
            .iter()
            .filter(|r| r.provider == provider && r.model == model)
            .filter(|r| task.map(|t| r.task_type == t).unwrap_or(true))
            .collect();
        if matching.is_empty() {
            return (0.0, 0);
        }
        let mean = matching.iter().map(|r| r.effective_score()).sum::<f64>() / matching.len() as f64;
        (mean, matching.len() as u64)
    }

    async fn get_lane_stats(&self, lane: &str, task: Option<&str>) -> (f64, u64) {
        let rows = self.rows.lock();
        let matching: Vec<&OutcomeRecord> = rows
            .iter()
            .filter(|r| r.routing_lane == lane)
            .filter(|r| task.map(|t| r.task_type == t).unwrap_or(true))
            .collect();
        if matching.is_empty() {
            return (0.0, 0);
        }
        let mean = matching.iter().map(|r| r.effective_score()).sum::<f64>() / matching.len() as f64;
        (mean, matching.len() as u64)
    }

    async fn get_recent_outcomes(&self, limit: usize) -> Vec<OutcomeRecord> {
        let rows = self.rows.lock();
        rows.iter().rev().take(limit).cloned().collect()
    }

    async fn get_model_performance_history(&self, provider: &str, model: &str, _days: u32) -> Vec<OutcomeRecord> {
        let rows = self.rows.lock();
        rows.iter().filter(|r| r.provider == provider && r.model == model).cloned().collect()
    }

    async fn get_lane_distribution(&self, _days: u32) -> LaneDistribution {
        let rows = self.rows.lock();
        let mut dist = LaneDistribution::default();
        for row in rows.iter() {
            match row.routing_lane.as_str() {
                "fast" => dist.fast += 1,
                "smart" => dist.smart += 1,
                _ => {}
            }
        }
        dist
    }

    async fn get_top_performing_models(&self, task: Option<&str>, limit: usize) -> Vec<RankedModel> {
        let rows = self.rows.lock();
        let mut by_model: std::collections::HashMap<(String, String), Vec<&OutcomeRecord>> = std::collections::HashMap::new();
        for row in rows.iter() {
            if task.map(|t| row.task_type == t).unwrap_or(true) {
                by_model.entry((row.provider.clone(), row.model.clone())).or_default().push(row);
            }
        }
        let mut ranked: Vec<RankedModel> = by_model
            .into_iter()
            .filter(|(_, records)| records.len() as u64 >= MIN_SAMPLES)
            .map(|((provider, model), records)| {
                let success_rate = records.iter().map(|r| r.effective_score()).sum::<f64>() / records.len() as f64;
                RankedModel { provider, model, success_rate, samples: records.len() as u64 }
            })
            .collect();
        ranked.sort_by(|a, b| b.success_rate.partial_cmp(&a.success_rate).unwrap_or(std::cmp::Ordering::Equal));
        ranked.truncate(limit);
        ranked
    }
}

/// `rusqlite`-backed reference implementation with a fixed column set.
/// Mirrors the in-memory store's query semantics against a real
/// table so the pair can be swapped behind the same trait.
pub struct SqliteOutcomeStore {
    conn: Mutex<Connection>,
}

impl SqliteOutcomeStore {
    pub fn open(path: &str) -> rusqlite::Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS outcomes (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                provider TEXT NOT NULL,
                model TEXT NOT NULL,
                task_type TEXT NOT NULL,
                routing_lane TEXT NOT NULL,
                routing_reason TEXT NOT NULL,
                routing_forced INTEGER NOT NULL,
                routing_constraint TEXT,
                success INTEGER NOT NULL,
                outcome_score REAL,
                duration_ms INTEGER NOT NULL,
                created_at INTEGER NOT NULL
            )",
            [],
        )?;
        Ok(SqliteOutcomeStore { conn: Mutex::new(conn) })
    }

    fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<OutcomeRecord> {
        Ok(OutcomeRecord {
            provider: row.get("provider")?,
            model: row.get("model")?,
            task_type: row.get("task_type")?,
            routing_lane: row.get("routing_lane")?,
            routing_reason: row.get("routing_reason")?,
            routing_forced: row.get::<_, i64>("routing_forced")? != 0,
            routing_constraint: row.get("routing_constraint")?,
            success: row.get::<_, i64>("success")? != 0,
            outcome_score: row.get("outcome_score")?,
            duration_ms: row.get::<_, i64>("duration_ms")? as u64,
            created_at: row.get("created_at")?,
        })
    }

    fn insert(&self, record: &OutcomeRecord) -> rusqlite::Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO outcomes (provider, model, task_type, routing_lane, routing_reason, routing_forced, routing_constraint, success, outcome_score, duration_ms, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            rusqlite::params![
                record.provider,
                record.model,
                record.task_type,
                record.routing_lane,
                record.routing_reason,
                record.routing_forced as i64,
                record.routing_constraint,
                record.success as i64,
                record.outcome_score,
                record.duration_ms as i64,
                record.created_at,
            ],
        )?;
        Ok(())
    }
}

#[async_trait]
impl OutcomeStore for SqliteOutcomeStore {
    async fn log_outcome(&self, outcome: &RoutingOutcome, provider: &str, model: &str, task: &str, latency_ms: u64) {
        let conn = self.conn.lock();
        let updated = conn.execute(
            "UPDATE outcomes SET routing_lane=?1, routing_reason=?2, routing_forced=?3, routing_constraint=?4, success=?5, outcome_score=?6, duration_ms=?7
             WHERE id = (SELECT id FROM outcomes WHERE provider=?8 AND model=?9 ORDER BY id DESC LIMIT 1)",
            rusqlite::params![
                outcome.lane.to_string(),
                outcome.reason,
                outcome.forced as i64,
                outcome.constraint,
                outcome.success as i64,
                outcome.score as f64,
                latency_ms as i64,
                provider,
                model,
            ],
        ).unwrap_or(0);
        drop(conn);
        if updated == 0 {
            let record = OutcomeRecord::from_routing_outcome(outcome, provider, model, task, outcome.score as f64, 0);
            let _ = self.insert(&record);
        }
    }

    async fn record_outcome(&self, record: OutcomeRecord) {
        let _ = self.insert(&record);
    }

    async fn get_model_stats(&self, provider: &str, model: &str, task: Option<&str>) -> (f64, u64) {
        let conn = self.conn.lock();
        let (query, params): (&str, Vec<&dyn rusqlite::ToSql>) = if let Some(task) = task {
            ("SELECT success, outcome_score FROM outcomes WHERE provider=?1 AND model=?2 AND task_type=?3", vec![&provider, &model, &task])
        } else {
            ("SELECT success, outcome_score FROM outcomes WHERE provider=?1 AND model=?2", vec![&provider, &model])
        };
        Self::mean_score(&conn, query, &params)
    }

    async fn get_lane_stats(&self, lane: &str, task: Option<&str>) -> (f64, u64) {
        let conn = self.conn.lock();
        let (query, params): (&str, Vec<&dyn rusqlite::ToSql>) = if let Some(task) = task {
            ("SELECT success, outcome_score FROM outcomes WHERE routing_lane=?1 AND task_type=?2", vec![&lane, &task])
        } else {
            ("SELECT success, outcome_score FROM outcomes WHERE routing_lane=?1", vec![&lane])
        };
        Self::mean_score(&conn, query, &params)
    }

    async fn get_recent_outcomes(&self, limit: usize) -> Vec<OutcomeRecord> {
        let conn = self.conn.lock();
        let mut stmt = match conn.prepare("SELECT * FROM outcomes ORDER BY id DESC LIMIT ?1") {
            Ok(s) => s,
            Err(_) => return Vec::new(),
        };
        stmt.query_map(rusqlite::params![limit as i64], Self::row_to_record)
            .map(|rows| rows.filter_map(Result::ok).collect())
            .unwrap_or_default()
    }

    async fn get_model_performance_history(&self, provider: &str, model: &str, _days: u32) -> Vec<OutcomeRecord> {
        let conn = self.conn.lock();
        let mut stmt = match conn.prepare("SELECT * FROM outcomes WHERE provider=?1 AND model=?2 ORDER BY id ASC") {
            Ok(s) => s,
            Err(_) => return Vec::new(),
        };
        stmt.query_map(rusqlite::params![provider, model], Self::row_to_record)
            .map(|rows| rows.filter_map(Result::ok).collect())
            .unwrap_or_default()
    }

    async fn get_lane_distribution(&self, _days: u32) -> LaneDistribution {
        let conn = self.conn.lock();
        let mut dist = LaneDistribution::default();
        let mut stmt = match conn.prepare("SELECT routing_lane, COUNT(*) FROM outcomes GROUP BY routing_lane") {
            Ok(s) => s,
            Err(_) => return dist,
        };
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)));
        if let Ok(rows) = rows {
            for row in rows.filter_map(Result::ok) {
                match row.0.as_str() {
                    "fast" => dist.fast = row.1 as u64,
                    "smart" => dist.smart = row.1 as u64,
                    _ => {}
                }
            }
        }
        dist
    }

    async fn get_top_performing_models(&self, task: Option<&str>, limit: usize) -> Vec<RankedModel> {
        let conn = self.conn.lock();
        let query = if task.is_some() {
            "SELECT provider, model, success, outcome_score FROM outcomes WHERE task_type=?1"
        } else {
            "SELECT provider, model, success, outcome_score FROM outcomes"
        };
        let mut stmt = match conn.prepare(query) {
            Ok(s) => s,
            Err(_) => return Vec::new(),
        };
        let map_row = |row: &rusqlite::Row<'_>| -> rusqlite::Result<(String, String, bool, Option<f64>)> {
            Ok((row.get(0)?, row.get(1)?, row.get::<_, i64>(2)? != 0, row.get(3)?))
        };
        let rows: Vec<(String, String, bool, Option<f64>)> = if let Some(task) = task {
            stmt.query_map(rusqlite::params![task], map_row).map(|r| r.filter_map(Result::ok).collect()).unwrap_or_default()
        } else {
            stmt.query_map([], map_row).map(|r| r.filter_map(Result::ok).collect()).unwrap_or_default()
        };
        drop(stmt);
        drop(conn);

        let mut by_model: std::collections::HashMap<(String, String), Vec<f64>> = std::collections::HashMap::new();
        for (provider, model, success, outcome_score) in rows {
            let score = outcome_score.unwrap_or(if success { 1.0 } else { 0.0 });
            by_model.entry((provider, model)).or_default().push(score);
        }
        let mut ranked: Vec<RankedModel> = by_model
            .into_iter()
            .filter(|(_, scores)| scores.len() as u64 >= MIN_SAMPLES)
            .map(|((provider, model), scores)| RankedModel {
                provider,
                model,
                success_rate: scores.iter().sum::<f64>() / scores.len() as f64,
                samples: scores.len() as u64,
            })
            .collect();
        ranked.sort_by(|a, b| b.success_rate.partial_cmp(&a.success_rate).unwrap_or(std::cmp::Ordering::Equal));
        ranked.truncate(limit);
        ranked
    }
}

impl SqliteOutcomeStore {
    fn mean_score(conn: &Connection, query: &str, params: &[&dyn rusqlite::ToSql]) -> (f64, u64) {
        let mut stmt = match conn.prepare(query) {
            Ok(s) => s,
            Err(_) => return (0.0, 0),
        };
        let scores: Vec<f64> = stmt
            .query_map(params, |row| {
                let success: i64 = row.get(0)?;
                let outcome_score: Option<f64> = row.get(1)?;
                Ok(outcome_score.unwrap_or(if success != 0 { 1.0 } else { 0.0 }))
            })
            .map(|rows| rows.filter_map(Result::ok).collect())
            .unwrap_or_default();
        if scores.is_empty() {
            return (0.0, 0);
        }
        let n = scores.len() as u64;
        (scores.iter().sum::<f64>() / n as f64, n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Lane;

    fn outcome(lane: Lane, success: bool, score: f32) -> RoutingOutcome {
        RoutingOutcome {
            lane,
            reason: "test".to_string(),
            model_selected: "gpt-4o".to_string(),
            forced: false,
            constraint: None,
            success,
            score,
            latency_ms: 100,
            used_fallback: false,
        }
    }

    #[tokio::test]
    async fn model_stats_below_min_samples_still_reports_mean() {
        let store = InMemoryOutcomeStore::new();
        store.log_outcome(&outcome(Lane::Fast, true, 0.9), "openai", "gpt-4o", "coding", 100).await;
        let (rate, n) = store.get_model_stats("openai", "gpt-4o", Some("coding")).await;
        assert_eq!(n, 1);
        assert!((rate - 0.9).abs() < 0.01);
    }

    #[tokio::test]
    async fn top_performing_requires_min_samples() {
        let store = InMemoryOutcomeStore::new();
        for _ in 0..3 {
            store.record_outcome(OutcomeRecord::from_routing_outcome(&outcome(Lane::Smart, true, 1.0), "anthropic", "claude-3-5-sonnet-20241022", "coding", 1.0, 0)).await;
        }
        assert!(store.get_top_performing_models(Some("coding"), 5).await.is_empty());

        for _ in 0..5 {
            store.record_outcome(OutcomeRecord::from_routing_outcome(&outcome(Lane::Smart, true, 1.0), "openai", "gpt-4o", "coding", 1.0, 0)).await;
        }
        let ranked = store.get_top_performing_models(Some("coding"), 5).await;
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].model, "gpt-4o");
    }

    #[tokio::test]
    async fn lane_distribution_counts_each_lane() {
        let store = InMemoryOutcomeStore::new();
        store.record_outcome(OutcomeRecord::from_routing_outcome(&outcome(Lane::Fast, true, 1.0), "ollama", "llama3.2:3b", "general", 1.0, 0)).await;
        store.record_outcome(OutcomeRecord::from_routing_outcome(&outcome(Lane::Smart, true, 1.0), "openai", "gpt-4o", "general", 1.0, 0)).await;
        let dist = store.get_lane_distribution(7).await;
        assert_eq!(dist.fast, 1);
        assert_eq!(dist.smart, 1);
    }

    #[test]
    fn sqlite_store_persists_and_updates_latest_row() {
        let tmp = std::env::temp_dir().join(format!("gateway-outcome-test-{}.sqlite", std::process::id()));
        let _ = std::fs::remove_file(&tmp);
        let store = SqliteOutcomeStore::open(tmp.to_str().unwrap()).expect("open sqlite store");
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            store.record_outcome(OutcomeRecord::from_routing_outcome(&outcome(Lane::Fast, true, 0.5), "ollama", "llama3.2:3b", "general", 0.5, 0)).await;
            store.log_outcome(&outcome(Lane::Fast, true, 0.8), "ollama", "llama3.2:3b", "general", 50).await;
            let (rate, n) = store.get_model_stats("ollama", "llama3.2:3b", None).await;
            assert_eq!(n, 1);
            assert!((rate - 0.8).abs() < 0.01);
        });
        let _ = std::fs::remove_file(&tmp);
    }
}
