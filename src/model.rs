//! Shared data model for the gateway core.
//!
//! These types are the common currency between the registry, scorer,
//! provider engine, router, assessor and outcome store — none of them own
//! request/response shapes privately.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Capability bucket derived from an overall score (0–35/36–55/56–75/76–89/90–100).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelTier {
    Small,
    Medium,
    Large,
    Xl,
    Frontier,
}

impl ModelTier {
    /// Map an overall 0–100 score to its tier.
    pub fn from_score(overall: u8) -> ModelTier {
        match overall {
            0..=35 => ModelTier::Small,
            36..=55 => ModelTier::Medium,
            56..=75 => ModelTier::Large,
            76..=89 => ModelTier::Xl,
            _ => ModelTier::Frontier,
        }
    }
}

/// Where a `UnifiedCapabilityScore` came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScoreSource {
    Registry,
    Heuristic,
}

/// Five integer sub-scores plus a confidence and a provenance tag.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UnifiedCapabilityScore {
    pub overall: u8,
    pub reasoning: u8,
    pub coding: u8,
    pub instruction_following: u8,
    pub speed: u8,
    pub confidence: f32,
    pub source: ScoreSource,
}

impl UnifiedCapabilityScore {
    pub fn tier(&self) -> ModelTier {
        ModelTier::from_score(self.overall)
    }
}

/// Boolean feature flags for a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityFlags {
    pub vision: bool,
    pub function_calling: bool,
    pub structured_json: bool,
    pub streaming: bool,
    pub system_prompt: bool,
}

impl Default for CapabilityFlags {
    fn default() -> Self {
        CapabilityFlags {
            vision: false,
            function_calling: false,
            structured_json: true,
            streaming: true,
            system_prompt: true,
        }
    }
}

/// Input/output dollar price per 1M tokens for cloud-backed models.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pricing {
    pub input_per_1m: f64,
    pub output_per_1m: f64,
}

/// A fully resolved `(provider, model)` capability record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelCapability {
    pub provider: String,
    pub model: String,
    pub display_name: String,
    pub tier: ModelTier,
    pub score: UnifiedCapabilityScore,
    pub flags: CapabilityFlags,
    pub pricing: Option<Pricing>,
    pub context_window: u32,
    #[serde(default)]
    pub aliases: Vec<String>,
}

impl ModelCapability {
    pub fn id(&self) -> String {
        format!("{}/{}", self.provider, self.model)
    }

    /// Local backends never carry pricing; cloud backends always must.
    pub fn is_local(&self) -> bool {
        matches!(self.provider.as_str(), "ollama" | "mlx" | "dnet")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call: Option<ToolCall>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatRequest {
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    pub messages: Vec<Message>,
    #[serde(default)]
    pub max_tokens: u32,
    #[serde(default)]
    pub temperature: f32,
    #[serde(default)]
    pub stream: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatResponse {
    pub content: String,
    pub model: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
    pub duration_ms: u64,
    pub finish_reason: String,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
}

/// One frame of a streaming response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Frame {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta_content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_delta: Option<ToolCall>,
    pub done: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<(u32, u32)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Lane {
    Fast,
    Smart,
}

impl std::fmt::Display for Lane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Lane::Fast => write!(f, "fast"),
            Lane::Smart => write!(f, "smart"),
        }
    }
}

/// Record of one routing decision and its result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingOutcome {
    pub lane: Lane,
    pub reason: String,
    pub model_selected: String,
    pub forced: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub constraint: Option<String>,
    pub success: bool,
    pub score: f32,
    pub latency_ms: u64,
    pub used_fallback: bool,
}

/// One completed exchange as handed to the assessor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationLog {
    pub prompt: String,
    pub response: String,
    pub duration_ms: u64,
    pub complexity_score: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issues: Option<Vec<Issue>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueType {
    Timeout,
    Repetition,
    ToolFailure,
    Truncation,
    JsonError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Issue {
    pub kind: IssueType,
    pub severity: Severity,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evidence: Option<String>,
}

/// Post-hoc quality grade of a completed response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Assessment {
    pub capability_score: u8,
    pub issues: Vec<Issue>,
    pub confidence: f32,
}

/// Running daily/monthly token and cost counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetState {
    pub day_start: i64,
    pub month_start: i64,
    pub daily_tokens: u64,
    pub daily_cost: f64,
    pub monthly_tokens: u64,
    pub monthly_cost: f64,
    pub total_tokens: u64,
    pub total_cost: f64,
    pub per_provider: HashMap<String, ProviderUsage>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderUsage {
    pub tokens: u64,
    pub cost: f64,
}

/// Per-provider admission limits.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ProviderLimits {
    pub requests_per_minute: f64,
    pub tokens_per_minute: f64,
    pub tokens_per_day: u64,
    pub concurrent_requests: u32,
    pub burst_size: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tier_boundaries_match_documented_thresholds() {
        assert_eq!(ModelTier::from_score(0), ModelTier::Small);
        assert_eq!(ModelTier::from_score(35), ModelTier::Small);
        assert_eq!(ModelTier::from_score(36), ModelTier::Medium);
        assert_eq!(ModelTier::from_score(55), ModelTier::Medium);
        assert_eq!(ModelTier::from_score(56), ModelTier::Large);
        assert_eq!(ModelTier::from_score(75), ModelTier::Large);
        assert_eq!(ModelTier::from_score(76), ModelTier::Xl);
        assert_eq!(ModelTier::from_score(89), ModelTier::Xl);
        assert_eq!(ModelTier::from_score(90), ModelTier::Frontier);
        assert_eq!(ModelTier::from_score(100), ModelTier::Frontier);
    }

    #[test]
    fn local_providers_are_classified_correctly() {
        let mk = |provider: &str| ModelCapability {
            provider: provider.to_string(),
            model: "m".to_string(),
            display_name: "m".to_string(),
            tier: ModelTier::Medium,
            score: UnifiedCapabilityScore {
                overall: 50,
                reasoning: 50,
                coding: 50,
                instruction_following: 50,
                speed: 50,
                confidence: 0.9,
                source: ScoreSource::Registry,
            },
            flags: CapabilityFlags::default(),
            pricing: None,
            context_window: 8192,
            aliases: Vec::new(),
        };
        assert!(mk("ollama").is_local());
        assert!(mk("mlx").is_local());
        assert!(mk("dnet").is_local());
        assert!(!mk("anthropic").is_local());
    }
}
