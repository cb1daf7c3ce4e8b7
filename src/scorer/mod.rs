//! Capability Scorer
//!
//! Registry-backed scoring with a heuristic fallback for models the
//! [`crate::registry::Registry`] has never seen.

use crate::model::{
    CapabilityFlags, ModelCapability, ModelTier, ScoreSource, UnifiedCapabilityScore,
};
use crate::registry::Registry;
use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref PARAM_COUNT_RE: Regex = Regex::new(r"(?i)(\d+\.?\d*)b").unwrap();
}

/// Ordered tier-name hints consulted when a model carries no extractable
/// parameter count. Not specified precisely by name in the source material;
/// resolved as an explicit design decision (see DESIGN.md).
const TIER_HINTS: &[(ModelTier, &[&str])] = &[
    (ModelTier::Frontier, &["opus", "o1", "o3", "ultra", "gpt-5"]),
    (ModelTier::Xl, &["sonnet", "gpt-4o", "pro", "large"]),
    (ModelTier::Large, &["haiku", "grok"]),
    (ModelTier::Medium, &["mini", "flash"]),
    (ModelTier::Small, &["nano", "tiny"]),
];

fn tier_baseline(tier: ModelTier) -> u8 {
    match tier {
        ModelTier::Small => 30,
        ModelTier::Medium => 48,
        ModelTier::Large => 65,
        ModelTier::Xl => 80,
        ModelTier::Frontier => 92,
    }
}

fn infer_tier_from_name(name: &str) -> ModelTier {
    for (tier, patterns) in TIER_HINTS {
        if patterns.iter().any(|p| name.contains(p)) {
            return *tier;
        }
    }
    ModelTier::Medium
}

/// Extract a parameter count in billions from a model name, e.g. `7b`, `70B`,
/// `6.7b`.
fn extract_param_count(name: &str) -> Option<f64> {
    PARAM_COUNT_RE
        .captures(name)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse::<f64>().ok())
}

fn score_from_param_count(b: f64) -> u8 {
    if b >= 70.0 {
        82
    } else if b >= 30.0 {
        75
    } else if b >= 20.0 {
        70
    } else if b >= 13.0 {
        62
    } else if b >= 7.0 {
        52
    } else if b >= 3.0 {
        40
    } else if b >= 1.0 {
        30
    } else {
        25
    }
}

fn speed_from_param_count(b: Option<f64>) -> u8 {
    match b {
        Some(b) if b >= 70.0 => 25,
        Some(b) if b >= 30.0 => 40,
        Some(b) if b >= 13.0 => 60,
        Some(b) if b >= 7.0 => 80,
        Some(b) if b >= 3.0 => 92,
        Some(_) => 98,
        None => 80,
    }
}

/// Family bonuses applied by substring match, first match wins, in this
/// exact order (note: `llama3` is checked before the more specific
/// `llama3.1`/`llama3.2`, so those finer bonuses only trigger for names
/// that happen to omit the plain `llama3` substring — preserved as written
/// rather than reordered, since the table's listed order is load-bearing).
const FAMILY_BONUSES: &[(&str, i16)] = &[
    ("llama3", 3),
    ("llama3.1", 5),
    ("llama3.2", 4),
    ("qwen2.5", 4),
    ("mistral", 2),
    ("mixtral", 5),
    ("deepseek", 3),
    ("gemma2", 4),
    ("phi3", 6),
];

/// Quantization penalties applied by substring match; every matching entry
/// applies (not a first-match-wins table).
const QUANTIZATION_PENALTIES: &[(&str, i16)] = &[
    ("q2", -20),
    ("2bit", -20),
    ("q3", -15),
    ("q4", -10),
    ("4bit", -10),
    ("q5", -6),
    ("q6", -4),
    ("q8", -2),
    ("8bit", -2),
];

const CODING_NAMES: &[&str] = &["code", "coder", "codellama", "starcoder", "codestral"];
const REASONING_NAMES: &[&str] = &["deepseek-r1", "o1", "reasoning"];

/// Computes a `UnifiedCapabilityScore` heuristically for a model name with no
/// registry entry.
fn heuristic_score(name: &str, size_bytes: Option<u64>) -> UnifiedCapabilityScore {
    let name = name.to_lowercase();

    let tier = infer_tier_from_name(&name);
    let mut overall = tier_baseline(tier) as i16;

    let param_count = extract_param_count(&name).or_else(|| size_bytes.map(|b| b as f64 / 2e9));
    if let Some(b) = param_count {
        overall = score_from_param_count(b) as i16;
    }

    let mut confidence: f32 = 0.50;

    for (pattern, bonus) in FAMILY_BONUSES {
        if name.contains(pattern) {
            overall += bonus;
            break;
        }
    }

    let mut penalty_applied = false;
    for (pattern, penalty) in QUANTIZATION_PENALTIES {
        if name.contains(pattern) {
            overall += penalty;
            penalty_applied = true;
        }
    }
    if penalty_applied {
        confidence *= 0.9;
    }

    overall = overall.clamp(10, 95);
    let mut reasoning = overall;
    let mut coding = overall;
    let instruction_following = overall;

    let speed = speed_from_param_count(param_count) as i16;

    if CODING_NAMES.iter().any(|p| name.contains(p)) {
        coding += 12;
        reasoning -= 5;
    }
    if REASONING_NAMES.iter().any(|p| name.contains(p)) {
        reasoning += 15;
    }

    UnifiedCapabilityScore {
        overall: overall.clamp(10, 95) as u8,
        reasoning: reasoning.clamp(0, 100) as u8,
        coding: coding.clamp(0, 100) as u8,
        instruction_following: instruction_following.clamp(0, 100) as u8,
        speed: speed.clamp(0, 100) as u8,
        confidence,
        source: ScoreSource::Heuristic,
    }
}

fn estimate_context_window(name: &str) -> (u32, u32) {
    if name.contains("3b") {
        (8192, 4096)
    } else if name.contains("7b") || name.contains("8b") {
        (16384, 8192)
    } else if name.contains("13b") || name.contains("14b") {
        (32768, 16384)
    } else if name.contains("70b") || name.contains("72b") {
        (65536, 32768)
    } else {
        (8192, 4096)
    }
}

/// Registry-backed scoring with heuristic fallback.
#[derive(Debug, Default, Clone, Copy)]
pub struct Scorer {
    registry: Registry,
}

impl Scorer {
    pub fn new() -> Scorer {
        Scorer { registry: Registry::new() }
    }

    /// `Score(provider, model)`.
    pub fn score(&self, provider: &str, model: &str) -> UnifiedCapabilityScore {
        if let Some(cap) = self.registry.get(provider, model) {
            return cap.score;
        }
        heuristic_score(model, None)
    }

    /// Scores a model whose size is known only in raw bytes (e.g. a local
    /// GGUF file without a parameter count in its name).
    pub fn score_with_size_hint(&self, provider: &str, model: &str, size_bytes: u64) -> UnifiedCapabilityScore {
        if let Some(cap) = self.registry.get(provider, model) {
            return cap.score;
        }
        heuristic_score(model, Some(size_bytes))
    }

    /// `GetCapabilities`: returns the registry hit verbatim, or a
    /// conservative shell wrapping the heuristic score.
    pub fn get_capabilities(&self, provider: &str, model: &str) -> ModelCapability {
        if let Some(cap) = self.registry.get(provider, model) {
            return cap;
        }
        let score = heuristic_score(model, None);
        let (context_window, _max_output) = estimate_context_window(&model.to_lowercase());
        ModelCapability {
            provider: provider.to_string(),
            model: model.to_lowercase(),
            display_name: model.to_string(),
            tier: score.tier(),
            score,
            flags: CapabilityFlags::default(),
            pricing: None,
            context_window,
            aliases: Vec::new(),
        }
    }

    /// Total order over overall scores.
    pub fn compare_models(&self, a: (&str, &str), b: (&str, &str)) -> std::cmp::Ordering {
        self.score(a.0, a.1).overall.cmp(&self.score(b.0, b.1).overall)
    }

    /// Registry models at or above `max(20, complexity - 10)`, optionally
    /// restricted to local providers, ascending so callers pick the smallest
    /// sufficient model.
    pub fn recommend_for_complexity(&self, complexity: u8, prefer_local: bool) -> Vec<ModelCapability> {
        let floor = std::cmp::max(20, complexity as i16 - 10) as u8;
        let mut candidates: Vec<ModelCapability> = self
            .registry
            .list(None)
            .into_iter()
            .filter(|c| c.score.overall >= floor)
            .filter(|c| !prefer_local || c.is_local())
            .collect();
        candidates.sort_by_key(|c| c.score.overall);
        candidates
    }
}
