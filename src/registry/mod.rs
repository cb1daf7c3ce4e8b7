//! Capability Registry
//!
//! Static `(provider, model) -> ModelCapability` lookup over an embedded
//! manifest, with alias and longest-prefix resolution for dated/suffixed
//! model names. Loaded once at process start and immutable thereafter —
//! no internal locking is needed.

use crate::model::{CapabilityFlags, ModelCapability, ModelTier, Pricing, ScoreSource, UnifiedCapabilityScore};
use lazy_static::lazy_static;
use serde::Deserialize;
use std::collections::HashMap;

const MANIFEST_JSON: &str = include_str!("manifest.json");

#[derive(Debug, Deserialize)]
struct ManifestScore {
    overall: u8,
    reasoning: u8,
    coding: u8,
    instruction_following: u8,
    speed: u8,
}

#[derive(Debug, Deserialize)]
struct ManifestFlags {
    vision: bool,
    function_calling: bool,
    structured_json: bool,
    streaming: bool,
    system_prompt: bool,
}

#[derive(Debug, Deserialize)]
struct ManifestPricing {
    input_per_1m: f64,
    output_per_1m: f64,
}

#[derive(Debug, Deserialize)]
struct ManifestEntry {
    model: String,
    display_name: String,
    tier: String,
    score: ManifestScore,
    capabilities: ManifestFlags,
    pricing: Option<ManifestPricing>,
    context_window: u32,
    #[serde(default)]
    aliases: Vec<String>,
}

fn tier_from_str(s: &str) -> ModelTier {
    match s {
        "small" => ModelTier::Small,
        "medium" => ModelTier::Medium,
        "large" => ModelTier::Large,
        "xl" => ModelTier::Xl,
        _ => ModelTier::Frontier,
    }
}

fn entry_to_capability(provider: &str, e: ManifestEntry) -> ModelCapability {
    let score = UnifiedCapabilityScore {
        overall: e.score.overall,
        reasoning: e.score.reasoning,
        coding: e.score.coding,
        instruction_following: e.score.instruction_following,
        speed: e.score.speed,
        confidence: 0.95,
        source: ScoreSource::Registry,
    };
    ModelCapability {
        provider: provider.to_string(),
        model: e.model.to_lowercase(),
        display_name: e.display_name,
        tier: tier_from_str(&e.tier),
        score,
        flags: CapabilityFlags {
            vision: e.capabilities.vision,
            function_calling: e.capabilities.function_calling,
            structured_json: e.capabilities.structured_json,
            streaming: e.capabilities.streaming,
            system_prompt: e.capabilities.system_prompt,
        },
        pricing: e.pricing.map(|p| Pricing {
            input_per_1m: p.input_per_1m,
            output_per_1m: p.output_per_1m,
        }),
        context_window: e.context_window,
        aliases: e.aliases.into_iter().map(|a| a.to_lowercase()).collect(),
    }
}

/// Ordered provider-prefix table used by `detect_provider` and, transitively,
/// by the scorer's tier-baseline lookup.
const PROVIDER_PATTERNS: &[(&str, &[&str])] = &[
    ("anthropic", &["claude"]),
    ("openai", &["gpt-", "o1", "davinci", "curie"]),
    ("gemini", &["gemini", "palm"]),
    ("grok", &["grok"]),
    ("mistral", &["mistral-", "codestral", "open-mistral", "open-mixtral"]),
    ("ollama", &["llama", "qwen", "phi", "gemma", "deepseek", "mixtral", "starcoder", "granite"]),
];

/// Rule-based provider classifier.
///
/// Explicit `"provider/model"` prefixes win outright; otherwise an ordered
/// substring table is consulted; `:` (ollama's tag separator) is the last
/// resort before giving up.
pub fn detect_provider(model_id: &str) -> String {
    let lower = model_id.to_lowercase();
    if let Some((p, _)) = lower.split_once('/') {
        if !p.is_empty() {
            return p.to_string();
        }
    }
    for (provider, patterns) in PROVIDER_PATTERNS {
        for pat in *patterns {
            if lower.starts_with(pat) || lower.contains(pat) {
                return provider.to_string();
            }
        }
    }
    if lower.contains(':') {
        return "ollama".to_string();
    }
    "unknown".to_string()
}

struct RegistryData {
    /// keyed by lowercase "provider/model"
    canonical: HashMap<String, ModelCapability>,
    /// lowercase alias -> lowercase "provider/model"
    aliases: HashMap<String, String>,
}

fn build_registry() -> RegistryData {
    let mut canonical = HashMap::new();
    let mut aliases = HashMap::new();

    let raw: HashMap<String, Vec<ManifestEntry>> = match serde_json::from_str(MANIFEST_JSON) {
        Ok(m) => m,
        Err(err) => {
            tracing::warn!(error = %err, "failed to parse capability manifest; starting with empty registry");
            return RegistryData { canonical, aliases };
        }
    };

    for (provider, entries) in raw {
        for entry in entries {
            let cap = entry_to_capability(&provider, entry);
            let id = format!("{}/{}", provider.to_lowercase(), cap.model);
            for alias in &cap.aliases {
                aliases.insert(alias.clone(), id.clone());
            }
            canonical.insert(id, cap);
        }
    }

    RegistryData { canonical, aliases }
}

lazy_static! {
    static ref REGISTRY: RegistryData = build_registry();
}

/// Static capability lookup over the embedded manifest.
///
/// Zero-sized: all state lives in the process-wide `lazy_static` so this can
/// be constructed freely by callers (router, scorer) without sharing a
/// handle.
#[derive(Debug, Default, Clone, Copy)]
pub struct Registry;

impl Registry {
    pub fn new() -> Registry {
        Registry
    }

    /// Case-insensitive lookup: direct id, then alias table, then
    /// longest-prefix match among that provider's models.
    pub fn get(&self, provider: &str, model: &str) -> Option<ModelCapability> {
        let provider = provider.to_lowercase();
        let model = model.to_lowercase();
        let id = format!("{}/{}", provider, model);

        if let Some(cap) = REGISTRY.canonical.get(&id) {
            return Some(cap.clone());
        }
        if let Some(canonical_id) = REGISTRY.aliases.get(&model) {
            if let Some(cap) = REGISTRY.canonical.get(canonical_id) {
                if cap.provider == provider {
                    return Some(cap.clone());
                }
            }
        }
        self.longest_prefix_match(&provider, &model)
    }

    /// Resolves ties by picking the canonical model whose full name is a
    /// prefix of the query; if several qualify, the lexicographically
    /// smallest, with a warning logged.
    fn longest_prefix_match(&self, provider: &str, model: &str) -> Option<ModelCapability> {
        let mut candidates: Vec<&ModelCapability> = REGISTRY
            .canonical
            .values()
            .filter(|c| c.provider == provider && model.starts_with(c.model.as_str()))
            .collect();

        if candidates.is_empty() {
            return None;
        }
        candidates.sort_by(|a, b| b.model.len().cmp(&a.model.len()).then(a.model.cmp(&b.model)));
        if candidates.len() > 1 && candidates[0].model.len() == candidates[1].model.len() {
            tracing::warn!(
                provider,
                model,
                candidate_a = %candidates[0].model,
                candidate_b = %candidates[1].model,
                "ambiguous prefix match in capability registry; picking lexicographically smallest"
            );
        }
        Some(candidates[0].clone())
    }

    /// `id` is `"provider/model"`, case-insensitive.
    pub fn get_by_id(&self, id: &str) -> Option<ModelCapability> {
        let (provider, model) = id.split_once('/')?;
        self.get(provider, model)
    }

    pub fn list(&self, provider: Option<&str>) -> Vec<ModelCapability> {
        REGISTRY
            .canonical
            .values()
            .filter(|c| provider.map(|p| c.provider == p.to_lowercase()).unwrap_or(true))
            .cloned()
            .collect()
    }

    pub fn list_by_tier(&self, tier: ModelTier) -> Vec<ModelCapability> {
        REGISTRY.canonical.values().filter(|c| c.tier == tier).cloned().collect()
    }

    pub fn detect_provider(&self, model_id: &str) -> String {
        detect_provider(model_id)
    }
}
