//! Router
//!
//! Picks a backend for each prompt, dispatches through the Provider Engine
//! with a single smart→fast fallback retry, and writes the graded result to
//! the Outcome Store. Depends on the Provider Engine, the Scorer, and the
//! Outcome Store; nothing depends back on the router, so the feedback loop
//! from Assessor to Outcome Store is an explicit write at the end of
//! `route`, not a callback.

use crate::assessor;
use crate::config::VisionConfig;
use crate::error::{GatewayError, GatewayResult};
use crate::model::{ChatRequest, ChatResponse, ConversationLog, Lane};
use crate::outcome::{OutcomeRecord, OutcomeStore, MIN_SAMPLES};
use crate::provider::{OnToken, Provider};
use crate::scorer::Scorer;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Coarse classification of a request, used to index learning statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskType {
    Coding,
    Reasoning,
    Summarization,
    General,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::Coding => "coding",
            TaskType::Reasoning => "reasoning",
            TaskType::Summarization => "summarization",
            TaskType::General => "general",
        }
    }
}

/// Ordered families of smart-lane trigger substrings. Tested in this order
/// against the lowercased prompt; the first matching family wins.
const SMART_TRIGGER_FAMILIES: &[(&str, &[&str])] = &[
    ("ocr", &["extract text from", "read the text in", "ocr this image", "transcribe this image"]),
    ("code_analysis", &["analyze this code", "review this code", "debug this code", "explain this function", "read the code in this screenshot"]),
    ("terminal", &["run this command", "execute this script", "parse this terminal output", "shell script error"]),
    ("data_extraction", &["extract data from this chart", "extract the table", "parse this spreadsheet", "read this graph"]),
    ("general_analysis", &["analyze this image", "what's in this picture", "describe this diagram", "summarize this document"]),
    ("devops", &["kubernetes manifest", "docker compose file", "ci/cd pipeline", "terraform plan"]),
    ("ui_screenshot", &["what does this screenshot show", "review this ui mockup", "check this design screenshot"]),
];

fn family_task_type(family: &str) -> TaskType {
    match family {
        "code_analysis" | "terminal" => TaskType::Coding,
        "data_extraction" | "general_analysis" => TaskType::Reasoning,
        _ => TaskType::General,
    }
}

/// Classifies a prompt into a lane and the trigger family that produced it
/// (`None` family means no trigger matched — fast lane by default).
pub fn classify(prompt: &str) -> (Lane, Option<&'static str>) {
    let lowered = prompt.to_lowercase();
    for (family, triggers) in SMART_TRIGGER_FAMILIES {
        if triggers.iter().any(|t| lowered.contains(t)) {
            return (Lane::Smart, Some(family));
        }
    }
    (Lane::Fast, None)
}

/// Task-type derivation for outcome-store keys, reusing the same trigger
/// table the lane classifier consults.
pub fn task_type_for(prompt: &str) -> TaskType {
    match classify(prompt) {
        (_, Some(family)) => family_task_type(family),
        (_, None) => TaskType::General,
    }
}

/// A request as handed to the router: the wire-level chat payload plus the
/// routing-relevant metadata the core `ChatRequest` doesn't carry.
pub struct RouteRequest {
    pub chat: ChatRequest,
    pub prompt: String,
    pub has_vision_payload: bool,
    pub vision_payload_bytes: u64,
    /// Explicit lane pin; bypasses trigger classification when set.
    pub lane_pin: Option<Lane>,
}

/// Outcome of a single routed call, paired with the response actually
/// returned (when the call succeeded).
pub struct RouteResult {
    pub response: ChatResponse,
    pub outcome: crate::model::RoutingOutcome,
}

struct Backend {
    provider: String,
    model: String,
}

/// Caches the smart provider's liveness for `health_check_interval_sec`
/// with double-checked locking, so concurrent callers don't thunder the
/// upstream `available()` probe.
struct HealthCache {
    state: RwLock<Option<(Instant, bool)>>,
    interval: Duration,
}

impl HealthCache {
    fn new(interval: Duration) -> Self {
        HealthCache { state: RwLock::new(None), interval }
    }

    async fn get_or_probe(&self, provider: &dyn Provider) -> bool {
        if let Some((checked_at, healthy)) = *self.state.read() {
            if checked_at.elapsed() < self.interval {
                return healthy;
            }
        }
        let mut guard = self.state.write();
        if let Some((checked_at, healthy)) = *guard {
            if checked_at.elapsed() < self.interval {
                return healthy;
            }
        }
        // Hold no lock across the upstream probe: release, probe, then
        // record. A second caller may probe concurrently; the last write
        // wins, which is acceptable for a liveness cache.
        drop(guard);
        let healthy = provider.available().await;
        *self.state.write() = Some((Instant::now(), healthy));
        healthy
    }

    fn force(&self, healthy: bool) {
        *self.state.write() = Some((Instant::now(), healthy));
    }
}

pub struct Router {
    providers: HashMap<String, Arc<dyn Provider>>,
    scorer: Scorer,
    outcomes: Arc<dyn OutcomeStore>,
    fast: Backend,
    smart: Option<Backend>,
    vision: VisionConfig,
    smart_health: HealthCache,
}

impl Router {
    pub fn new(
        providers: HashMap<String, Arc<dyn Provider>>,
        fast_provider: &str,
        fast_model: &str,
        smart: Option<(&str, &str)>,
        vision: VisionConfig,
        outcomes: Arc<dyn OutcomeStore>,
    ) -> Self {
        let interval = Duration::from_secs(vision.health_check_interval_sec);
        Router {
            providers,
            scorer: Scorer::new(),
            outcomes,
            fast: Backend { provider: fast_provider.to_string(), model: fast_model.to_string() },
            smart: smart.map(|(p, m)| Backend { provider: p.to_string(), model: m.to_string() }),
            vision,
            smart_health: HealthCache::new(interval),
        }
    }

    fn validate(&self, req: &RouteRequest) -> GatewayResult<()> {
        if req.has_vision_payload && !self.vision.enabled {
            return Err(GatewayError::VisionDisabled);
        }
        let max_bytes = self.vision.max_image_size_mb * 1024 * 1024;
        if req.has_vision_payload && req.vision_payload_bytes > max_bytes {
            return Err(GatewayError::Validation(format!(
                "vision payload of {} bytes exceeds the {} byte limit",
                req.vision_payload_bytes, max_bytes
            )));
        }
        if req.chat.messages.is_empty() {
            return Err(GatewayError::Validation("request has no messages".to_string()));
        }
        Ok(())
    }

    /// Blends the scorer's prior with the outcome store's empirical success
    /// rate: below `MIN_SAMPLES` the prior alone is used; at or above it,
    /// the empirical rate is weighted to dominate as the sample count grows.
    async fn ranked_score(&self, provider: &str, model: &str, task: &str, prior: f32) -> f32 {
        let (success_rate, samples) = self.outcomes.get_model_stats(provider, model, Some(task)).await;
        if samples < MIN_SAMPLES {
            return prior;
        }
        let weight = (samples as f32 / (samples as f32 + MIN_SAMPLES as f32)).min(0.9);
        prior * (1.0 - weight) + (success_rate as f32) * weight
    }

    /// Learning-informed prior for a candidate model under a task: the
    /// scorer's capability prior, blended with the Outcome Store's
    /// empirical success rate once enough samples exist.
    pub async fn learned_score(&self, provider: &str, model: &str, task: &str) -> f32 {
        let prior = self.scorer.score(provider, model).overall as f32 / 100.0;
        self.ranked_score(provider, model, task, prior).await
    }

    async fn smart_is_available(&self) -> bool {
        match &self.smart {
            None => false,
            Some(backend) => match self.providers.get(&backend.provider) {
                None => false,
                Some(provider) => self.smart_health.get_or_probe(provider.as_ref()).await,
            },
        }
    }

    async fn call(&self, backend: &Backend, mut chat: ChatRequest, on_token: &mut OnToken<'_>, cancel: CancellationToken) -> GatewayResult<ChatResponse> {
        let provider = self.providers.get(&backend.provider).ok_or_else(|| GatewayError::UpstreamUnavailable(backend.provider.clone()))?;
        chat.model = backend.model.clone();
        provider.chat_stream(chat, on_token, cancel).await
    }

    /// Routes one request end to end: classifies, dispatches with a single
    /// smart→fast fallback retry, grades the result, and writes the graded
    /// outcome to the Outcome Store.
    pub async fn route(&self, req: RouteRequest, on_token: &mut OnToken<'_>, cancel: CancellationToken) -> GatewayResult<RouteResult> {
        self.validate(&req)?;

        let (triggered_lane, family) = classify(&req.prompt);
        let task_type = match family {
            Some(f) => family_task_type(f),
            None => TaskType::General,
        };
        let lane_pin = req.lane_pin;
        let forced = lane_pin.is_some();
        let mut chosen_lane = lane_pin.unwrap_or(triggered_lane);

        let mut used_fallback = false;
        let mut reason = match (chosen_lane, family) {
            (Lane::Smart, Some(f)) => format!("smart-lane trigger matched ({f})"),
            (Lane::Smart, None) => "explicit smart-lane pin".to_string(),
            (Lane::Fast, _) => "no smart-lane trigger matched".to_string(),
        };

        if chosen_lane == Lane::Smart && !self.smart_is_available().await {
            chosen_lane = Lane::Fast;
            used_fallback = true;
            reason = "smart provider unavailable, fell back to fast".to_string();
        }

        let start = Instant::now();
        let backend = if chosen_lane == Lane::Smart { self.smart.as_ref().expect("smart chosen implies configured") } else { &self.fast };
        let mut fast_attempted = chosen_lane == Lane::Fast;

        let dispatch = self.call(backend, req.chat.clone(), on_token, cancel.clone()).await;

        let (response, final_lane) = match dispatch {
            Ok(response) => (response, chosen_lane),
            Err(err) if chosen_lane == Lane::Smart && err.is_retryable_for_fallback() && self.vision.fallback_enabled && !fast_attempted => {
                self.smart_health.force(false);
                used_fallback = true;
                reason = format!("smart dispatch failed ({err}), fell back to fast");
                fast_attempted = true;
                let response = self.call(&self.fast, req.chat.clone(), on_token, cancel).await?;
                (response, Lane::Fast)
            }
            Err(err) => return Err(err),
        };

        let latency_ms = start.elapsed().as_millis() as u64;
        let complexity_score = ((req.prompt.len() / 20).min(100)) as u8;
        let log = ConversationLog { prompt: req.prompt.clone(), response: response.content.clone(), duration_ms: latency_ms, complexity_score, issues: None };
        let assessment = assessor::assess(&log);
        let success = assessment.capability_score >= 50;

        let model_used = match final_lane {
            Lane::Smart => self.smart.as_ref().map(|b| b.model.clone()).unwrap_or_default(),
            Lane::Fast => self.fast.model.clone(),
        };
        let provider_used = match final_lane {
            Lane::Smart => self.smart.as_ref().map(|b| b.provider.clone()).unwrap_or_default(),
            Lane::Fast => self.fast.provider.clone(),
        };

        let outcome = crate::model::RoutingOutcome {
            lane: final_lane,
            reason,
            model_selected: model_used.clone(),
            forced,
            constraint: if req.has_vision_payload { Some("vision_required".to_string()) } else { None },
            success,
            score: assessment.capability_score as f32 / 100.0,
            latency_ms,
            used_fallback,
        };

        // routing_lane stays the lane that actually served the request (not a
        // "smart→fast" composite label) so get_lane_stats/get_lane_distribution,
        // which filter on the plain "fast"/"smart" strings, still count it;
        // the fallback itself is captured in routing_reason and used_fallback.
        self.outcomes
            .record_outcome(OutcomeRecord {
                provider: provider_used,
                model: model_used,
                task_type: task_type.as_str().to_string(),
                routing_lane: final_lane.to_string(),
                routing_reason: outcome.reason.clone(),
                routing_forced: outcome.forced,
                routing_constraint: outcome.constraint.clone(),
                success,
                outcome_score: Some(outcome.score as f64),
                duration_ms: latency_ms,
                created_at: 0,
            })
            .await;

        Ok(RouteResult { response, outcome })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ChatResponse, Message, Role};
    use crate::outcome::InMemoryOutcomeStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct StubProvider {
        name: &'static str,
        available: bool,
        fail_first_call: Arc<AtomicBool>,
        response_text: &'static str,
    }

    #[async_trait]
    impl Provider for StubProvider {
        async fn chat(&self, req: ChatRequest, cancel: CancellationToken) -> GatewayResult<ChatResponse> {
            let mut noop = |_: &str| {};
            self.chat_stream(req, &mut noop, cancel).await
        }

        async fn chat_stream(&self, req: ChatRequest, on_token: &mut OnToken<'_>, _cancel: CancellationToken) -> GatewayResult<ChatResponse> {
            if self.fail_first_call.swap(false, Ordering::SeqCst) {
                return Err(GatewayError::UpstreamUnavailable(self.name.to_string()));
            }
            on_token(self.response_text);
            Ok(ChatResponse {
                content: self.response_text.to_string(),
                model: req.model,
                prompt_tokens: 5,
                completion_tokens: 5,
                total_tokens: 10,
                duration_ms: 10,
                finish_reason: "stop".to_string(),
                tool_calls: Vec::new(),
            })
        }

        fn name(&self) -> &str {
            self.name
        }

        async fn available(&self) -> bool {
            self.available
        }
    }

    fn chat_request(prompt: &str) -> ChatRequest {
        ChatRequest {
            model: String::new(),
            system_prompt: None,
            messages: vec![Message { role: Role::User, content: prompt.to_string(), tool_call: None }],
            max_tokens: 100,
            temperature: 0.0,
            stream: true,
        }
    }

    #[test]
    fn code_screenshot_prompt_triggers_smart_lane() {
        let (lane, family) = classify("Read the code in this screenshot");
        assert_eq!(lane, Lane::Smart);
        assert_eq!(family, Some("code_analysis"));
        assert_eq!(family_task_type(family.unwrap()).as_str(), "coding");
    }

    #[test]
    fn plain_prompt_stays_on_fast_lane() {
        let (lane, family) = classify("what's the weather like");
        assert_eq!(lane, Lane::Fast);
        assert_eq!(family, None);
    }

    #[tokio::test]
    async fn smart_failure_falls_back_to_fast_with_used_fallback_true() {
        let mut providers: HashMap<String, Arc<dyn Provider>> = HashMap::new();
        providers.insert(
            "cloud".to_string(),
            Arc::new(StubProvider { name: "cloud", available: true, fail_first_call: Arc::new(AtomicBool::new(true)), response_text: "cloud says hi" }),
        );
        providers.insert(
            "ollama".to_string(),
            Arc::new(StubProvider { name: "ollama", available: true, fail_first_call: Arc::new(AtomicBool::new(false)), response_text: "fast model reply" }),
        );

        let vision = VisionConfig::default();
        let outcomes: Arc<dyn OutcomeStore> = Arc::new(InMemoryOutcomeStore::new());
        let router = Router::new(providers, "ollama", "llama3.2:3b", Some(("cloud", "big-model")), vision, outcomes.clone());

        let route_req = RouteRequest { chat: chat_request("Read the code in this screenshot"), prompt: "Read the code in this screenshot".to_string(), has_vision_payload: false, vision_payload_bytes: 0, lane_pin: None };
        let mut collected = String::new();
        let result = router.route(route_req, &mut |delta: &str| collected.push_str(delta), CancellationToken::new()).await.unwrap();

        assert!(result.outcome.used_fallback);
        assert_eq!(result.outcome.lane, Lane::Fast);
        assert!(result.outcome.success);
        assert_eq!(result.response.content, "fast model reply");

        let recent = outcomes.get_recent_outcomes(1).await;
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].routing_lane, "smart→fast");
        assert!(recent[0].success);
    }

    #[tokio::test]
    async fn health_cache_reuses_result_within_interval() {
        let mut providers: HashMap<String, Arc<dyn Provider>> = HashMap::new();
        providers.insert(
            "cloud".to_string(),
            Arc::new(StubProvider { name: "cloud", available: true, fail_first_call: Arc::new(AtomicBool::new(false)), response_text: "hi" }),
        );
        providers.insert(
            "ollama".to_string(),
            Arc::new(StubProvider { name: "ollama", available: true, fail_first_call: Arc::new(AtomicBool::new(false)), response_text: "hi" }),
        );
        let vision = VisionConfig { health_check_interval_sec: 60, ..VisionConfig::default() };
        let outcomes: Arc<dyn OutcomeStore> = Arc::new(InMemoryOutcomeStore::new());
        let router = Router::new(providers, "ollama", "llama3.2:3b", Some(("cloud", "big-model")), vision, outcomes);

        let first = router.smart_is_available().await;
        let second = router.smart_is_available().await;
        assert_eq!(first, second);
        assert!(first);
    }

    #[tokio::test]
    async fn learned_score_ignores_empirical_rate_below_min_samples() {
        let mut providers: HashMap<String, Arc<dyn Provider>> = HashMap::new();
        providers.insert(
            "ollama".to_string(),
            Arc::new(StubProvider { name: "ollama", available: true, fail_first_call: Arc::new(AtomicBool::new(false)), response_text: "hi" }),
        );
        let outcomes: Arc<dyn OutcomeStore> = Arc::new(InMemoryOutcomeStore::new());
        let router = Router::new(providers, "ollama", "llama3.2:3b", None, VisionConfig::default(), outcomes.clone());

        let prior = router.scorer.score("ollama", "llama3.2:3b").overall as f32 / 100.0;

        // Fewer than MIN_SAMPLES records of total failure; the empirical
        // rate must not move the prior at all yet.
        for _ in 0..(MIN_SAMPLES - 1) {
            outcomes
                .record_outcome(OutcomeRecord {
                    provider: "ollama".to_string(),
                    model: "llama3.2:3b".to_string(),
                    task_type: "general".to_string(),
                    routing_lane: "fast".to_string(),
                    routing_reason: "test".to_string(),
                    routing_forced: false,
                    routing_constraint: None,
                    success: false,
                    outcome_score: Some(0.0),
                    duration_ms: 10,
                    created_at: 0,
                })
                .await;
        }
        let score_below_threshold = router.learned_score("ollama", "llama3.2:3b", "general").await;
        assert_eq!(score_below_threshold, prior);

        // One more failure crosses MIN_SAMPLES; the empirical rate (0.0)
        // must now pull the blended score down from the prior.
        outcomes
            .record_outcome(OutcomeRecord {
                provider: "ollama".to_string(),
                model: "llama3.2:3b".to_string(),
                task_type: "general".to_string(),
                routing_lane: "fast".to_string(),
                routing_reason: "test".to_string(),
                routing_forced: false,
                routing_constraint: None,
                success: false,
                outcome_score: Some(0.0),
                duration_ms: 10,
                created_at: 0,
            })
            .await;
        let score_at_threshold = router.learned_score("ollama", "llama3.2:3b", "general").await;
        assert!(score_at_threshold < prior);
    }
}
