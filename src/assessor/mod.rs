//! Assessor
//!
//! Post-hoc quality grading of a completed exchange. Runs five detectors
//! in a fixed sequence, each possibly appending issues, then folds the
//! issues into a capability score and a confidence. Pure with respect to
//! its input log and idempotent: calling twice on the same log produces
//! the same `Assessment`.

use crate::model::{Assessment, ConversationLog, Issue, IssueType, Severity};
use lazy_static::lazy_static;
use regex::Regex;
use std::collections::HashMap;

lazy_static! {
    static ref TOOL_FAILURE_PATTERNS: Vec<Regex> = vec![
        Regex::new(r"(?i)error:").unwrap(),
        Regex::new(r"(?i)failed to").unwrap(),
        Regex::new(r"(?i)invalid (json|syntax|format)").unwrap(),
        Regex::new(r"(?i)permission denied").unwrap(),
        Regex::new(r"(?i)no such file").unwrap(),
        Regex::new(r"(?i)tool execution failed").unwrap(),
    ];
    static ref TOOL_CALL_SHAPE: Regex = Regex::new(r#"\{[^{}]*"(name|tool|function)"[^{}]*\}"#).unwrap();
    static ref FENCED_JSON_BLOCK: Regex = Regex::new(r"(?s)```json\s*(.*?)\s*```").unwrap();
}

/// Phrases that, repeated, indicate the model has gotten stuck in a loop.
/// Not pinned to any fixed catalog upstream; chosen as representative
/// filler a stuck generation tends to fall back on.
const STUCK_PHRASE_STARTERS: &[&str] = &["i think", "i believe", "let me", "as mentioned", "to summarize"];

fn detect_timeout(duration_ms: u64) -> Option<Issue> {
    if duration_ms > 120_000 {
        Some(Issue { kind: IssueType::Timeout, severity: Severity::High, description: format!("response took {duration_ms}ms"), evidence: None })
    } else if duration_ms > 60_000 {
        Some(Issue { kind: IssueType::Timeout, severity: Severity::Medium, description: format!("response took {duration_ms}ms"), evidence: None })
    } else {
        None
    }
}

fn normalize_sentence(sentence: &str) -> String {
    sentence.trim().to_lowercase()
}

fn split_sentences(response: &str) -> Vec<&str> {
    response.split(['.', '!', '?', '\n']).map(str::trim).filter(|s| !s.is_empty()).collect()
}

fn repeated_sentence(response: &str) -> Option<Issue> {
    let mut counts: HashMap<String, u32> = HashMap::new();
    for sentence in split_sentences(response) {
        let normalized = normalize_sentence(sentence);
        if normalized.len() > 10 {
            *counts.entry(normalized).or_insert(0) += 1;
        }
    }
    counts.into_iter().find(|(_, count)| *count >= 3).map(|(sentence, count)| Issue {
        kind: IssueType::Repetition,
        severity: Severity::High,
        description: format!("sentence repeated {count} times"),
        evidence: Some(sentence),
    })
}

fn trigram_repetition(response: &str) -> Option<Issue> {
    let words: Vec<&str> = response.split_whitespace().collect();
    if words.len() < 3 {
        return None;
    }
    let mut counts: HashMap<(&str, &str, &str), u32> = HashMap::new();
    let mut total = 0u32;
    for window in words.windows(3) {
        *counts.entry((window[0], window[1], window[2])).or_insert(0) += 1;
        total += 1;
    }
    let repeated: u32 = counts.values().filter(|&&c| c > 1).sum();
    let rate = repeated as f32 / total as f32;
    if rate > 0.50 {
        Some(Issue { kind: IssueType::Repetition, severity: Severity::High, description: format!("trigram repetition rate {rate:.2}"), evidence: None })
    } else if rate > 0.30 {
        Some(Issue { kind: IssueType::Repetition, severity: Severity::Medium, description: format!("trigram repetition rate {rate:.2}"), evidence: None })
    } else {
        None
    }
}

fn stuck_phrase_repetition(response: &str) -> Option<Issue> {
    let lower = response.to_lowercase();
    let chars: Vec<char> = lower.chars().collect();
    for start in 0..chars.len() {
        let end = (start + 500).min(chars.len());
        let window: String = chars[start..end].iter().collect();
        for phrase in STUCK_PHRASE_STARTERS {
            if window.matches(phrase).count() >= 3 {
                return Some(Issue {
                    kind: IssueType::Repetition,
                    severity: Severity::High,
                    description: format!("stuck phrase \"{phrase}\" repeated within a 500-char window"),
                    evidence: Some((*phrase).to_string()),
                });
            }
        }
    }
    None
}

/// First match wins: repeated sentence, then trigram rate, then stuck phrases.
fn detect_repetition(response: &str) -> Option<Issue> {
    repeated_sentence(response).or_else(|| trigram_repetition(response)).or_else(|| stuck_phrase_repetition(response))
}

fn detect_tool_failure(response: &str) -> Vec<Issue> {
    let mut issues = Vec::new();
    if let Some(pattern) = TOOL_FAILURE_PATTERNS.iter().find(|re| re.is_match(response)) {
        issues.push(Issue {
            kind: IssueType::ToolFailure,
            severity: Severity::Medium,
            description: "response matches a known tool-failure pattern".to_string(),
            evidence: pattern.find(response).map(|m| m.as_str().to_string()),
        });
    }
    if let Some(m) = TOOL_CALL_SHAPE.find(response) {
        if serde_json::from_str::<serde_json::Value>(m.as_str()).is_err() {
            issues.push(Issue {
                kind: IssueType::ToolFailure,
                severity: Severity::High,
                description: "tool-call-shaped substring failed to parse as JSON".to_string(),
                evidence: Some(m.as_str().to_string()),
            });
        }
    }
    issues
}

fn detect_json_error(response: &str) -> Vec<Issue> {
    let mut issues = Vec::new();
    let trimmed = response.trim();
    if (trimmed.starts_with('{') || trimmed.starts_with('[')) && serde_json::from_str::<serde_json::Value>(trimmed).is_err() {
        issues.push(Issue { kind: IssueType::JsonError, severity: Severity::Medium, description: "response looks like JSON but fails to parse".to_string(), evidence: None });
    }
    if let Some(caps) = FENCED_JSON_BLOCK.captures(response) {
        let body = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
        if serde_json::from_str::<serde_json::Value>(body).is_err() {
            issues.push(Issue {
                kind: IssueType::JsonError,
                severity: Severity::Low,
                description: "fenced json code block fails to parse".to_string(),
                evidence: None,
            });
        }
    }
    issues
}

fn detect_truncation(response: &str, complexity_score: u8) -> Vec<Issue> {
    let mut issues = Vec::new();
    let fence_count = response.matches("```").count();
    if fence_count % 2 == 1 {
        issues.push(Issue { kind: IssueType::Truncation, severity: Severity::Medium, description: "odd number of code fences".to_string(), evidence: None });
    }
    let trimmed_end = response.trim_end();
    let ends_cleanly = trimmed_end.is_empty()
        || matches!(trimmed_end.chars().last(), Some('.') | Some('!') | Some('?') | Some('`') | Some(')') | Some(']') | Some('}') | Some('"') | Some('\'') | Some(':'))
        || response.ends_with('\n');
    if !ends_cleanly {
        issues.push(Issue { kind: IssueType::Truncation, severity: Severity::Medium, description: "response does not end on a sentence or structural boundary".to_string(), evidence: None });
    }
    if complexity_score > 60 && response.len() < 100 {
        issues.push(Issue { kind: IssueType::Truncation, severity: Severity::Low, description: "short response to a high-complexity prompt".to_string(), evidence: None });
    }
    issues
}

fn score_issues(issues: &[Issue]) -> u8 {
    let mut score: i16 = 100;
    for issue in issues {
        score -= match issue.severity {
            Severity::High => 30,
            Severity::Medium => 15,
            Severity::Low => 5,
        };
    }
    score.max(0) as u8
}

fn confidence_for(response_len: usize, issues: &[Issue]) -> f32 {
    let mut confidence: f32 = 0.80;
    if response_len > 500 {
        confidence += 0.10;
    }
    if response_len < 50 {
        confidence -= 0.20;
    }
    let high_count = issues.iter().filter(|i| i.severity == Severity::High).count() as f32;
    confidence += 0.05 * high_count;
    confidence.clamp(0.30, 1.00)
}

/// Grades a completed exchange. Pure and idempotent.
pub fn assess(log: &ConversationLog) -> Assessment {
    let mut issues = Vec::new();
    issues.extend(detect_timeout(log.duration_ms));
    issues.extend(detect_repetition(&log.response));
    issues.extend(detect_tool_failure(&log.response));
    issues.extend(detect_json_error(&log.response));
    issues.extend(detect_truncation(&log.response, log.complexity_score));

    let capability_score = score_issues(&issues);
    let confidence = confidence_for(log.response.len(), &issues);
    Assessment { capability_score, issues, confidence }
}

/// Runs `assess` and writes the resulting issues back into the log.
pub fn assess_and_update(log: &mut ConversationLog) -> Assessment {
    let assessment = assess(log);
    log.issues = Some(assessment.issues.clone());
    assessment
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log(prompt: &str, response: &str, duration_ms: u64, complexity_score: u8) -> ConversationLog {
        ConversationLog { prompt: prompt.to_string(), response: response.to_string(), duration_ms, complexity_score, issues: None }
    }

    #[test]
    fn repeated_sentence_yields_single_high_issue_and_score_70() {
        let response = "I think the answer is correct. I think the answer is correct. I think the answer is correct.";
        let entry = log("what is 2+2", response, 500, 30);
        let assessment = assess(&entry);
        assert_eq!(assessment.issues.len(), 1);
        assert_eq!(assessment.issues[0].kind, IssueType::Repetition);
        assert_eq!(assessment.issues[0].severity, Severity::High);
        assert_eq!(assessment.capability_score, 70);
    }

    #[test]
    fn timeout_over_two_minutes_is_high() {
        let entry = log("p", "a fine response.", 130_000, 10);
        let assessment = assess(&entry);
        assert!(assessment.issues.iter().any(|i| i.kind == IssueType::Timeout && i.severity == Severity::High));
    }

    #[test]
    fn timeout_over_one_minute_is_medium() {
        let entry = log("p", "a fine response.", 70_000, 10);
        let assessment = assess(&entry);
        assert!(assessment.issues.iter().any(|i| i.kind == IssueType::Timeout && i.severity == Severity::Medium));
    }

    #[test]
    fn clean_short_response_has_no_issues_and_full_score() {
        let entry = log("hi", "Hello! How can I help you today?", 200, 10);
        let assessment = assess(&entry);
        assert!(assessment.issues.is_empty());
        assert_eq!(assessment.capability_score, 100);
    }

    #[test]
    fn malformed_json_response_is_medium() {
        let entry = log("give me json", "{\"a\": 1, \"b\":}", 300, 20);
        let assessment = assess(&entry);
        assert!(assessment.issues.iter().any(|i| i.kind == IssueType::JsonError && i.severity == Severity::Medium));
    }

    #[test]
    fn tool_failure_pattern_is_detected() {
        let entry = log("run tool", "Error: failed to execute the requested operation", 300, 20);
        let assessment = assess(&entry);
        assert!(assessment.issues.iter().any(|i| i.kind == IssueType::ToolFailure && i.severity == Severity::Medium));
    }

    #[test]
    fn unbalanced_code_fence_is_truncation_medium() {
        let entry = log("write code", "```rust\nfn main() {}\n", 300, 20);
        let assessment = assess(&entry);
        assert!(assessment.issues.iter().any(|i| i.kind == IssueType::Truncation && i.severity == Severity::Medium));
    }

    #[test]
    fn short_response_to_complex_prompt_is_truncation_low() {
        let entry = log("explain quantum computing in depth", "It's complex.", 300, 80);
        let assessment = assess(&entry);
        assert!(assessment.issues.iter().any(|i| i.kind == IssueType::Truncation && i.severity == Severity::Low));
    }

    #[test]
    fn confidence_rises_for_long_responses() {
        let long_response = "This is a fairly detailed and thorough explanation. ".repeat(20);
        let entry = log("explain", &long_response, 300, 20);
        let assessment = assess(&entry);
        assert!(assessment.confidence >= 0.90);
    }

    #[test]
    fn assess_and_update_writes_issues_back_into_log() {
        let mut entry = log("p", "Error: failed to connect", 300, 10);
        let assessment = assess_and_update(&mut entry);
        assert_eq!(entry.issues.as_ref().unwrap().len(), assessment.issues.len());
    }

    #[test]
    fn assess_is_idempotent() {
        let entry = log("p", "Error: failed to connect", 300, 10);
        let first = assess(&entry);
        let second = assess(&entry);
        assert_eq!(first.capability_score, second.capability_score);
        assert_eq!(first.issues.len(), second.issues.len());
    }
}
