//! Complexity-based backend routing
//!
//! Scores a prompt with a fixed additive heuristic and maps the score to a
//! complexity tier, then the tier to an inference backend. Scoring errors
//! never block the pipeline: they route to the most capable backend.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Phrases marking small talk or lookups; only the first match counts
const SIMPLE_TRIGGERS: &[&str] = &[
    "hello",
    "hi",
    "hey",
    "thanks",
    "thank you",
    "good morning",
    "what is",
    "who is",
    "define",
];

/// Each distinct keyword adds to the score
const COMPLEX_KEYWORDS: &[&str] = &[
    "analyze",
    "analyse",
    "analysis",
    "compare",
    "evaluate",
    "explain why",
    "root cause",
    "optimize",
    "strategy",
    "forecast",
    "predict",
    "assess",
    "correlation",
    "trade off",
];

const TECHNICAL_TERMS: &[&str] = &[
    "algorithm",
    "api",
    "bandwidth",
    "cache",
    "compiler",
    "concurrency",
    "database",
    "deployment",
    "encryption",
    "kubernetes",
    "latency",
    "machine learning",
    "microservice",
    "neural network",
    "pipeline",
    "protocol",
    "regression",
    "schema",
    "throughput",
    "variance",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComplexityTier {
    Simple,
    Medium,
    Complex,
}

impl ComplexityTier {
    pub fn from_score(score: u32) -> Self {
        if score < 30 {
            ComplexityTier::Simple
        } else if score < 60 {
            ComplexityTier::Medium
        } else {
            ComplexityTier::Complex
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ComplexityTier::Simple => "simple",
            ComplexityTier::Medium => "medium",
            ComplexityTier::Complex => "complex",
        }
    }

    /// Fixed one-to-one tier to backend table
    pub fn backend(&self) -> ModelBackend {
        match self {
            ComplexityTier::Simple => ModelBackend::Compact,
            ComplexityTier::Medium => ModelBackend::Balanced,
            ComplexityTier::Complex => ModelBackend::Flagship,
        }
    }
}

/// Inference backend capability class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelBackend {
    Compact,
    Balanced,
    Flagship,
}

impl ModelBackend {
    /// The highest-capability backend, used as the routing fail-safe
    pub fn most_capable() -> Self {
        ModelBackend::Flagship
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ModelBackend::Compact => "compact",
            ModelBackend::Balanced => "balanced",
            ModelBackend::Flagship => "flagship",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RouteDecision {
    /// None when scoring failed and the fail-safe was used
    pub score: Option<u32>,
    pub tier: ComplexityTier,
    pub backend: ModelBackend,
    pub fallback: bool,
}

#[derive(Debug, Clone)]
pub struct ModelRouter {
    max_input_chars: usize,
}

impl Default for ModelRouter {
    fn default() -> Self {
        Self::new(8192)
    }
}

impl ModelRouter {
    pub fn new(max_input_chars: usize) -> Self {
        Self { max_input_chars }
    }

    /// Complexity score in [0, 100]
    pub fn score(&self, text: &str) -> Result<u32> {
        let length = text.chars().count();
        if length > self.max_input_chars {
            return Err(Error::InvalidPayload(format!(
                "router input of {} chars exceeds limit of {}",
                length, self.max_input_chars
            )));
        }

        let normalized = normalize(text);
        let mut score: i32 = 0;

        score += match length {
            n if n < 20 => 5,
            n if n < 50 => 10,
            _ => 25,
        };

        if SIMPLE_TRIGGERS.iter().any(|p| contains_phrase(&normalized, p)) {
            score -= 5;
        }

        let complex_hits = COMPLEX_KEYWORDS
            .iter()
            .filter(|k| contains_phrase(&normalized, k))
            .count() as i32;
        score += 10 * complex_hits;

        let question_marks = text.chars().filter(|c| *c == '?' || *c == '？').count();
        score += match question_marks {
            0 => 10,
            1 => 5,
            _ => 15,
        };

        if has_parenthetical(text) {
            score += 5;
        }

        let technical_hits = TECHNICAL_TERMS
            .iter()
            .filter(|t| contains_phrase(&normalized, t))
            .count();
        if technical_hits >= 2 {
            score += 20;
        }

        Ok(score.clamp(0, 100) as u32)
    }

    /// Pick a backend for `text`; falls back to the most capable one on error
    pub fn route(&self, text: &str) -> RouteDecision {
        match self.score(text) {
            Ok(score) => {
                let tier = ComplexityTier::from_score(score);
                debug!("Routed prompt (score {}) to {} tier", score, tier.as_str());
                RouteDecision {
                    score: Some(score),
                    tier,
                    backend: tier.backend(),
                    fallback: false,
                }
            }
            Err(e) => {
                warn!("Routing failed, using most capable backend: {}", e);
                RouteDecision {
                    score: None,
                    tier: ComplexityTier::Complex,
                    backend: ModelBackend::most_capable(),
                    fallback: true,
                }
            }
        }
    }
}

/// Lowercase words joined by single spaces, padded for whole-phrase matching
fn normalize(text: &str) -> String {
    let words: Vec<String> = text
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(|w| w.to_string())
        .collect();
    format!(" {} ", words.join(" "))
}

fn contains_phrase(normalized: &str, phrase: &str) -> bool {
    normalized.contains(&format!(" {} ", phrase))
}

fn has_parenthetical(text: &str) -> bool {
    let Some(open) = text.find('(') else {
        return false;
    };
    text[open + 1..]
        .find(')')
        .is_some_and(|close| !text[open + 1..open + 1 + close].trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_greeting_routes_simple() {
        let router = ModelRouter::default();
        // length +5, trigger -5, no question mark +10
        assert_eq!(router.score("hello there").unwrap(), 10);
        let decision = router.route("hello there");
        assert_eq!(decision.tier, ComplexityTier::Simple);
        assert_eq!(decision.backend, ModelBackend::Compact);
        assert!(!decision.fallback);
    }

    #[test]
    fn test_technical_analysis_routes_complex() {
        let router = ModelRouter::default();
        let text = "Analyze how the database cache affects api latency during peak traffic hours";
        // length +25, analyze +10, no question mark +10, technical terms +20
        assert_eq!(router.score(text).unwrap(), 65);
        let decision = router.route(text);
        assert_eq!(decision.tier, ComplexityTier::Complex);
        assert_eq!(decision.backend, ModelBackend::most_capable());
    }

    #[test]
    fn test_simple_trigger_counts_once() {
        let router = ModelRouter::default();
        // +5 length, -5 once despite two triggers, +10 no question mark
        assert_eq!(router.score("hello, thanks").unwrap(), 10);
    }

    #[test]
    fn test_question_marks_and_parenthetical() {
        let router = ModelRouter::default();
        // +10 length, +5 one question mark
        assert_eq!(router.score("Where did the schedule go?").unwrap(), 15);
        // +10 length, +15 two question marks, +5 parenthetical
        assert_eq!(router.score("Why (really)? And how??").unwrap(), 30);
        // +5 length, +15 question marks; empty parentheses do not count
        assert_eq!(router.score("Why ()? And how??").unwrap(), 20);
    }

    #[test]
    fn test_score_is_clamped() {
        let router = ModelRouter::default();
        let text = "Analyze, compare, evaluate and forecast (with root cause analysis) the \
                    database latency, cache throughput and kubernetes deployment strategy \
                    to optimize and assess the regression?? predict the correlation?";
        assert_eq!(router.score(text).unwrap(), 100);
    }

    #[test]
    fn test_routing_is_pure() {
        let router = ModelRouter::default();
        let text = "Compare the two vendors (pricing only)?";
        assert_eq!(router.route(text), router.route(text));
    }

    #[test]
    fn test_scoring_error_falls_back_to_flagship() {
        let router = ModelRouter::new(10);
        let decision = router.route("this text is longer than ten characters");
        assert!(decision.fallback);
        assert_eq!(decision.score, None);
        assert_eq!(decision.backend, ModelBackend::Flagship);
    }

    #[test]
    fn test_phrase_matching_uses_whole_words() {
        let router = ModelRouter::default();
        // "this" must not trigger "hi"; +5 length, +10 no question mark
        assert_eq!(router.score("this one").unwrap(), 15);
    }
}
