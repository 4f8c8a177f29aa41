//! Knowledge cards produced by the pipeline stages
//!
//! This module provides:
//! - Card types in their fixed pipeline order (fact → interpretation → risk → action)
//! - Typed card content, one shape per card type
//! - Causal links emitted by the interpreter and their acyclicity check

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use petgraph::algo::is_cyclic_directed;
use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Kind of knowledge a card carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CardType {
    Fact,
    Interpretation,
    Risk,
    Action,
}

impl CardType {
    /// The only order in which cards of one task may appear
    pub fn sequence() -> &'static [CardType] {
        &[
            CardType::Fact,
            CardType::Interpretation,
            CardType::Risk,
            CardType::Action,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CardType::Fact => "fact",
            CardType::Interpretation => "interpretation",
            CardType::Risk => "risk",
            CardType::Action => "action",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "fact" => Some(CardType::Fact),
            "interpretation" => Some(CardType::Interpretation),
            "risk" => Some(CardType::Risk),
            "action" => Some(CardType::Action),
            _ => None,
        }
    }
}

/// Objective, quantifiable statement derived from the material
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fact {
    /// Row label or JSON path the fact is about
    pub subject: String,
    pub metric: Option<String>,
    pub planned: Option<f64>,
    pub actual: Option<f64>,
    pub deviation: Option<f64>,
    pub deviation_pct: Option<f64>,
    pub statement: String,
}

impl Fact {
    /// A fact without numbers, usually contributed by the backend
    pub fn qualitative(subject: impl Into<String>, statement: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            metric: None,
            planned: None,
            actual: None,
            deviation: None,
            deviation_pct: None,
            statement: statement.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactSheet {
    pub facts: Vec<Fact>,
    pub headline: String,
}

/// Ranked cause with an estimated share of the outcome.
///
/// `impact_pct` is an estimate clamped to `[0, 100]`; the factors of one
/// interpretation are not renormalized and need not sum to 100.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CausalFactor {
    pub rank: usize,
    pub name: String,
    pub impact_pct: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Interpretation {
    /// Sorted by descending impact, rank 1 first
    pub factors: Vec<CausalFactor>,
    /// Node labels of the causal chain; the last one is the headline
    pub chain: Vec<String>,
    pub narrative: String,
}

impl Interpretation {
    pub fn primary(&self) -> Option<&CausalFactor> {
        self.factors.first()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
        }
    }

    /// Lenient parse of backend wording
    pub fn parse(s: &str) -> Option<Self> {
        let lower = s.trim().to_lowercase();
        match lower.as_str() {
            "high" | "critical" | "severe" | "major" => Some(Severity::High),
            "medium" | "moderate" | "mid" => Some(Severity::Medium),
            "low" | "minor" | "negligible" => Some(Severity::Low),
            _ => None,
        }
    }

    /// One step down, saturating at low
    pub fn lower(&self) -> Self {
        match self {
            Severity::High => Severity::Medium,
            _ => Severity::Low,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskType {
    Schedule,
    Financial,
    Resource,
    Quality,
    Operational,
}

impl RiskType {
    pub fn all() -> &'static [RiskType] {
        &[
            RiskType::Schedule,
            RiskType::Financial,
            RiskType::Resource,
            RiskType::Quality,
            RiskType::Operational,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RiskType::Schedule => "schedule",
            RiskType::Financial => "financial",
            RiskType::Resource => "resource",
            RiskType::Quality => "quality",
            RiskType::Operational => "operational",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        let lower = s.trim().to_lowercase();
        Self::all()
            .iter()
            .copied()
            .find(|t| lower.starts_with(t.as_str()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImpactAxis {
    pub level: Severity,
    pub summary: String,
}

/// Structured impact along the financial and operational axes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImpactEstimate {
    pub financial: ImpactAxis,
    pub operational: ImpactAxis,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub risk_type: RiskType,
    pub severity: Severity,
    pub impact: ImpactEstimate,
    pub rationale: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Period {
    Immediate,
    ShortTerm,
    LongTerm,
}

impl Period {
    pub fn all() -> &'static [Period] {
        &[Period::Immediate, Period::ShortTerm, Period::LongTerm]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Period::Immediate => "immediate",
            Period::ShortTerm => "short_term",
            Period::LongTerm => "long_term",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Period::Immediate => "0-2 weeks",
            Period::ShortTerm => "1-3 months",
            Period::LongTerm => "3+ months",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionItem {
    /// 1 is most urgent
    pub priority: u32,
    pub title: String,
    pub expected_effect: String,
    pub resources: Vec<String>,
    pub period: Period,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelinePhase {
    pub period: Period,
    /// Titles of the actions scheduled in this period, by priority
    pub actions: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionPlan {
    pub actions: Vec<ActionItem>,
    pub timeline: Vec<TimelinePhase>,
}

/// Card body; the variant fixes the card type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CardContent {
    Fact(FactSheet),
    Interpretation(Interpretation),
    Risk(RiskAssessment),
    Action(ActionPlan),
}

impl CardContent {
    pub fn card_type(&self) -> CardType {
        match self {
            CardContent::Fact(_) => CardType::Fact,
            CardContent::Interpretation(_) => CardType::Interpretation,
            CardContent::Risk(_) => CardType::Risk,
            CardContent::Action(_) => CardType::Action,
        }
    }

    /// Plain-text rendering used for embedding and display
    pub fn render(&self) -> String {
        match self {
            CardContent::Fact(sheet) => {
                let mut lines = vec![format!("Headline: {}", sheet.headline)];
                lines.extend(sheet.facts.iter().map(|f| format!("- {}", f.statement)));
                lines.join("\n")
            }
            CardContent::Interpretation(interp) => {
                let mut lines: Vec<String> = interp
                    .factors
                    .iter()
                    .map(|f| format!("{}. {} ({:.0}%)", f.rank, f.name, f.impact_pct))
                    .collect();
                if !interp.chain.is_empty() {
                    lines.push(format!("Chain: {}", interp.chain.join(" -> ")));
                }
                if !interp.narrative.is_empty() {
                    lines.push(interp.narrative.clone());
                }
                lines.join("\n")
            }
            CardContent::Risk(risk) => format!(
                "{} risk, severity {}\nFinancial: {} ({})\nOperational: {} ({})\n{}",
                risk.risk_type.as_str(),
                risk.severity.as_str(),
                risk.impact.financial.summary,
                risk.impact.financial.level.as_str(),
                risk.impact.operational.summary,
                risk.impact.operational.level.as_str(),
                risk.rationale
            ),
            CardContent::Action(plan) => {
                let mut lines: Vec<String> = plan
                    .actions
                    .iter()
                    .map(|a| {
                        format!(
                            "P{} [{}] {}: {}",
                            a.priority,
                            a.period.as_str(),
                            a.title,
                            a.expected_effect
                        )
                    })
                    .collect();
                for phase in &plan.timeline {
                    lines.push(format!(
                        "{} ({}): {}",
                        phase.period.as_str(),
                        phase.period.label(),
                        phase.actions.join(", ")
                    ));
                }
                lines.join("\n")
            }
        }
    }
}

/// Immutable record produced by one stage; only `embedding` is filled in later
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeCard {
    pub card_id: String,
    pub task_id: String,
    pub card_type: CardType,
    pub title: String,
    pub content: CardContent,
    /// Always within [0, 1]
    pub confidence: f64,
    pub created_at: DateTime<Utc>,
    /// Parse problems that lowered the confidence
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub degradations: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
}

impl KnowledgeCard {
    pub fn new(
        task_id: impl Into<String>,
        title: impl Into<String>,
        content: CardContent,
        confidence: f64,
    ) -> Self {
        Self {
            card_id: format!("card-{}", uuid::Uuid::new_v4()),
            task_id: task_id.into(),
            card_type: content.card_type(),
            title: title.into(),
            content,
            confidence: clamp_confidence(confidence),
            created_at: Utc::now(),
            degradations: Vec::new(),
            embedding: None,
        }
    }

    pub fn with_id(mut self, card_id: impl Into<String>) -> Self {
        self.card_id = card_id.into();
        self
    }

    pub fn with_degradations(mut self, degradations: Vec<String>) -> Self {
        self.degradations = degradations;
        self
    }

    pub fn is_degraded(&self) -> bool {
        !self.degradations.is_empty()
    }

    /// Text that gets embedded: title plus rendered content
    pub fn search_text(&self) -> String {
        format!("{}\n\n{}", self.title, self.content.render())
    }

    pub fn facts(&self) -> Option<&FactSheet> {
        match &self.content {
            CardContent::Fact(sheet) => Some(sheet),
            _ => None,
        }
    }

    pub fn interpretation(&self) -> Option<&Interpretation> {
        match &self.content {
            CardContent::Interpretation(interp) => Some(interp),
            _ => None,
        }
    }

    pub fn risk(&self) -> Option<&RiskAssessment> {
        match &self.content {
            CardContent::Risk(risk) => Some(risk),
            _ => None,
        }
    }

    pub fn action_plan(&self) -> Option<&ActionPlan> {
        match &self.content {
            CardContent::Action(plan) => Some(plan),
            _ => None,
        }
    }
}

/// Clamp into [0, 1]; NaN counts as no confidence at all
pub fn clamp_confidence(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

/// Directed edge of the interpreter's causal chain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CausalLink {
    pub task_id: String,
    pub from_card: String,
    pub to_card: String,
    pub from_node: String,
    pub to_node: String,
    pub relation_label: String,
    /// Position in the chain, 0-based
    pub position: usize,
}

/// Reject link sets that mix tasks or contain a cycle
pub fn validate_chain(links: &[CausalLink]) -> Result<()> {
    let Some(first) = links.first() else {
        return Ok(());
    };

    if let Some(stray) = links.iter().find(|l| l.task_id != first.task_id) {
        return Err(Error::InvalidPayload(format!(
            "causal link {} -> {} belongs to task {}, expected {}",
            stray.from_node, stray.to_node, stray.task_id, first.task_id
        )));
    }

    let mut graph: DiGraph<&str, ()> = DiGraph::new();
    let mut indices: HashMap<&str, NodeIndex> = HashMap::new();

    for link in links {
        let from = *indices
            .entry(link.from_node.as_str())
            .or_insert_with(|| graph.add_node(link.from_node.as_str()));
        let to = *indices
            .entry(link.to_node.as_str())
            .or_insert_with(|| graph.add_node(link.to_node.as_str()));
        graph.add_edge(from, to, ());
    }

    if is_cyclic_directed(&graph) {
        return Err(Error::InvalidPayload(format!(
            "causal chain for task {} contains a cycle",
            first.task_id
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn link(from: &str, to: &str, position: usize) -> CausalLink {
        CausalLink {
            task_id: "task-1".to_string(),
            from_card: "card-a".to_string(),
            to_card: "card-a".to_string(),
            from_node: from.to_string(),
            to_node: to.to_string(),
            relation_label: "leads_to".to_string(),
            position,
        }
    }

    #[test]
    fn test_card_type_follows_content() {
        let card = KnowledgeCard::new(
            "task-1",
            "design stage delayed",
            CardContent::Fact(FactSheet {
                facts: vec![],
                headline: "design stage delayed".to_string(),
            }),
            0.9,
        );
        assert_eq!(card.card_type, CardType::Fact);
        assert!(card.card_id.starts_with("card-"));
        assert!(card.embedding.is_none());
    }

    #[test]
    fn test_confidence_is_clamped() {
        let content = CardContent::Action(ActionPlan {
            actions: vec![],
            timeline: vec![],
        });
        assert_eq!(KnowledgeCard::new("t", "a", content.clone(), 1.7).confidence, 1.0);
        assert_eq!(KnowledgeCard::new("t", "a", content.clone(), -0.2).confidence, 0.0);
        assert_eq!(KnowledgeCard::new("t", "a", content, f64::NAN).confidence, 0.0);
    }

    #[test]
    fn test_action_render_lists_timeline() {
        let content = CardContent::Action(ActionPlan {
            actions: vec![ActionItem {
                priority: 1,
                title: "Add a designer".to_string(),
                expected_effect: "design back on track".to_string(),
                resources: vec![],
                period: Period::Immediate,
            }],
            timeline: vec![TimelinePhase {
                period: Period::Immediate,
                actions: vec!["Add a designer".to_string()],
            }],
        });
        let text = content.render();
        assert!(text.starts_with("P1 [immediate] Add a designer: design back on track"));
        assert!(text.ends_with("immediate (0-2 weeks): Add a designer"));
    }

    #[test]
    fn test_content_serializes_with_kind_tag() {
        let content = CardContent::Risk(RiskAssessment {
            risk_type: RiskType::Schedule,
            severity: Severity::High,
            impact: ImpactEstimate {
                financial: ImpactAxis {
                    level: Severity::Medium,
                    summary: "overtime cost".to_string(),
                },
                operational: ImpactAxis {
                    level: Severity::High,
                    summary: "launch slips".to_string(),
                },
            },
            rationale: "primary factor dominates".to_string(),
        });

        let json = serde_json::to_value(&content).unwrap();
        assert_eq!(json["kind"], "risk");
        assert_eq!(json["severity"], "high");

        let back: CardContent = serde_json::from_value(json).unwrap();
        assert_eq!(back.card_type(), CardType::Risk);
    }

    #[test]
    fn test_severity_parse_and_order() {
        assert_eq!(Severity::parse("Critical"), Some(Severity::High));
        assert_eq!(Severity::parse(" moderate "), Some(Severity::Medium));
        assert_eq!(Severity::parse("unknown"), None);
        assert!(Severity::High > Severity::Medium);
        assert_eq!(Severity::High.lower(), Severity::Medium);
        assert_eq!(Severity::Low.lower(), Severity::Low);
    }

    #[test]
    fn test_validate_chain_accepts_path() {
        let links = vec![link("a", "b", 0), link("b", "c", 1)];
        assert!(validate_chain(&links).is_ok());
        assert!(validate_chain(&[]).is_ok());
    }

    #[test]
    fn test_validate_chain_rejects_cycle() {
        let links = vec![link("a", "b", 0), link("b", "c", 1), link("c", "a", 2)];
        assert!(matches!(
            validate_chain(&links),
            Err(Error::InvalidPayload(_))
        ));
    }

    #[test]
    fn test_validate_chain_rejects_mixed_tasks() {
        let mut other = link("b", "c", 1);
        other.task_id = "task-2".to_string();
        let links = vec![link("a", "b", 0), other];
        assert!(validate_chain(&links).is_err());
    }
}
