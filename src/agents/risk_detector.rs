//! Stage 4: risk type, severity and a two-axis impact estimate

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::info;

use super::parse;
use super::{call_backend, run_skill, StageAgent, StageInput};
use crate::card::{
    CardContent, FactSheet, ImpactAxis, ImpactEstimate, Interpretation, KnowledgeCard,
    RiskAssessment, RiskType, Severity,
};
use crate::context::AppContext;
use crate::error::{Error, Result};
use crate::hub::{Stage, StagePayload};

fn keywords(risk_type: RiskType) -> &'static [&'static str] {
    match risk_type {
        RiskType::Schedule => &[
            "delay", "delayed", "late", "schedule", "slip", "slipped", "deadline", "behind",
            "overdue", "timeline",
        ],
        RiskType::Financial => &[
            "cost", "costs", "budget", "overrun", "spend", "spending", "revenue", "price",
            "expense", "financial", "cash",
        ],
        RiskType::Resource => &[
            "staff", "staffing", "shortage", "resource", "resources", "headcount", "capacity",
            "team", "hiring", "people",
        ],
        RiskType::Quality => &[
            "defect", "defects", "bug", "bugs", "quality", "error", "errors", "rework", "failure",
        ],
        RiskType::Operational => &[
            "process", "operation", "operations", "supply", "outage", "downtime", "vendor",
            "logistics", "tool", "tools",
        ],
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskClass {
    pub risk_type: RiskType,
    /// Severity implied by the numbers alone
    pub rule_severity: Severity,
}

/// Skill: keyword risk type plus the numeric severity rule
pub fn classify_risk(args: Value) -> Result<Value> {
    let text = args
        .get("text")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::InvalidPayload("classify_risk needs a text argument".into()))?;
    let primary_impact = args.get("primary_impact").and_then(Value::as_f64);
    let max_deviation_pct = args.get("max_deviation_pct").and_then(Value::as_f64);

    Ok(serde_json::to_value(RiskClass {
        risk_type: risk_type_of(text),
        rule_severity: rule_severity(primary_impact.or(max_deviation_pct)),
    })?)
}

/// Type with the most keyword hits; ties keep the listed order
pub fn risk_type_of(text: &str) -> RiskType {
    let lower = text.to_lowercase();
    let words: Vec<&str> = lower
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect();

    let mut best = (RiskType::Operational, 0usize);
    for &risk_type in RiskType::all() {
        let hits = words.iter().filter(|w| keywords(risk_type).contains(*w)).count();
        if hits > best.1 {
            best = (risk_type, hits);
        }
    }
    best.0
}

/// `>= 60` high, `>= 30` medium, otherwise low
pub fn rule_severity(value: Option<f64>) -> Severity {
    match value.map(f64::abs) {
        Some(v) if v >= 60.0 => Severity::High,
        Some(v) if v >= 30.0 => Severity::Medium,
        _ => Severity::Low,
    }
}

fn max_deviation_pct(sheet: &FactSheet) -> Option<f64> {
    sheet
        .facts
        .iter()
        .filter_map(|f| f.deviation_pct)
        .filter(|v| *v > 0.0)
        .fold(None, |acc: Option<f64>, v| Some(acc.map_or(v, |a| a.max(v))))
}

/// Axis from a `LABEL: <level> - <summary>` line, or a default derived from `fallback`
fn impact_axis(reply: &str, label: &str, fallback: Severity, default_summary: String) -> (ImpactAxis, bool) {
    match parse::labeled_value(reply, label) {
        Some(value) => {
            let level = value
                .split(|c: char| !c.is_alphanumeric())
                .find_map(Severity::parse)
                .unwrap_or(fallback);
            (ImpactAxis { level, summary: value }, true)
        }
        None => (
            ImpactAxis {
                level: fallback,
                summary: default_summary,
            },
            false,
        ),
    }
}

pub struct RiskDetector {
    ctx: Arc<AppContext>,
}

impl RiskDetector {
    pub fn new(ctx: Arc<AppContext>) -> Self {
        Self { ctx }
    }

    fn build_prompt(&self, input: &StageInput, interp: &Interpretation, headline: &str) -> String {
        let factors = interp
            .factors
            .iter()
            .map(|f| format!("{}. {} - {:.0}%", f.rank, f.name, f.impact_pct))
            .collect::<Vec<_>>()
            .join("\n");

        format!(
            r#"[STAGE:risk_detector] Risk Assessment

Task: {}
Conclusion: {}
Causal chain: {}

Causes:
{}

Assess the resulting risk. Output these lines:
RISK_TYPE: schedule | financial | resource | quality | operational
SEVERITY: low | medium | high
FINANCIAL: <level> - <expected financial impact>
OPERATIONAL: <level> - <expected operational impact>
RATIONALE: <one sentence>"#,
            input.description,
            headline,
            interp.chain.join(" -> "),
            factors
        )
    }
}

#[async_trait]
impl StageAgent for RiskDetector {
    fn stage(&self) -> Stage {
        Stage::RiskDetector
    }

    async fn run(&self, task_id: &str, input: &StageInput) -> Result<StagePayload> {
        let (_, sheet) = input.require_facts()?;
        let (_, interp) = input.require_interpretation()?;
        let reply = call_backend(
            &self.ctx,
            self.stage(),
            &self.build_prompt(input, interp, &sheet.headline),
        )
        .await?;

        let mut degradations = Vec::new();
        let primary_impact = interp.primary().map(|f| f.impact_pct);
        let evidence = format!(
            "{}\n{}\n{}",
            sheet.headline,
            interp.chain.join(" "),
            interp
                .factors
                .iter()
                .map(|f| f.name.as_str())
                .collect::<Vec<_>>()
                .join(" ")
        );

        let class = match run_skill::<RiskClass>(
            &self.ctx,
            "classify_risk",
            json!({
                "text": evidence,
                "primary_impact": primary_impact,
                "max_deviation_pct": max_deviation_pct(sheet),
            }),
            classify_risk,
        )
        .await
        {
            Ok(class) => class,
            Err(e) => {
                degradations.push(format!("risk classification failed: {}", e.summary()));
                RiskClass {
                    risk_type: risk_type_of(&evidence),
                    rule_severity: rule_severity(primary_impact.or(max_deviation_pct(sheet))),
                }
            }
        };

        let risk_type = parse::labeled_value(&reply, "RISK_TYPE")
            .and_then(|v| RiskType::parse(&v))
            .unwrap_or(class.risk_type);

        let stated = parse::labeled_value(&reply, "SEVERITY").and_then(|v| {
            v.split(|c: char| !c.is_alphanumeric())
                .find_map(Severity::parse)
        });
        if stated.is_none() {
            degradations.push("no severity stated".to_string());
        }
        let severity = stated.map_or(class.rule_severity, |s| s.max(class.rule_severity));

        let (financial_fallback, operational_fallback) = match risk_type {
            RiskType::Financial => (severity, severity.lower()),
            _ => (severity.lower(), severity),
        };
        let (financial, has_financial) = impact_axis(
            &reply,
            "FINANCIAL",
            financial_fallback,
            format!("{} exposure from {}", financial_fallback.as_str(), sheet.headline),
        );
        let (operational, has_operational) = impact_axis(
            &reply,
            "OPERATIONAL",
            operational_fallback,
            format!("{} disruption from {}", operational_fallback.as_str(), sheet.headline),
        );
        if !has_financial || !has_operational {
            degradations.push("impact estimate incomplete".to_string());
        }

        let rationale = parse::labeled_value(&reply, "RATIONALE").unwrap_or_else(|| {
            match interp.primary() {
                Some(primary) => format!(
                    "{} ({:.0}% estimated impact) puts {} at risk",
                    primary.name, primary.impact_pct, sheet.headline
                ),
                None => format!("{} without an identified cause", sheet.headline),
            }
        });

        let confidence = self.ctx.config.confidence.score(degradations.len());
        info!(
            "Task {}: {} risk, severity {}",
            task_id,
            risk_type.as_str(),
            severity.as_str()
        );

        let card = KnowledgeCard::new(
            task_id,
            format!("{} risk ({})", risk_type.as_str(), severity.as_str()),
            CardContent::Risk(RiskAssessment {
                risk_type,
                severity,
                impact: ImpactEstimate {
                    financial,
                    operational,
                },
                rationale,
            }),
            confidence,
        )
        .with_degradations(degradations);

        Ok(StagePayload::Card(card))
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::context;
    use super::*;
    use crate::card::{CausalFactor, Fact};
    use tempfile::TempDir;

    fn input(primary_impact: f64) -> StageInput {
        let mut input = StageInput::new("task-1", "analyze slip", "raw");
        input.facts = Some(KnowledgeCard::new(
            "task-1",
            "design stage delayed",
            CardContent::Fact(FactSheet {
                facts: vec![Fact::qualitative("observation", "design slipped")],
                headline: "design stage delayed".to_string(),
            }),
            0.9,
        ));
        input.interpretation = Some(KnowledgeCard::new(
            "task-1",
            "Causes of design stage delayed",
            CardContent::Interpretation(Interpretation {
                factors: vec![CausalFactor {
                    rank: 1,
                    name: "Resource shortage in design team".to_string(),
                    impact_pct: primary_impact,
                }],
                chain: vec![
                    "Resource shortage in design team".to_string(),
                    "design stage delayed".to_string(),
                ],
                narrative: String::new(),
            }),
            0.9,
        ));
        input
    }

    #[test]
    fn test_rule_severity_thresholds() {
        assert_eq!(rule_severity(Some(70.0)), Severity::High);
        assert_eq!(rule_severity(Some(60.0)), Severity::High);
        assert_eq!(rule_severity(Some(30.0)), Severity::Medium);
        assert_eq!(rule_severity(Some(29.9)), Severity::Low);
        assert_eq!(rule_severity(None), Severity::Low);
    }

    #[test]
    fn test_risk_type_keywords() {
        assert_eq!(risk_type_of("budget overrun on licenses"), RiskType::Financial);
        assert_eq!(risk_type_of("the release slipped past the deadline"), RiskType::Schedule);
        assert_eq!(risk_type_of("nothing relevant"), RiskType::Operational);
    }

    #[tokio::test]
    async fn test_backend_cannot_lower_rule_severity() {
        let tmp = TempDir::new().unwrap();
        let reply = "RISK_TYPE: schedule\nSEVERITY: low\n\
                     FINANCIAL: medium - overtime costs\nOPERATIONAL: high - release at risk\n\
                     RATIONALE: design gates the build";
        let ctx = context(tmp.path(), reply).await;
        let agent = RiskDetector::new(ctx);

        let StagePayload::Card(card) = agent.run("task-1", &input(70.0)).await.unwrap() else {
            panic!("expected a card");
        };
        let risk = card.risk().unwrap();
        assert_eq!(risk.severity, Severity::High);
        assert_eq!(risk.risk_type, RiskType::Schedule);
        assert_eq!(risk.impact.financial.level, Severity::Medium);
        assert_eq!(risk.impact.operational.summary, "high - release at risk");
        assert!(!card.is_degraded());
    }

    #[tokio::test]
    async fn test_backend_can_raise_severity() {
        let tmp = TempDir::new().unwrap();
        let ctx = context(tmp.path(), "SEVERITY: high").await;
        let agent = RiskDetector::new(ctx);

        let StagePayload::Card(card) = agent.run("task-1", &input(10.0)).await.unwrap() else {
            panic!("expected a card");
        };
        let risk = card.risk().unwrap();
        assert_eq!(risk.severity, Severity::High);
        assert_eq!(card.degradations, vec!["impact estimate incomplete"]);
    }

    #[tokio::test]
    async fn test_empty_reply_uses_rules() {
        let tmp = TempDir::new().unwrap();
        let ctx = context(tmp.path(), "").await;
        let agent = RiskDetector::new(ctx);

        let StagePayload::Card(card) = agent.run("task-1", &input(45.0)).await.unwrap() else {
            panic!("expected a card");
        };
        let risk = card.risk().unwrap();
        assert_eq!(risk.severity, Severity::Medium);
        assert_eq!(risk.impact.operational.level, risk.severity);
        assert_eq!(card.degradations.len(), 2);
    }
}
