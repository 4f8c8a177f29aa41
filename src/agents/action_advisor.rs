//! Stage 5: prioritized actions grouped into a timeline

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::info;

use super::parse;
use super::{call_backend, run_skill, StageAgent, StageInput};
use crate::card::{
    ActionItem, ActionPlan, CardContent, KnowledgeCard, Period, RiskAssessment, RiskType,
    TimelinePhase,
};
use crate::context::AppContext;
use crate::error::Result;
use crate::hub::{Stage, StagePayload};

const IMMEDIATE_WORDS: &[&str] = &["immediate", "immediately", "now", "today", "this week", "urgent"];
const SHORT_TERM_WORDS: &[&str] = &["short term", "short-term", "next month", "within weeks", "next sprint"];
const LONG_TERM_WORDS: &[&str] = &["long term", "long-term", "next quarter", "next year", "ongoing"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Timeline {
    pub timeline: Vec<TimelinePhase>,
}

/// Skill: group actions into periods, each period ordered by priority
pub fn plan_timeline(args: Value) -> Result<Value> {
    let actions: Vec<ActionItem> =
        serde_json::from_value(args.get("actions").cloned().unwrap_or_else(|| json!([])))?;
    Ok(serde_json::to_value(Timeline {
        timeline: timeline(&actions),
    })?)
}

pub fn timeline(actions: &[ActionItem]) -> Vec<TimelinePhase> {
    Period::all()
        .iter()
        .filter_map(|&period| {
            let mut scheduled: Vec<&ActionItem> =
                actions.iter().filter(|a| a.period == period).collect();
            if scheduled.is_empty() {
                return None;
            }
            scheduled.sort_by_key(|a| a.priority);
            Some(TimelinePhase {
                period,
                actions: scheduled.iter().map(|a| a.title.clone()).collect(),
            })
        })
        .collect()
}

/// Explicit period wording, else 1 → immediate, 2-3 → short term, rest → long term
pub fn period_for(text: &str, priority: u32) -> Period {
    let lower = text.to_lowercase();
    let has = |words: &[&str]| {
        words.iter().any(|w| {
            if w.contains(' ') || w.contains('-') {
                lower.contains(w)
            } else {
                parse::mentions(&lower, w)
            }
        })
    };

    if has(IMMEDIATE_WORDS) {
        Period::Immediate
    } else if has(SHORT_TERM_WORDS) {
        Period::ShortTerm
    } else if has(LONG_TERM_WORDS) {
        Period::LongTerm
    } else {
        match priority {
            0 | 1 => Period::Immediate,
            2 | 3 => Period::ShortTerm,
            _ => Period::LongTerm,
        }
    }
}

/// `1. title | expected effect | resource, resource` lines
pub fn parse_actions(reply: &str) -> Vec<ActionItem> {
    let mut actions: Vec<ActionItem> = Vec::new();

    for line in reply.lines() {
        let Some((number, body)) = parse::list_item(line) else {
            continue;
        };
        let mut parts = body.split('|').map(str::trim);
        let title = parts.next().unwrap_or_default().trim_end_matches('.').to_string();
        if title.is_empty() || actions.iter().any(|a| a.title.eq_ignore_ascii_case(&title)) {
            continue;
        }
        let expected_effect = parts.next().unwrap_or_default().to_string();
        let resources = parts
            .next()
            .map(|r| {
                r.split([',', ';'])
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let priority = number.unwrap_or(actions.len() as u32 + 1);
        actions.push(ActionItem {
            priority,
            period: period_for(body, priority),
            title,
            expected_effect,
            resources,
        });
    }

    actions.sort_by_key(|a| a.priority);
    actions
}

/// Standard responses per risk type, used when the backend proposes nothing
pub fn playbook(risk: &RiskAssessment) -> Vec<ActionItem> {
    let entries: [(&str, &str, &str); 3] = match risk.risk_type {
        RiskType::Schedule => [
            ("Re-baseline the schedule around the delayed stage", "Realistic completion dates", "project manager"),
            ("Add capacity to the critical path", "Recover part of the slip", "team leads, budget"),
            ("Introduce weekly milestone reviews", "Earlier detection of slips", "PMO"),
        ],
        RiskType::Financial => [
            ("Freeze non-essential spending", "Stop further overrun", "finance"),
            ("Re-forecast the budget", "Accurate cost outlook", "finance, project manager"),
            ("Renegotiate major contracts", "Lower run-rate costs", "procurement"),
        ],
        RiskType::Resource => [
            ("Reassign staff to the understaffed area", "Relieve the bottleneck", "team leads"),
            ("Open backfill or contractor requisitions", "Restore planned capacity", "HR, budget"),
            ("Cross-train team members", "Less single-person dependency", "team leads"),
        ],
        RiskType::Quality => [
            ("Triage and fix open critical defects", "Stabilize the deliverable", "engineering"),
            ("Tighten review and test gates", "Fewer escaped defects", "QA"),
            ("Run a root-cause review of defects", "Prevent recurrence", "QA, engineering"),
        ],
        RiskType::Operational => [
            ("Stabilize the affected process", "Restore normal operation", "operations"),
            ("Set up monitoring and escalation", "Faster incident response", "operations"),
            ("Review vendor and tooling dependencies", "Fewer external disruptions", "procurement"),
        ],
    };

    entries
        .iter()
        .enumerate()
        .map(|(i, (title, effect, resources))| {
            let priority = i as u32 + 1;
            ActionItem {
                priority,
                title: title.to_string(),
                expected_effect: effect.to_string(),
                resources: resources.split(", ").map(str::to_string).collect(),
                period: period_for("", priority),
            }
        })
        .collect()
}

pub struct ActionAdvisor {
    ctx: Arc<AppContext>,
}

impl ActionAdvisor {
    pub fn new(ctx: Arc<AppContext>) -> Self {
        Self { ctx }
    }

    fn build_prompt(&self, input: &StageInput, risk: &RiskAssessment, headline: &str) -> String {
        format!(
            r#"[STAGE:action_advisor] Action Planning

Task: {}
Conclusion: {}
Risk: {} (severity {})
Rationale: {}

Propose concrete actions, most urgent first, one per line:
1. <action> | <expected effect> | <resources, comma separated>

Mention "immediately", "short term" or "long term" in an action when its
timing is not obvious from its priority."#,
            input.description,
            headline,
            risk.risk_type.as_str(),
            risk.severity.as_str(),
            risk.rationale
        )
    }
}

#[async_trait]
impl StageAgent for ActionAdvisor {
    fn stage(&self) -> Stage {
        Stage::ActionAdvisor
    }

    async fn run(&self, task_id: &str, input: &StageInput) -> Result<StagePayload> {
        let (_, sheet) = input.require_facts()?;
        let (_, risk) = input.require_risk()?;
        let reply = call_backend(
            &self.ctx,
            self.stage(),
            &self.build_prompt(input, risk, &sheet.headline),
        )
        .await?;

        let mut degradations = Vec::new();
        let mut actions = parse_actions(&reply);
        if actions.is_empty() {
            degradations.push("no actions proposed, using playbook".to_string());
            actions = playbook(risk);
        }

        let timeline = match run_skill::<Timeline>(
            &self.ctx,
            "plan_timeline",
            json!({ "actions": actions }),
            plan_timeline,
        )
        .await
        {
            Ok(planned) => planned.timeline,
            Err(e) => {
                degradations.push(format!("timeline planning failed: {}", e.summary()));
                timeline(&actions)
            }
        };

        let confidence = self.ctx.config.confidence.score(degradations.len());
        info!(
            "Task {}: {} actions over {} periods",
            task_id,
            actions.len(),
            timeline.len()
        );

        let card = KnowledgeCard::new(
            task_id,
            format!("Action plan for {} risk", risk.risk_type.as_str()),
            CardContent::Action(ActionPlan { actions, timeline }),
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
    use crate::card::{FactSheet, ImpactAxis, ImpactEstimate, Severity};
    use tempfile::TempDir;

    fn risk() -> RiskAssessment {
        let axis = |level| ImpactAxis {
            level,
            summary: String::new(),
        };
        RiskAssessment {
            risk_type: RiskType::Resource,
            severity: Severity::High,
            impact: ImpactEstimate {
                financial: axis(Severity::Medium),
                operational: axis(Severity::High),
            },
            rationale: "design team understaffed".to_string(),
        }
    }

    fn input() -> StageInput {
        let mut input = StageInput::new("task-1", "analyze slip", "raw");
        input.facts = Some(KnowledgeCard::new(
            "task-1",
            "design stage delayed",
            CardContent::Fact(FactSheet {
                facts: vec![],
                headline: "design stage delayed".to_string(),
            }),
            0.9,
        ));
        input.risk = Some(KnowledgeCard::new(
            "task-1",
            "resource risk (high)",
            CardContent::Risk(risk()),
            0.9,
        ));
        input
    }

    #[test]
    fn test_parse_actions_with_segments() {
        let reply = "Here is the plan:\n\
                     1. Move two engineers to design | Cuts the slip by a week | team leads, budget\n\
                     2. Hire a contractor long term | Restores capacity | HR\n\
                     3. Weekly design reviews\n";
        let actions = parse_actions(reply);
        assert_eq!(actions.len(), 3);
        assert_eq!(actions[0].resources, vec!["team leads", "budget"]);
        assert_eq!(actions[0].period, Period::Immediate);
        assert_eq!(actions[1].period, Period::LongTerm);
        assert_eq!(actions[2].period, Period::ShortTerm);
        assert!(actions[2].expected_effect.is_empty());
    }

    #[test]
    fn test_period_by_priority() {
        assert_eq!(period_for("do it", 1), Period::Immediate);
        assert_eq!(period_for("do it", 3), Period::ShortTerm);
        assert_eq!(period_for("do it", 4), Period::LongTerm);
        assert_eq!(period_for("fix it immediately", 5), Period::Immediate);
        assert_eq!(period_for("knowledge base", 1), Period::Immediate);
    }

    #[test]
    fn test_timeline_groups_by_period() {
        let actions = parse_actions("1. A\n2. B\n3. C\n4. D\n5. E now");
        let phases = timeline(&actions);
        assert_eq!(phases.len(), 3);
        assert_eq!(phases[0].period, Period::Immediate);
        assert_eq!(phases[0].actions, vec!["A", "E now"]);
        assert_eq!(phases[1].actions, vec!["B", "C"]);
        assert_eq!(phases[2].actions, vec!["D"]);
    }

    #[tokio::test]
    async fn test_run_with_empty_reply_uses_playbook() {
        let tmp = TempDir::new().unwrap();
        let ctx = context(tmp.path(), "").await;
        let agent = ActionAdvisor::new(ctx);

        let StagePayload::Card(card) = agent.run("task-1", &input()).await.unwrap() else {
            panic!("expected a card");
        };
        let plan = card.action_plan().unwrap();
        assert_eq!(plan.actions.len(), 3);
        assert_eq!(plan.actions[0].priority, 1);
        assert_eq!(plan.timeline.len(), 2);
        assert!(card.is_degraded());
    }

    #[tokio::test]
    async fn test_run_with_actions() {
        let tmp = TempDir::new().unwrap();
        let ctx = context(tmp.path(), "1. Move two engineers to design | Faster design | team leads").await;
        let agent = ActionAdvisor::new(ctx.clone());

        let StagePayload::Card(card) = agent.run("task-1", &input()).await.unwrap() else {
            panic!("expected a card");
        };
        let plan = card.action_plan().unwrap();
        assert_eq!(plan.actions.len(), 1);
        assert_eq!(plan.timeline[0].period, Period::Immediate);
        assert!(!card.is_degraded());
        assert_eq!(ctx.skills.get("plan_timeline").await.unwrap().usage_count, 1);
    }
}
