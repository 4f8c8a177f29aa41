//! Stage 3: ranked causal factors and the causal chain to the headline

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use super::parse;
use super::{call_backend, run_skill, text_args, StageAgent, StageInput};
use crate::card::{CardContent, CausalFactor, CausalLink, FactSheet, Interpretation, KnowledgeCard};
use crate::context::AppContext;
use crate::error::{Error, Result};
use crate::hub::{Stage, StagePayload};

const LABELS: &[&str] = &["chain", "narrative", "headline"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedFactors {
    pub factors: Vec<CausalFactor>,
}

/// Skill: read `name ... NN%` lines and rank them by impact
pub fn rank_factors(args: Value) -> Result<Value> {
    let text = args
        .get("text")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::InvalidPayload("rank_factors needs a text argument".into()))?;
    Ok(serde_json::to_value(RankedFactors {
        factors: rank(text),
    })?)
}

pub fn rank(text: &str) -> Vec<CausalFactor> {
    let mut parsed: Vec<(String, f64)> = Vec::new();

    for line in text.lines() {
        if parse::is_labeled(line, LABELS) {
            continue;
        }
        let body = parse::list_item(line).map(|(_, t)| t).unwrap_or(line.trim());
        let Some((start, impact)) = parse::last_percent(body) else {
            continue;
        };
        let name = body[..start]
            .trim_end_matches(|c: char| c.is_whitespace() || "-–—:=.(,".contains(c))
            .trim();
        if name.is_empty() {
            continue;
        }
        if parsed.iter().any(|(n, _)| n.eq_ignore_ascii_case(name)) {
            continue;
        }
        parsed.push((name.to_string(), impact.clamp(0.0, 100.0)));
    }

    // Stable sort keeps the backend's order among equal impacts
    parsed.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    parsed
        .into_iter()
        .enumerate()
        .map(|(i, (name, impact_pct))| CausalFactor {
            rank: i + 1,
            name,
            impact_pct,
        })
        .collect()
}

/// Chain with unique nodes whose last node is the headline
pub fn close_chain(stated: Vec<String>, factors: &[CausalFactor], headline: &str) -> Vec<String> {
    let mut nodes = if stated.is_empty() {
        factors.first().map(|f| vec![f.name.clone()]).unwrap_or_default()
    } else {
        stated
    };

    nodes.retain(|n| !n.eq_ignore_ascii_case(headline));
    let mut chain: Vec<String> = Vec::with_capacity(nodes.len() + 1);
    for node in nodes {
        if !chain.iter().any(|c| c.eq_ignore_ascii_case(&node)) {
            chain.push(node);
        }
    }
    chain.push(headline.to_string());
    chain
}

/// Factor implied by the largest deviation when the backend names none
fn deviation_factor(sheet: &FactSheet) -> Option<CausalFactor> {
    let fact = sheet
        .facts
        .iter()
        .filter(|f| f.deviation.is_some_and(|d| d > 0.0))
        .max_by(|a, b| {
            a.deviation
                .partial_cmp(&b.deviation)
                .unwrap_or(std::cmp::Ordering::Equal)
        })?;
    let metric = fact.metric.as_deref().unwrap_or("plan");
    Some(CausalFactor {
        rank: 1,
        name: format!("{} {} overrun", fact.subject, metric),
        impact_pct: fact.deviation_pct.unwrap_or(100.0).clamp(0.0, 100.0),
    })
}

pub struct Interpreter {
    ctx: Arc<AppContext>,
}

impl Interpreter {
    pub fn new(ctx: Arc<AppContext>) -> Self {
        Self { ctx }
    }

    fn build_prompt(&self, input: &StageInput, sheet: &FactSheet) -> String {
        let facts = sheet
            .facts
            .iter()
            .map(|f| format!("- {}", f.statement))
            .collect::<Vec<_>>()
            .join("\n");

        format!(
            r#"[STAGE:interpreter] Causal Analysis

Task: {}
Conclusion to explain: {}

Facts:
{}

List the most likely causes, most important first, one per line:
1. <cause> - <estimated share of impact>%

Then give the causal chain ending at the conclusion:
CHAIN: <cause> -> <effect> -> {}

Optionally add one line:
NARRATIVE: <short explanation>"#,
            input.description, sheet.headline, facts, sheet.headline
        )
    }
}

#[async_trait]
impl StageAgent for Interpreter {
    fn stage(&self) -> Stage {
        Stage::Interpreter
    }

    async fn run(&self, task_id: &str, input: &StageInput) -> Result<StagePayload> {
        let (fact_card, sheet) = input.require_facts()?;
        let reply = call_backend(&self.ctx, self.stage(), &self.build_prompt(input, sheet)).await?;

        let mut degradations = Vec::new();
        let mut factors = match run_skill::<RankedFactors>(
            &self.ctx,
            "rank_factors",
            text_args(&reply),
            rank_factors,
        )
        .await
        {
            Ok(ranked) => ranked.factors,
            Err(e) => {
                degradations.push(format!("factor ranking failed: {}", e.summary()));
                Vec::new()
            }
        };

        if factors.is_empty() {
            degradations.push("no causal factors stated".to_string());
            factors.extend(deviation_factor(sheet));
        }

        let stated = parse::labeled_value(&reply, "CHAIN")
            .map(|c| parse::split_chain(&c))
            .unwrap_or_default();
        if stated.is_empty() {
            degradations.push("no causal chain stated".to_string());
        }
        let chain = close_chain(stated, &factors, &sheet.headline);

        let narrative = parse::labeled_value(&reply, "NARRATIVE").unwrap_or_else(|| {
            match factors.first() {
                Some(primary) => format!(
                    "{} ({:.0}% estimated impact) is the main driver of: {}",
                    primary.name, primary.impact_pct, sheet.headline
                ),
                None => format!("No cause identified for: {}", sheet.headline),
            }
        });

        let confidence = self.ctx.config.confidence.score(degradations.len());
        let card = KnowledgeCard::new(
            task_id,
            format!("Causes of {}", sheet.headline),
            CardContent::Interpretation(Interpretation {
                factors,
                chain: chain.clone(),
                narrative,
            }),
            confidence,
        )
        .with_degradations(degradations);

        let links: Vec<CausalLink> = chain
            .windows(2)
            .enumerate()
            .map(|(position, pair)| CausalLink {
                task_id: task_id.to_string(),
                from_card: fact_card.card_id.clone(),
                to_card: card.card_id.clone(),
                from_node: pair[0].clone(),
                to_node: pair[1].clone(),
                relation_label: if position + 2 == chain.len() {
                    "results_in".to_string()
                } else {
                    "leads_to".to_string()
                },
                position,
            })
            .collect();

        info!(
            "Task {}: {} causal factors, chain of {} links",
            task_id,
            card.interpretation().map_or(0, |i| i.factors.len()),
            links.len()
        );

        Ok(StagePayload::Interpretation { card, links })
    }
}
