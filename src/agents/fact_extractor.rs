//! Stage 2: objective facts and one headline conclusion

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::info;

use super::parse::{self, MISSING};
use super::{call_backend, run_skill, StageAgent, StageInput};
use crate::card::{CardContent, Fact, FactSheet, KnowledgeCard};
use crate::context::AppContext;
use crate::error::Result;
use crate::hub::{PreparedMaterial, Stage, StagePayload};

const PLANNED_KEYWORDS: &[&str] = &["planned", "plan", "target", "budget", "baseline", "expected", "estimate"];
const ACTUAL_KEYWORDS: &[&str] = &["actual", "real", "spent", "current", "result"];
const STATUS_KEYWORDS: &[&str] = &["status", "state"];
const TIME_KEYWORDS: &[&str] = &[
    "day", "days", "week", "weeks", "month", "months", "hour", "hours", "date", "time",
    "duration", "schedule",
];

/// Output of the deviation scan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviationScan {
    pub facts: Vec<Fact>,
    pub headline: Option<String>,
    /// Whether planned and actual columns were found
    pub comparable: bool,
}

/// Skill: per-row planned/actual deviations and the headline they imply
pub fn scan_deviations(args: Value) -> Result<Value> {
    let headers: Vec<String> =
        serde_json::from_value(args.get("headers").cloned().unwrap_or_else(|| json!([])))?;
    let rows: Vec<Vec<String>> =
        serde_json::from_value(args.get("rows").cloned().unwrap_or_else(|| json!([])))?;
    Ok(serde_json::to_value(scan(&headers, &rows))?)
}

fn header_matches(header: &str, keywords: &[&str]) -> bool {
    let lower = header.to_lowercase();
    lower
        .split(|c: char| !c.is_alphanumeric())
        .any(|word| keywords.contains(&word))
}

fn numeric_share(rows: &[Vec<String>], col: usize) -> f64 {
    let present: Vec<&String> = rows
        .iter()
        .filter_map(|r| r.get(col))
        .filter(|c| c.as_str() != MISSING)
        .collect();
    if present.is_empty() {
        return 0.0;
    }
    let numeric = present.iter().filter(|c| parse::parse_number(c).is_some()).count();
    numeric as f64 / present.len() as f64
}

/// Header without its planned/actual keyword, e.g. "Planned Days" -> "days"
fn metric_name(header: &str) -> String {
    let words: Vec<String> = header
        .split_whitespace()
        .map(str::to_lowercase)
        .filter(|w| !PLANNED_KEYWORDS.contains(&w.as_str()) && !ACTUAL_KEYWORDS.contains(&w.as_str()))
        .collect();
    if words.is_empty() {
        header.to_lowercase()
    } else {
        words.join(" ")
    }
}

fn format_number(value: f64) -> String {
    if value.fract() == 0.0 {
        format!("{:.0}", value)
    } else {
        format!("{:.1}", value)
    }
}

pub fn scan(headers: &[String], rows: &[Vec<String>]) -> DeviationScan {
    let actual_col = headers.iter().position(|h| header_matches(h, ACTUAL_KEYWORDS));
    let planned_col = headers
        .iter()
        .enumerate()
        .position(|(i, h)| Some(i) != actual_col && header_matches(h, PLANNED_KEYWORDS));
    let status_col = headers.iter().position(|h| header_matches(h, STATUS_KEYWORDS));

    let (Some(planned_col), Some(actual_col)) = (planned_col, actual_col) else {
        return DeviationScan {
            facts: Vec::new(),
            headline: status_headline(headers, rows, status_col, label_column(headers, rows, &[])),
            comparable: false,
        };
    };

    let label_col = label_column(headers, rows, &[planned_col, actual_col]);
    let label_header = label_col
        .map(|c| headers[c].to_lowercase())
        .unwrap_or_else(|| "row".to_string());
    let metric = metric_name(&headers[planned_col]);
    let time_like = header_matches(&headers[planned_col], TIME_KEYWORDS)
        || header_matches(&headers[actual_col], TIME_KEYWORDS);

    let mut facts = Vec::new();
    let mut worst: Option<(f64, usize)> = None;

    for (i, row) in rows.iter().enumerate() {
        let subject = label_col
            .and_then(|c| row.get(c))
            .filter(|s| s.as_str() != MISSING)
            .cloned()
            .unwrap_or_else(|| format!("row {}", i + 1));
        let planned = row.get(planned_col).and_then(|c| parse::parse_number(c));
        let actual = row.get(actual_col).and_then(|c| parse::parse_number(c));

        let fact = match (planned, actual) {
            (Some(p), Some(a)) => {
                let deviation = a - p;
                let deviation_pct = (p != 0.0).then(|| deviation / p * 100.0);
                if deviation > 0.0 && worst.map_or(true, |(d, _)| deviation > d) {
                    worst = Some((deviation, i));
                }
                let pct = deviation_pct
                    .map(|v| format!(", {:+.1}%", v))
                    .unwrap_or_default();
                Fact {
                    subject: subject.clone(),
                    metric: Some(metric.clone()),
                    planned: Some(p),
                    actual: Some(a),
                    deviation: Some(deviation),
                    deviation_pct,
                    statement: format!(
                        "{}: actual {} {} against {} planned ({:+}{})",
                        subject,
                        format_number(a),
                        metric,
                        format_number(p),
                        deviation,
                        pct
                    ),
                }
            }
            (Some(p), None) => Fact {
                subject: subject.clone(),
                metric: Some(metric.clone()),
                planned: Some(p),
                actual: None,
                deviation: None,
                deviation_pct: None,
                statement: format!(
                    "{}: actual {} not reported ({} planned)",
                    subject,
                    metric,
                    format_number(p)
                ),
            },
            _ => continue,
        };
        facts.push(fact);
    }

    let headline = match worst {
        Some((_, i)) => {
            let subject = &facts_subject(&facts, rows, label_col, i);
            let delayed = time_like
                || status_col
                    .and_then(|c| rows[i].get(c))
                    .is_some_and(|s| s.to_lowercase().contains("delay"));
            let verdict = if delayed { "delayed" } else { "over plan" };
            Some(format!("{} {} {}", subject, label_header, verdict).to_lowercase())
        }
        None => status_headline(headers, rows, status_col, label_col),
    };

    DeviationScan {
        facts,
        headline,
        comparable: true,
    }
}

fn facts_subject(facts: &[Fact], rows: &[Vec<String>], label_col: Option<usize>, row: usize) -> String {
    label_col
        .and_then(|c| rows[row].get(c))
        .filter(|s| s.as_str() != MISSING)
        .cloned()
        .or_else(|| facts.first().map(|f| f.subject.clone()))
        .unwrap_or_else(|| format!("row {}", row + 1))
}

/// First mostly non-numeric column outside `exclude`
fn label_column(headers: &[String], rows: &[Vec<String>], exclude: &[usize]) -> Option<usize> {
    (0..headers.len())
        .filter(|c| !exclude.contains(c))
        .filter(|&c| !header_matches(&headers[c], STATUS_KEYWORDS))
        .find(|&c| numeric_share(rows, c) < 0.5)
}

/// `"<row> <label> delayed"` for the first row whose status mentions a delay
fn status_headline(
    headers: &[String],
    rows: &[Vec<String>],
    status_col: Option<usize>,
    label_col: Option<usize>,
) -> Option<String> {
    let status_col = status_col?;
    let label_col = label_col?;
    let row = rows
        .iter()
        .find(|r| r.get(status_col).is_some_and(|s| s.to_lowercase().contains("delay")))?;
    let subject = row.get(label_col)?;
    Some(format!("{} {} delayed", subject, headers[label_col]).to_lowercase())
}

pub struct FactExtractor {
    ctx: Arc<AppContext>,
}

impl FactExtractor {
    pub fn new(ctx: Arc<AppContext>) -> Self {
        Self { ctx }
    }

    fn build_prompt(&self, input: &StageInput, material: &PreparedMaterial, scan: &DeviationScan) -> String {
        let facts = if scan.facts.is_empty() {
            "(no computed facts)".to_string()
        } else {
            scan.facts
                .iter()
                .map(|f| format!("- {}", f.statement))
                .collect::<Vec<_>>()
                .join("\n")
        };

        format!(
            r#"[STAGE:fact_extractor] Fact Extraction

Task: {}
Material summary: {}

Computed facts:
{}

Material:
{}

List any further objective observations as bullet lines ("- ...").
Do not speculate about causes.
If the computed facts give no clear conclusion, add one line:
HEADLINE: <one short conclusion>"#,
            input.description,
            material.summary,
            facts,
            parse::truncate(&material.text, 4000)
        )
    }
}

#[async_trait]
impl StageAgent for FactExtractor {
    fn stage(&self) -> Stage {
        Stage::FactExtractor
    }

    async fn run(&self, task_id: &str, input: &StageInput) -> Result<StagePayload> {
        let material = input.require_prepared()?;
        let mut degradations = Vec::new();

        let scan = match run_skill::<DeviationScan>(
            &self.ctx,
            "scan_deviations",
            json!({ "headers": material.headers, "rows": material.rows }),
            scan_deviations,
        )
        .await
        {
            Ok(scan) => scan,
            Err(e) => {
                degradations.push(format!("deviation scan failed: {}", e.summary()));
                scan(&[], &[])
            }
        };
        if !material.rows.is_empty() && !scan.comparable {
            degradations.push("no planned/actual columns found".to_string());
        }

        let reply = call_backend(
            &self.ctx,
            self.stage(),
            &self.build_prompt(input, material, &scan),
        )
        .await?;

        let mut facts = scan.facts;
        facts.extend(
            reply
                .lines()
                .filter(|l| !parse::is_labeled(l, &["headline"]))
                .filter_map(parse::list_item)
                .map(|(_, text)| Fact::qualitative("observation", text)),
        );

        let headline = match scan.headline {
            Some(headline) => headline,
            None => match parse::labeled_value(&reply, "HEADLINE") {
                Some(headline) => headline,
                None => {
                    degradations.push("no headline could be derived".to_string());
                    let fallback = material
                        .text
                        .lines()
                        .map(str::trim)
                        .find(|l| !l.is_empty())
                        .unwrap_or(input.description.as_str());
                    parse::truncate(fallback, 120)
                }
            },
        };

        if facts.is_empty() {
            degradations.push("no facts extracted".to_string());
        }

        let confidence = self.ctx.config.confidence.score(degradations.len());
        info!(
            "Task {}: {} facts, headline \"{}\" (confidence {:.2})",
            task_id,
            facts.len(),
            headline,
            confidence
        );

        let card = KnowledgeCard::new(
            task_id,
            headline.clone(),
            CardContent::Fact(FactSheet { facts, headline }),
            confidence,
        )
        .with_degradations(degradations);

        Ok(StagePayload::Card(card))
    }
}
