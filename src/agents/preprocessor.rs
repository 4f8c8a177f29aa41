//! Stage 1: shape detection, missing-value normalization and quality profile

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{debug, info};

use super::parse::{self, MISSING};
use super::{call_backend, run_skill, text_args, StageAgent, StageInput};
use crate::context::AppContext;
use crate::error::{Error, Result};
use crate::hub::{MaterialShape, PreparedMaterial, QualityLabel, Stage, StagePayload};

const TABLE_DELIMITERS: [char; 3] = [',', '\t', ';'];

/// Material as structured by the shape sniffer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sniffed {
    pub shape: MaterialShape,
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
    pub json: Option<Value>,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityProfile {
    pub missing_cells: usize,
    pub total_cells: usize,
    pub quality: f64,
    pub quality_label: QualityLabel,
}

/// Skill: classify raw text as table, JSON object or prose
pub fn sniff_shape(args: Value) -> Result<Value> {
    let text = args
        .get("text")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::InvalidPayload("sniff_shape needs a text argument".into()))?;
    Ok(serde_json::to_value(sniff(text))?)
}

/// Skill: count missing cells of a table
pub fn profile_quality(args: Value) -> Result<Value> {
    let rows: Vec<Vec<String>> = serde_json::from_value(
        args.get("rows").cloned().unwrap_or_else(|| json!([])),
    )?;
    let has_content = args
        .get("has_content")
        .and_then(Value::as_bool)
        .unwrap_or(true);
    Ok(serde_json::to_value(profile(&rows, has_content))?)
}

pub fn sniff(text: &str) -> Sniffed {
    let trimmed = text.trim();

    if trimmed.starts_with('{') {
        if let Ok(value @ Value::Object(_)) = serde_json::from_str::<Value>(trimmed) {
            let (headers, rows) = json_table(&value);
            return Sniffed {
                shape: MaterialShape::Json,
                headers,
                rows,
                json: Some(value),
                text: trimmed.to_string(),
            };
        }
    }

    let lines: Vec<&str> = trimmed.lines().filter(|l| !l.trim().is_empty()).collect();
    if let Some((headers, rows)) = pipe_table(&lines).or_else(|| delimited_table(&lines)) {
        return Sniffed {
            shape: MaterialShape::Table,
            headers,
            rows,
            json: None,
            text: trimmed.to_string(),
        };
    }

    Sniffed {
        shape: MaterialShape::Prose,
        headers: Vec::new(),
        rows: Vec::new(),
        json: None,
        text: lines
            .iter()
            .map(|l| l.split_whitespace().collect::<Vec<_>>().join(" "))
            .collect::<Vec<_>>()
            .join("\n"),
    }
}

/// `quality = 1 - missing / total`; material without cells scores 1.0 unless empty
pub fn profile(rows: &[Vec<String>], has_content: bool) -> QualityProfile {
    let total_cells: usize = rows.iter().map(Vec::len).sum();
    let missing_cells = rows
        .iter()
        .flatten()
        .filter(|cell| cell.as_str() == MISSING)
        .count();

    let quality = if total_cells > 0 {
        1.0 - missing_cells as f64 / total_cells as f64
    } else if has_content {
        1.0
    } else {
        0.0
    };

    QualityProfile {
        missing_cells,
        total_cells,
        quality,
        quality_label: QualityLabel::from_score(quality),
    }
}

fn split_pipe_row(line: &str) -> Vec<String> {
    let t = line.trim();
    let t = t.strip_prefix('|').unwrap_or(t);
    let t = t.strip_suffix('|').unwrap_or(t);
    t.split('|').map(|c| c.trim().to_string()).collect()
}

/// Header row followed by a `---` separator row
fn pipe_table(lines: &[&str]) -> Option<(Vec<String>, Vec<Vec<String>>)> {
    let sep = lines
        .iter()
        .position(|l| l.contains('|') && parse::is_pipe_separator(l))?;
    if sep == 0 || !lines[sep - 1].contains('|') {
        return None;
    }

    let headers = split_pipe_row(lines[sep - 1]);
    let rows = lines[sep + 1..]
        .iter()
        .take_while(|l| l.contains('|'))
        .map(|l| fit_row(split_pipe_row(l), headers.len()))
        .collect();
    Some((headers, rows))
}

/// Two or more lines splitting into the same number (>= 2) of fields
fn delimited_table(lines: &[&str]) -> Option<(Vec<String>, Vec<Vec<String>>)> {
    if lines.len() < 2 {
        return None;
    }

    TABLE_DELIMITERS.iter().find_map(|&delim| {
        let width = lines[0].split(delim).count();
        if width < 2 || lines.iter().any(|l| l.split(delim).count() != width) {
            return None;
        }
        let headers = lines[0].split(delim).map(|c| c.trim().to_string()).collect();
        let rows = lines[1..]
            .iter()
            .map(|l| fit_row(l.split(delim).map(str::to_string).collect(), width))
            .collect();
        Some((headers, rows))
    })
}

fn fit_row(cells: Vec<String>, width: usize) -> Vec<String> {
    let mut row: Vec<String> = cells
        .into_iter()
        .take(width)
        .map(|c| parse::normalize_cell(&c))
        .collect();
    row.resize(width, MISSING.to_string());
    row
}

fn scalar(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Rows from the first array of objects, else one row of top-level scalars
fn json_table(value: &Value) -> (Vec<String>, Vec<Vec<String>>) {
    let Some(object) = value.as_object() else {
        return (Vec::new(), Vec::new());
    };

    let records = object.values().find_map(|v| {
        let items = v.as_array()?;
        (!items.is_empty() && items.iter().all(Value::is_object)).then_some(items)
    });

    if let Some(items) = records {
        let mut headers: Vec<String> = Vec::new();
        for item in items.iter().filter_map(Value::as_object) {
            for key in item.keys() {
                if !headers.contains(key) {
                    headers.push(key.clone());
                }
            }
        }
        let rows = items
            .iter()
            .filter_map(Value::as_object)
            .map(|item| record_row(item, &headers))
            .collect();
        return (headers, rows);
    }

    let headers: Vec<String> = object
        .iter()
        .filter(|(_, v)| !v.is_array() && !v.is_object())
        .map(|(k, _)| k.clone())
        .collect();
    if headers.is_empty() {
        return (headers, Vec::new());
    }
    let row = record_row(object, &headers);
    (headers, vec![row])
}

fn record_row(item: &Map<String, Value>, headers: &[String]) -> Vec<String> {
    headers
        .iter()
        .map(|h| parse::normalize_cell(&item.get(h).map(scalar).unwrap_or_default()))
        .collect()
}

pub struct Preprocessor {
    ctx: Arc<AppContext>,
}

impl Preprocessor {
    pub fn new(ctx: Arc<AppContext>) -> Self {
        Self { ctx }
    }

    fn build_prompt(&self, input: &StageInput, sniffed: &Sniffed) -> String {
        format!(
            r#"[STAGE:preprocessor] Material Summary

Task: {}

The material below was detected as {} ({} rows, {} columns).

{}

Describe what this material contains in one sentence.
Output exactly one line:
SUMMARY: <sentence>"#,
            input.description,
            sniffed.shape.as_str(),
            sniffed.rows.len(),
            sniffed.headers.len(),
            parse::truncate(&input.raw_material, 4000)
        )
    }
}

#[async_trait]
impl StageAgent for Preprocessor {
    fn stage(&self) -> Stage {
        Stage::Preprocessor
    }

    async fn run(&self, task_id: &str, input: &StageInput) -> Result<StagePayload> {
        let mut degradations = Vec::new();
        let has_content = !input.raw_material.trim().is_empty();
        if !has_content {
            degradations.push("raw material is empty".to_string());
        }

        let sniffed = match run_skill::<Sniffed>(
            &self.ctx,
            "sniff_shape",
            text_args(&input.raw_material),
            sniff_shape,
        )
        .await
        {
            Ok(sniffed) => sniffed,
            Err(e) => {
                degradations.push(format!("shape detection failed: {}", e.summary()));
                sniff("")
            }
        };

        let quality = match run_skill::<QualityProfile>(
            &self.ctx,
            "profile_quality",
            json!({ "rows": sniffed.rows, "has_content": has_content }),
            profile_quality,
        )
        .await
        {
            Ok(quality) => quality,
            Err(e) => {
                degradations.push(format!("quality profiling failed: {}", e.summary()));
                profile(&sniffed.rows, has_content)
            }
        };

        let reply = call_backend(&self.ctx, self.stage(), &self.build_prompt(input, &sniffed)).await?;

        let summary = match parse::labeled_value(&reply, "SUMMARY") {
            Some(summary) => summary,
            None => {
                let first = reply.lines().map(str::trim).find(|l| !l.is_empty());
                match first {
                    Some(line) => {
                        degradations.push("summary line not labeled".to_string());
                        parse::truncate(line, 300)
                    }
                    None => {
                        degradations.push("backend returned no summary".to_string());
                        format!(
                            "{} material with {} rows and {} columns",
                            sniffed.shape.as_str(),
                            sniffed.rows.len(),
                            sniffed.headers.len()
                        )
                    }
                }
            }
        };

        let confidence = self.ctx.config.confidence.score(degradations.len());
        info!(
            "Task {}: material is {} with quality {:.2} ({})",
            task_id,
            sniffed.shape.as_str(),
            quality.quality,
            quality.quality_label.as_str()
        );
        debug!("Task {}: preprocessor degradations {:?}", task_id, degradations);

        Ok(StagePayload::Prepared(PreparedMaterial {
            shape: sniffed.shape,
            headers: sniffed.headers,
            rows: sniffed.rows,
            json: sniffed.json,
            text: sniffed.text,
            missing_cells: quality.missing_cells,
            total_cells: quality.total_cells,
            quality: quality.quality,
            quality_label: quality.quality_label,
            summary,
            confidence,
            degradations,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::{context, SCHEDULE_TABLE};
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_sniff_pipe_table() {
        let sniffed = sniff(SCHEDULE_TABLE);
        assert_eq!(sniffed.shape, MaterialShape::Table);
        assert_eq!(sniffed.headers[1], "Planned Days");
        assert_eq!(sniffed.rows.len(), 4);
        assert_eq!(sniffed.rows[2][2], MISSING);
        assert_eq!(sniffed.rows[3], vec!["Test", "10", MISSING, MISSING, "pending"]);
    }

    #[test]
    fn test_schedule_table_quality_is_good() {
        let sniffed = sniff(SCHEDULE_TABLE);
        let quality = profile(&sniffed.rows, true);
        assert_eq!(quality.total_cells, 20);
        assert_eq!(quality.missing_cells, 3);
        assert!((quality.quality - 0.85).abs() < 1e-9);
        assert_eq!(quality.quality_label, QualityLabel::Good);
    }

    #[test]
    fn test_sniff_delimited_tables() {
        let csv = "item,planned,actual\nlicenses,100,140\nhosting,50,n/a\n";
        let sniffed = sniff(csv);
        assert_eq!(sniffed.shape, MaterialShape::Table);
        assert_eq!(sniffed.rows[1][2], MISSING);

        let tsv = "a\tb\n1\t2\n";
        assert_eq!(sniff(tsv).shape, MaterialShape::Table);

        let ragged = "a;b;c\n1;2\n";
        assert_eq!(sniff(ragged).shape, MaterialShape::Prose);
    }

    #[test]
    fn test_pipe_rows_without_separator_are_prose() {
        let text = "| a | b |\n| 1 | 2 |";
        assert_eq!(sniff(text).shape, MaterialShape::Prose);
    }

    #[test]
    fn test_sniff_json_records() {
        let text = r#"{"project": "atlas", "stages": [
            {"name": "design", "planned": 15, "actual": 25},
            {"name": "build", "planned": 30, "actual": null}
        ]}"#;
        let sniffed = sniff(text);
        assert_eq!(sniffed.shape, MaterialShape::Json);
        assert_eq!(sniffed.rows.len(), 2);
        let actual = sniffed.headers.iter().position(|h| h == "actual").unwrap();
        assert_eq!(sniffed.rows[1][actual], MISSING);
        assert!(sniffed.json.is_some());
    }

    #[test]
    fn test_sniff_prose_and_empty() {
        let sniffed = sniff("The design   review slipped\n\n again.");
        assert_eq!(sniffed.shape, MaterialShape::Prose);
        assert_eq!(sniffed.text, "The design review slipped\nagain.");

        let quality = profile(&[], false);
        assert_eq!(quality.quality, 0.0);
        assert_eq!(quality.quality_label, QualityLabel::Fair);
    }

    #[tokio::test]
    async fn test_run_without_summary_lowers_confidence() {
        let tmp = TempDir::new().unwrap();
        let ctx = context(tmp.path(), "").await;
        let agent = Preprocessor::new(ctx.clone());
        let input = StageInput::new("task-1", "analyze slip", SCHEDULE_TABLE);

        let StagePayload::Prepared(material) = agent.run("task-1", &input).await.unwrap() else {
            panic!("expected prepared material");
        };
        assert_eq!(material.quality_label, QualityLabel::Good);
        assert_eq!(material.degradations.len(), 1);
        assert!(material.confidence < ctx.config.confidence.base);
        assert_eq!(ctx.skills.get("sniff_shape").await.unwrap().usage_count, 1);
    }

    #[tokio::test]
    async fn test_run_with_summary_keeps_base_confidence() {
        let tmp = TempDir::new().unwrap();
        let ctx = context(tmp.path(), "SUMMARY: Stage schedule with owners").await;
        let agent = Preprocessor::new(ctx.clone());
        let input = StageInput::new("task-1", "analyze slip", SCHEDULE_TABLE);

        let StagePayload::Prepared(material) = agent.run("task-1", &input).await.unwrap() else {
            panic!("expected prepared material");
        };
        assert_eq!(material.summary, "Stage schedule with owners");
        assert!(material.degradations.is_empty());
        assert!((material.confidence - 0.9).abs() < 1e-9);
    }
}
