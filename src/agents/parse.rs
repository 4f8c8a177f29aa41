//! Deterministic helpers for reading backend text and raw cells

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

/// Normalized form of every missing cell
pub const MISSING: &str = "N/A";

const MISSING_MARKERS: &[&str] = &["", "-", "--", "n/a", "na", "null", "none", "?", "nan"];

static NUMBER: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"[-+]?\d+(?:\.\d+)?").ok());

static PERCENT: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(\d+(?:\.\d+)?)\s*%").ok());

static LIST_ITEM: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^\s*(?:(\d+)[.)]|[-*•])\s+(.+?)\s*$").ok());

static PIPE_SEPARATOR: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^\s*\|?\s*:?-{3,}:?\s*(?:\|\s*:?-{3,}:?\s*)*\|?\s*$").ok());

pub fn is_missing(cell: &str) -> bool {
    let lower = cell.trim().to_lowercase();
    MISSING_MARKERS.contains(&lower.as_str())
}

/// Trimmed cell, or [`MISSING`] for any missing marker
pub fn normalize_cell(cell: &str) -> String {
    if is_missing(cell) {
        MISSING.to_string()
    } else {
        cell.trim().to_string()
    }
}

/// First number in a cell, ignoring thousands separators
pub fn parse_number(cell: &str) -> Option<f64> {
    if is_missing(cell) {
        return None;
    }
    let cleaned = cell.replace(',', "");
    NUMBER
        .as_ref()?
        .find(&cleaned)
        .and_then(|m| m.as_str().parse::<f64>().ok())
}

/// Last `NN%` in a line, with the byte offset where it starts
pub fn last_percent(line: &str) -> Option<(usize, f64)> {
    let re = PERCENT.as_ref()?;
    let caps = re.captures_iter(line).last()?;
    let whole = caps.get(0)?;
    let value = caps.get(1)?.as_str().parse::<f64>().ok()?;
    Some((whole.start(), value))
}

/// `1. text`, `2) text`, `- text`, `* text` → (number, text)
pub fn list_item(line: &str) -> Option<(Option<u32>, &str)> {
    let caps = LIST_ITEM.as_ref()?.captures(line)?;
    let number = caps.get(1).and_then(|m| m.as_str().parse().ok());
    let text = caps.get(2)?.as_str();
    Some((number, text))
}

pub fn is_pipe_separator(line: &str) -> bool {
    PIPE_SEPARATOR
        .as_ref()
        .is_some_and(|re| re.is_match(line))
}

/// Value of the first `LABEL: value` line, label matched case-insensitively
pub fn labeled_value(text: &str, label: &str) -> Option<String> {
    let prefix = format!("{}:", label.to_lowercase());
    text.lines().find_map(|line| {
        let trimmed = line.trim().trim_start_matches(['*', '#', '-', ' ']);
        let lower = trimmed.to_lowercase();
        if lower.starts_with(&prefix) {
            let value = trimmed.get(prefix.len()..)?.trim().trim_matches('*').trim();
            (!value.is_empty()).then(|| value.to_string())
        } else {
            None
        }
    })
}

/// Whether a line is a `LABEL:` line for any of `labels`
pub fn is_labeled(line: &str, labels: &[&str]) -> bool {
    let lower = line.trim().trim_start_matches(['*', '#', '-', ' ']).to_lowercase();
    labels
        .iter()
        .any(|label| lower.starts_with(&format!("{}:", label.to_lowercase())))
}

/// JSON object embedded in free text, if any
pub fn extract_json_object(text: &str) -> Option<Value> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end < start {
        return None;
    }
    match serde_json::from_str::<Value>(&text[start..=end]) {
        Ok(value @ Value::Object(_)) => Some(value),
        _ => None,
    }
}

/// Split on `->` or `→`, dropping empty nodes
pub fn split_chain(chain: &str) -> Vec<String> {
    chain
        .split("->")
        .flat_map(|part| part.split('→'))
        .map(|node| node.trim().trim_end_matches('.').trim().to_string())
        .filter(|node| !node.is_empty())
        .collect()
}

/// Whether `text` mentions `word` as a whole word (case-insensitive)
pub fn mentions(text: &str, word: &str) -> bool {
    let lower = text.to_lowercase();
    lower
        .split(|c: char| !c.is_alphanumeric())
        .any(|token| token == word)
}

pub fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() > max {
        let cut: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", cut.trim_end())
    } else {
        s.to_string()
    }
}
