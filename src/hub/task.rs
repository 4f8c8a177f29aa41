use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::card::CardType;

/// Pipeline stages in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Preprocessor,
    FactExtractor,
    Interpreter,
    RiskDetector,
    ActionAdvisor,
}

impl Stage {
    pub const ALL: [Stage; 5] = [
        Stage::Preprocessor,
        Stage::FactExtractor,
        Stage::Interpreter,
        Stage::RiskDetector,
        Stage::ActionAdvisor,
    ];

    /// Stage expected when the task cursor is at `cursor`
    pub fn from_cursor(cursor: usize) -> Option<Stage> {
        Self::ALL.get(cursor).copied()
    }

    pub fn cursor(&self) -> usize {
        match self {
            Stage::Preprocessor => 0,
            Stage::FactExtractor => 1,
            Stage::Interpreter => 2,
            Stage::RiskDetector => 3,
            Stage::ActionAdvisor => 4,
        }
    }

    pub fn next(&self) -> Option<Stage> {
        Self::from_cursor(self.cursor() + 1)
    }

    pub fn is_terminal(&self) -> bool {
        self.next().is_none()
    }

    /// Card type this stage emits; the preprocessor emits none
    pub fn card_type(&self) -> Option<CardType> {
        match self {
            Stage::Preprocessor => None,
            Stage::FactExtractor => Some(CardType::Fact),
            Stage::Interpreter => Some(CardType::Interpretation),
            Stage::RiskDetector => Some(CardType::Risk),
            Stage::ActionAdvisor => Some(CardType::Action),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Preprocessor => "preprocessor",
            Stage::FactExtractor => "fact_extractor",
            Stage::Interpreter => "interpreter",
            Stage::RiskDetector => "risk_detector",
            Stage::ActionAdvisor => "action_advisor",
        }
    }

    pub fn parse(s: &str) -> Option<Stage> {
        let normalized = s.trim().to_lowercase().replace(['-', ' '], "_");
        Self::ALL.into_iter().find(|stage| stage.as_str() == normalized)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }
}

/// Why a task stopped
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageFailure {
    pub stage: Stage,
    /// Short, single-line error summary
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub task_id: String,
    pub description: String,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Number of accepted stages
    pub stage_cursor: usize,
    /// Cards accepted for this task, in stage order
    #[serde(default)]
    pub card_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<StageFailure>,
}

impl Task {
    pub fn new(description: impl Into<String>) -> Self {
        let short = Uuid::new_v4().simple().to_string();
        let now = Utc::now();
        Self {
            task_id: format!("task-{}", &short[..8]),
            description: description.into(),
            status: TaskStatus::Pending,
            created_at: now,
            updated_at: now,
            stage_cursor: 0,
            card_ids: Vec::new(),
            failure: None,
        }
    }

    /// Next stage the hub will accept, if the task can still advance
    pub fn expected_stage(&self) -> Option<Stage> {
        if self.status.is_terminal() {
            None
        } else {
            Stage::from_cursor(self.stage_cursor)
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status == TaskStatus::Completed
    }

    pub fn is_failed(&self) -> bool {
        self.status == TaskStatus::Failed
    }

    pub fn display_line(&self) -> String {
        let progress = format!("{}/{}", self.stage_cursor, Stage::ALL.len());
        let failure = self
            .failure
            .as_ref()
            .map(|f| format!("  [{}: {}]", f.stage, f.error))
            .unwrap_or_default();
        format!(
            "{}  {:<9}  {}  {}  {}{}",
            self.task_id,
            self.status.as_str(),
            progress,
            self.created_at.format("%Y-%m-%d %H:%M"),
            truncate(&self.description, 40),
            failure
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MaterialShape {
    Table,
    Json,
    Prose,
}

impl MaterialShape {
    pub fn as_str(&self) -> &'static str {
        match self {
            MaterialShape::Table => "table",
            MaterialShape::Json => "json",
            MaterialShape::Prose => "prose",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityLabel {
    Excellent,
    Good,
    Fair,
}

impl QualityLabel {
    pub fn from_score(quality: f64) -> Self {
        if quality >= 0.95 {
            QualityLabel::Excellent
        } else if quality >= 0.80 {
            QualityLabel::Good
        } else {
            QualityLabel::Fair
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            QualityLabel::Excellent => "excellent",
            QualityLabel::Good => "good",
            QualityLabel::Fair => "fair",
        }
    }
}

/// Raw material after shape detection and missing-value normalization
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreparedMaterial {
    pub shape: MaterialShape,
    #[serde(default)]
    pub headers: Vec<String>,
    #[serde(default)]
    pub rows: Vec<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub json: Option<Value>,
    /// Normalized prose, or the raw text for other shapes
    pub text: String,
    pub missing_cells: usize,
    pub total_cells: usize,
    /// `1 - missing_cells / total_cells`
    pub quality: f64,
    pub quality_label: QualityLabel,
    #[serde(default)]
    pub summary: String,
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub degradations: Vec<String>,
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() > max {
        let cut: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", cut)
    } else {
        s.to_string()
    }
}
