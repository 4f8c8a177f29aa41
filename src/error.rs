//! Error types for the analysis pipeline
//!
//! One enum covers the hub, the stage agents, the knowledge memory and the
//! skill registry. Soft parse problems are not errors: they surface as
//! degradation notes and a lowered card confidence.

use thiserror::Error;

/// Main error type for pipeline operations
#[derive(Error, Debug)]
pub enum Error {
    /// A stage result arrived out of order for the task's cursor
    #[error("Sequence error for task {task_id}: expected {expected}, got {got}")]
    Sequence {
        task_id: String,
        expected: String,
        got: String,
    },

    /// The inference backend failed (spawn, exit status, model error)
    #[error("Backend error in stage {stage}: {message}")]
    Backend { stage: String, message: String },

    /// A stage exceeded the caller-configured timeout
    #[error("Stage {stage} timed out after {seconds}s")]
    Timeout { stage: String, seconds: u64 },

    /// Skill lookup failed
    #[error("Skill not found: {0}")]
    SkillNotFound(String),

    /// Skill exists but is switched off
    #[error("Skill disabled: {0}")]
    SkillDisabled(String),

    /// The in-memory index disagrees with the card table; rebuild it
    #[error("Index corruption: {0}")]
    IndexCorruption(String),

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    /// Payload does not fit the stage it was posted for
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Embedding error: {0}")]
    Embedding(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Generic error with context
    #[error("Error: {0}")]
    Other(String),
}

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Short one-line summary used when a task is marked failed
    pub fn summary(&self) -> String {
        let text = self.to_string();
        match text.lines().next() {
            Some(line) if line.chars().count() > 200 => {
                format!("{}...", line.chars().take(197).collect::<String>())
            }
            Some(line) => line.to_string(),
            None => text,
        }
    }

    /// Whether this error should stop the task (as opposed to a caller mistake)
    pub fn is_stage_failure(&self) -> bool {
        matches!(self, Error::Backend { .. } | Error::Timeout { .. })
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Other(s)
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Other(s.to_string())
    }
}
