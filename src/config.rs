//! Pipeline configuration

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::router::ComplexityTier;

/// Environment variable overriding the data directory
pub const DATA_DIR_ENV: &str = "INSIGHT_RELAY_DATA_DIR";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Root of all persisted state
    pub data_dir: PathBuf,

    pub embedding: EmbeddingConfig,

    pub backend: BackendConfig,

    /// Per-stage limit on the backend call; none by default
    pub stage_timeout_secs: Option<u64>,

    pub router: RouterConfig,

    pub search: SearchConfig,

    pub confidence: ConfidenceConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            embedding: EmbeddingConfig::default(),
            backend: BackendConfig::default(),
            stage_timeout_secs: None,
            router: RouterConfig::default(),
            search: SearchConfig::default(),
            confidence: ConfidenceConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingProvider {
    Hashing,
    Fastembed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub provider: EmbeddingProvider,
    /// Vector size for the hashing embedder; fastembed models fix their own
    pub dimension: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: EmbeddingProvider::Hashing,
            dimension: 256,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// No model; every completion is empty
    Offline,
    /// External program invoked once per stage
    Command,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TierModels {
    pub simple: Option<String>,
    pub medium: Option<String>,
    pub complex: Option<String>,
}

impl TierModels {
    pub fn for_tier(&self, tier: ComplexityTier) -> Option<&str> {
        match tier {
            ComplexityTier::Simple => self.simple.as_deref(),
            ComplexityTier::Medium => self.medium.as_deref(),
            ComplexityTier::Complex => self.complex.as_deref(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub kind: BackendKind,
    pub program: String,
    /// Arguments placed before the model flag and the prompt
    pub args: Vec<String>,
    pub model_flag: Option<String>,
    pub max_tokens_flag: Option<String>,
    /// Directory the program runs in; inherited when unset
    pub working_dir: Option<PathBuf>,
    pub tier_models: TierModels,
    pub max_tokens: u32,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: BackendKind::Offline,
            program: "llm".to_string(),
            args: Vec::new(),
            model_flag: Some("--model".to_string()),
            max_tokens_flag: None,
            working_dir: None,
            tier_models: TierModels::default(),
            max_tokens: 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    pub max_input_chars: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            max_input_chars: 8192,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub default_top_k: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self { default_top_k: 5 }
    }
}

/// Card confidence: `base * degradation_factor^issues`, never below `floor`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfidenceConfig {
    pub base: f64,
    pub degradation_factor: f64,
    pub floor: f64,
}

impl Default for ConfidenceConfig {
    fn default() -> Self {
        Self {
            base: 0.9,
            degradation_factor: 0.7,
            floor: 0.1,
        }
    }
}

impl ConfidenceConfig {
    pub fn score(&self, issues: usize) -> f64 {
        let exponent = i32::try_from(issues).unwrap_or(i32::MAX);
        let raw = self.base * self.degradation_factor.powi(exponent);
        raw.max(self.floor).clamp(0.0, 1.0)
    }
}

impl PipelineConfig {
    /// Load from a YAML file; missing sections take their defaults
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: PipelineConfig = serde_yaml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Config rooted at `data_dir`, everything else default
    pub fn in_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.embedding.dimension == 0 {
            return Err(Error::Config(
                "embedding.dimension must be greater than 0".to_string(),
            ));
        }

        if self.search.default_top_k == 0 {
            return Err(Error::Config(
                "search.default_top_k must be greater than 0".to_string(),
            ));
        }

        if self.router.max_input_chars == 0 {
            return Err(Error::Config(
                "router.max_input_chars must be greater than 0".to_string(),
            ));
        }

        let c = &self.confidence;
        if !(0.0..=1.0).contains(&c.floor) {
            return Err(Error::Config(
                "confidence.floor must be between 0.0 and 1.0".to_string(),
            ));
        }
        if !(c.degradation_factor > 0.0 && c.degradation_factor <= 1.0) {
            return Err(Error::Config(
                "confidence.degradation_factor must be in (0.0, 1.0]".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&c.base) {
            return Err(Error::Config(
                "confidence.base must be between 0.0 and 1.0".to_string(),
            ));
        }

        if self.backend.kind == BackendKind::Command && self.backend.program.trim().is_empty() {
            return Err(Error::Config(
                "backend.program is required for the command backend".to_string(),
            ));
        }
        if let Some(ref dir) = self.backend.working_dir {
            if !dir.is_dir() {
                return Err(Error::Config(format!(
                    "backend.working_dir {:?} is not a directory",
                    dir
                )));
            }
        }

        Ok(())
    }
}

/// `$INSIGHT_RELAY_DATA_DIR`, else the platform data dir, else `./data`
pub fn default_data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var(DATA_DIR_ENV) {
        if !dir.trim().is_empty() {
            return PathBuf::from(dir);
        }
    }
    dirs::data_dir()
        .map(|d| d.join("insight-relay"))
        .unwrap_or_else(|| PathBuf::from("./data"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_are_valid() {
        let config = PipelineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.embedding.dimension, 256);
        assert_eq!(config.search.default_top_k, 5);
        assert_eq!(config.backend.kind, BackendKind::Offline);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = PipelineConfig::default();
        config.embedding.dimension = 0;
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::default();
        config.confidence.degradation_factor = 0.0;
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::default();
        config.confidence.floor = 1.5;
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::default();
        config.search.default_top_k = 0;
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::default();
        config.backend.working_dir = Some(PathBuf::from("/nonexistent/insight-relay"));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_confidence_score() {
        let c = ConfidenceConfig::default();
        assert!((c.score(0) - 0.9).abs() < 1e-9);
        assert!((c.score(1) - 0.63).abs() < 1e-9);
        assert!((c.score(2) - 0.441).abs() < 1e-9);
        assert!((c.score(50) - 0.1).abs() < 1e-9);
    }

    #[test]
    fn test_load_partial_yaml() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.yaml");
        std::fs::write(
            &path,
            "data_dir: /tmp/relay\n\
             stage_timeout_secs: 30\n\
             backend:\n  kind: command\n  program: my-llm\n  tier_models:\n    complex: large\n",
        )
        .unwrap();

        let config = PipelineConfig::load(&path).unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/tmp/relay"));
        assert_eq!(config.stage_timeout_secs, Some(30));
        assert_eq!(config.backend.kind, BackendKind::Command);
        assert_eq!(
            config.backend.tier_models.for_tier(ComplexityTier::Complex),
            Some("large")
        );
        assert_eq!(config.backend.tier_models.for_tier(ComplexityTier::Simple), None);
        assert_eq!(config.router.max_input_chars, 8192);
    }

    #[test]
    fn test_load_rejects_invalid() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.yaml");
        std::fs::write(&path, "embedding:\n  dimension: 0\n").unwrap();
        assert!(matches!(PipelineConfig::load(&path), Err(Error::Config(_))));
    }
}
