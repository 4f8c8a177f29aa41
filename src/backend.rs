//! Inference backends
//!
//! Stage agents only see the [`InferenceBackend`] contract. The command
//! backend shells out to an external program per call; the offline backend
//! answers every prompt with an empty completion.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::config::{BackendConfig, BackendKind};
use crate::error::{Error, Result};
use crate::router::{ComplexityTier, ModelBackend, RouteDecision};

#[async_trait]
pub trait InferenceBackend: Send + Sync {
    fn name(&self) -> &str;

    async fn generate(&self, prompt: &str, max_tokens: u32) -> Result<String>;
}

/// Runs an external program with the prompt as its last argument
#[derive(Debug, Clone)]
pub struct CommandBackend {
    program: PathBuf,
    args: Vec<String>,
    model_flag: Option<String>,
    model: Option<String>,
    max_tokens_flag: Option<String>,
    working_dir: Option<PathBuf>,
}

impl CommandBackend {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            model_flag: None,
            model: None,
            max_tokens_flag: None,
            working_dir: None,
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    /// Pass `<flag> <model>` before the prompt
    pub fn with_model(mut self, flag: impl Into<String>, model: impl Into<String>) -> Self {
        self.model_flag = Some(flag.into());
        self.model = Some(model.into());
        self
    }

    pub fn with_max_tokens_flag(mut self, flag: impl Into<String>) -> Self {
        self.max_tokens_flag = Some(flag.into());
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    fn command(&self, prompt: &str, max_tokens: u32) -> Command {
        let mut cmd = Command::new(&self.program);
        if let Some(ref dir) = self.working_dir {
            cmd.current_dir(dir);
        }

        cmd.args(&self.args);

        if let (Some(flag), Some(model)) = (&self.model_flag, &self.model) {
            cmd.arg(flag).arg(model);
        }

        if let Some(ref flag) = self.max_tokens_flag {
            cmd.arg(flag).arg(max_tokens.to_string());
        }

        // Prompt must be last
        cmd.arg(prompt);

        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl InferenceBackend for CommandBackend {
    fn name(&self) -> &str {
        self.model.as_deref().unwrap_or("command")
    }

    async fn generate(&self, prompt: &str, max_tokens: u32) -> Result<String> {
        let mut cmd = self.command(prompt, max_tokens);
        debug!("Running backend command: {:?}", self.program);

        let output = cmd.output().await.map_err(|e| Error::Backend {
            stage: String::new(),
            message: format!("failed to execute {}: {}", self.program.display(), e),
        })?;

        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.trim().is_empty() {
            warn!("backend stderr: {}", stderr.trim());
        }

        if !output.status.success() {
            return Err(Error::Backend {
                stage: String::new(),
                message: format!(
                    "{} exited with code {}: {}",
                    self.program.display(),
                    output.status.code().unwrap_or(-1),
                    stderr.lines().next().unwrap_or("")
                ),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

/// Backend that never produces text
#[derive(Debug, Clone, Copy, Default)]
pub struct OfflineBackend;

#[async_trait]
impl InferenceBackend for OfflineBackend {
    fn name(&self) -> &str {
        "offline"
    }

    async fn generate(&self, _prompt: &str, _max_tokens: u32) -> Result<String> {
        Ok(String::new())
    }
}

/// Backends keyed by capability class, with a shared default
#[derive(Clone)]
pub struct BackendSet {
    default: Arc<dyn InferenceBackend>,
    overrides: HashMap<ModelBackend, Arc<dyn InferenceBackend>>,
    max_tokens: u32,
}

impl BackendSet {
    pub fn new(default: Arc<dyn InferenceBackend>) -> Self {
        Self {
            default,
            overrides: HashMap::new(),
            max_tokens: 1024,
        }
    }

    pub fn offline() -> Self {
        Self::new(Arc::new(OfflineBackend))
    }

    pub fn with_backend(mut self, class: ModelBackend, backend: Arc<dyn InferenceBackend>) -> Self {
        self.overrides.insert(class, backend);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    /// Build from config; each tier with a configured model gets its own command
    pub fn from_config(config: &BackendConfig) -> Self {
        let set = match config.kind {
            BackendKind::Offline => Self::offline(),
            BackendKind::Command => {
                let base = CommandBackend::new(&config.program).with_args(config.args.clone());
                let base = match config.max_tokens_flag {
                    Some(ref flag) => base.with_max_tokens_flag(flag),
                    None => base,
                };
                let base = match config.working_dir {
                    Some(ref dir) => base.with_working_dir(dir),
                    None => base,
                };

                let mut set = Self::new(Arc::new(base.clone()));
                if let Some(ref flag) = config.model_flag {
                    for tier in [
                        ComplexityTier::Simple,
                        ComplexityTier::Medium,
                        ComplexityTier::Complex,
                    ] {
                        if let Some(model) = config.tier_models.for_tier(tier) {
                            let backend = base.clone().with_model(flag, model);
                            set = set.with_backend(tier.backend(), Arc::new(backend));
                        }
                    }
                }
                set
            }
        };
        set.with_max_tokens(config.max_tokens)
    }

    pub fn max_tokens(&self) -> u32 {
        self.max_tokens
    }

    pub fn select(&self, decision: &RouteDecision) -> Arc<dyn InferenceBackend> {
        self.overrides
            .get(&decision.backend)
            .cloned()
            .unwrap_or_else(|| self.default.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TierModels;
    use crate::router::ModelRouter;

    struct Fixed(&'static str);

    #[async_trait]
    impl InferenceBackend for Fixed {
        fn name(&self) -> &str {
            self.0
        }

        async fn generate(&self, _prompt: &str, _max_tokens: u32) -> Result<String> {
            Ok(self.0.to_string())
        }
    }

    #[tokio::test]
    async fn test_offline_returns_empty() {
        assert_eq!(OfflineBackend.generate("anything", 10).await.unwrap(), "");
    }

    #[tokio::test]
    async fn test_select_prefers_override() {
        let set = BackendSet::new(Arc::new(Fixed("default")))
            .with_backend(ModelBackend::Flagship, Arc::new(Fixed("flagship")));
        let router = ModelRouter::default();

        let simple = set.select(&router.route("hello there"));
        assert_eq!(simple.generate("", 1).await.unwrap(), "default");

        let fallback = set.select(&ModelRouter::new(1).route("too long"));
        assert_eq!(fallback.generate("", 1).await.unwrap(), "flagship");
    }

    #[test]
    fn test_from_config_maps_tier_models() {
        let config = BackendConfig {
            kind: BackendKind::Command,
            program: "llm".to_string(),
            tier_models: TierModels {
                simple: Some("small".to_string()),
                medium: None,
                complex: Some("large".to_string()),
            },
            max_tokens: 256,
            ..Default::default()
        };
        let set = BackendSet::from_config(&config);
        assert_eq!(set.max_tokens(), 256);
        assert_eq!(set.overrides.len(), 2);
        assert_eq!(set.overrides[&ModelBackend::Flagship].name(), "large");
        assert_eq!(set.overrides[&ModelBackend::Compact].name(), "small");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_backend_echoes_prompt() {
        let backend = CommandBackend::new("echo");
        let out = backend.generate("design stage delayed", 16).await.unwrap();
        assert_eq!(out.trim(), "design stage delayed");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_backend_failure_is_backend_error() {
        let backend = CommandBackend::new("false");
        assert!(matches!(
            backend.generate("x", 16).await,
            Err(Error::Backend { .. })
        ));

        let missing = CommandBackend::new("/nonexistent/insight-relay-backend");
        assert!(matches!(
            missing.generate("x", 16).await,
            Err(Error::Backend { .. })
        ));
    }
}
