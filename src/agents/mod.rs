//! Stage agents
//!
//! Every stage runs the same two phases: build a prompt and make a single
//! backend call, then parse the reply deterministically into the stage's
//! output. Unusable replies never fail a stage; they lower the confidence
//! of what the stage emits. Only backend failures are raised.

pub mod action_advisor;
pub mod fact_extractor;
pub mod interpreter;
pub mod parse;
pub mod preprocessor;
pub mod risk_detector;

pub use action_advisor::ActionAdvisor;
pub use fact_extractor::FactExtractor;
pub use interpreter::Interpreter;
pub use preprocessor::Preprocessor;
pub use risk_detector::RiskDetector;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::card::{CardType, CausalLink, FactSheet, Interpretation, KnowledgeCard, RiskAssessment};
use crate::context::AppContext;
use crate::error::{Error, Result};
use crate::hub::{PreparedMaterial, Stage, StagePayload};
use crate::router::ModelRouter;
use crate::skills::{Skill, SkillHandler};

/// What a stage can see: the task plus every result accepted before it
#[derive(Debug, Clone, Default)]
pub struct StageInput {
    pub task_id: String,
    pub description: String,
    pub raw_material: String,
    pub prepared: Option<PreparedMaterial>,
    pub facts: Option<KnowledgeCard>,
    pub interpretation: Option<KnowledgeCard>,
    pub links: Vec<CausalLink>,
    pub risk: Option<KnowledgeCard>,
}

impl StageInput {
    pub fn new(
        task_id: impl Into<String>,
        description: impl Into<String>,
        raw_material: impl Into<String>,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            description: description.into(),
            raw_material: raw_material.into(),
            ..Default::default()
        }
    }

    /// Fold an accepted payload into the input of later stages
    pub fn absorb(&mut self, payload: &StagePayload) {
        match payload {
            StagePayload::Prepared(material) => self.prepared = Some(material.clone()),
            StagePayload::Card(card) => self.absorb_card(card),
            StagePayload::Interpretation { card, links } => {
                self.interpretation = Some(card.clone());
                self.links = links.clone();
            }
        }
    }

    pub fn absorb_card(&mut self, card: &KnowledgeCard) {
        match card.card_type {
            CardType::Fact => self.facts = Some(card.clone()),
            CardType::Interpretation => self.interpretation = Some(card.clone()),
            CardType::Risk => self.risk = Some(card.clone()),
            CardType::Action => {}
        }
    }

    pub fn require_prepared(&self) -> Result<&PreparedMaterial> {
        self.prepared
            .as_ref()
            .ok_or_else(|| missing_input(&self.task_id, "preprocessed material"))
    }

    pub fn require_facts(&self) -> Result<(&KnowledgeCard, &FactSheet)> {
        let card = self
            .facts
            .as_ref()
            .ok_or_else(|| missing_input(&self.task_id, "fact card"))?;
        let sheet = card
            .facts()
            .ok_or_else(|| missing_input(&self.task_id, "fact content"))?;
        Ok((card, sheet))
    }

    pub fn require_interpretation(&self) -> Result<(&KnowledgeCard, &Interpretation)> {
        let card = self
            .interpretation
            .as_ref()
            .ok_or_else(|| missing_input(&self.task_id, "interpretation card"))?;
        let interp = card
            .interpretation()
            .ok_or_else(|| missing_input(&self.task_id, "interpretation content"))?;
        Ok((card, interp))
    }

    pub fn require_risk(&self) -> Result<(&KnowledgeCard, &RiskAssessment)> {
        let card = self
            .risk
            .as_ref()
            .ok_or_else(|| missing_input(&self.task_id, "risk card"))?;
        let risk = card
            .risk()
            .ok_or_else(|| missing_input(&self.task_id, "risk content"))?;
        Ok((card, risk))
    }
}

fn missing_input(task_id: &str, what: &str) -> Error {
    Error::InvalidPayload(format!("task {} has no {} yet", task_id, what))
}

#[async_trait]
pub trait StageAgent: Send + Sync {
    fn stage(&self) -> Stage;

    async fn run(&self, task_id: &str, input: &StageInput) -> Result<StagePayload>;
}

/// The five agents in stage order
pub fn default_agents(ctx: &Arc<AppContext>) -> Vec<Box<dyn StageAgent>> {
    vec![
        Box::new(Preprocessor::new(ctx.clone())),
        Box::new(FactExtractor::new(ctx.clone())),
        Box::new(Interpreter::new(ctx.clone())),
        Box::new(RiskDetector::new(ctx.clone())),
        Box::new(ActionAdvisor::new(ctx.clone())),
    ]
}

/// Route the prompt, then make the stage's single backend call.
///
/// Any failure, including the optional stage timeout, is reported as a
/// failure of `stage`.
pub async fn call_backend(ctx: &AppContext, stage: Stage, prompt: &str) -> Result<String> {
    let decision = ctx.router.route(prompt);
    let backend = ctx.backends.select(&decision);
    debug!(
        "{}: calling {} backend ({})",
        stage,
        decision.backend.as_str(),
        backend.name()
    );

    let call = backend.generate(prompt, ctx.backends.max_tokens());
    let result = match ctx.config.stage_timeout_secs {
        Some(seconds) => tokio::time::timeout(Duration::from_secs(seconds), call)
            .await
            .map_err(|_| Error::Timeout {
                stage: stage.to_string(),
                seconds,
            })?,
        None => call.await,
    };

    result.map_err(|e| match e {
        Error::Backend { message, .. } => Error::Backend {
            stage: stage.to_string(),
            message,
        },
        Error::Timeout { seconds, .. } => Error::Timeout {
            stage: stage.to_string(),
            seconds,
        },
        other => Error::Backend {
            stage: stage.to_string(),
            message: other.to_string(),
        },
    })
}

/// Invoke a registered skill and decode its result.
///
/// A missing or disabled skill is not fatal: `direct` runs the same logic
/// outside the registry.
pub async fn run_skill<T: DeserializeOwned>(
    ctx: &AppContext,
    name: &str,
    args: Value,
    direct: fn(Value) -> Result<Value>,
) -> Result<T> {
    let value = match ctx.skills.invoke(name, args.clone()).await {
        Ok(value) => value,
        Err(e @ (Error::SkillNotFound(_) | Error::SkillDisabled(_))) => {
            warn!("{}; running it outside the registry", e);
            direct(args)?
        }
        Err(e) => return Err(e),
    };
    Ok(serde_json::from_value(value)?)
}

/// Built-in deterministic skills, one per stage step plus routing
pub fn builtin_skills(router: ModelRouter) -> Vec<(Skill, SkillHandler)> {
    let route: SkillHandler = Arc::new(move |args: Value| {
        let text = args
            .get("text")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::InvalidPayload("route_query needs a text argument".into()))?;
        Ok(serde_json::to_value(router.route(text))?)
    });

    vec![
        (
            Skill::new("sniff_shape", "parsing", Stage::Preprocessor.as_str()),
            Arc::new(preprocessor::sniff_shape) as SkillHandler,
        ),
        (
            Skill::new("profile_quality", "parsing", Stage::Preprocessor.as_str()),
            Arc::new(preprocessor::profile_quality) as SkillHandler,
        ),
        (
            Skill::new("scan_deviations", "analysis", Stage::FactExtractor.as_str()),
            Arc::new(fact_extractor::scan_deviations) as SkillHandler,
        ),
        (
            Skill::new("rank_factors", "analysis", Stage::Interpreter.as_str()),
            Arc::new(interpreter::rank_factors) as SkillHandler,
        ),
        (
            Skill::new("classify_risk", "classification", Stage::RiskDetector.as_str()),
            Arc::new(risk_detector::classify_risk) as SkillHandler,
        ),
        (
            Skill::new("plan_timeline", "planning", Stage::ActionAdvisor.as_str()),
            Arc::new(action_advisor::plan_timeline) as SkillHandler,
        ),
        (Skill::new("route_query", "routing", "router"), route),
    ]
}

/// Shorthand for `{"text": ...}` arguments
pub(crate) fn text_args(text: &str) -> Value {
    json!({ "text": text })
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::backend::{BackendSet, InferenceBackend};
    use crate::config::PipelineConfig;
    use std::path::Path;

    /// Backend that answers every prompt with the same text
    pub struct Canned(pub String);

    #[async_trait]
    impl InferenceBackend for Canned {
        fn name(&self) -> &str {
            "canned"
        }

        async fn generate(&self, _prompt: &str, _max_tokens: u32) -> Result<String> {
            Ok(self.0.clone())
        }
    }

    pub async fn context(dir: &Path, reply: &str) -> Arc<AppContext> {
        let mut config = PipelineConfig::in_dir(dir);
        config.embedding.dimension = 64;
        let backends = BackendSet::new(Arc::new(Canned(reply.to_string())));
        AppContext::with_backends(config, backends).await.unwrap()
    }

    pub const SCHEDULE_TABLE: &str = "\
| Stage | Planned Days | Actual Days | Owner | Status |
|---|---|---|---|---|
| Requirements | 10 | 10 | Kim | done |
| Design | 15 | 25 | Lee | delayed |
| Build | 30 | | Park | pending |
| Test | 10 | - | | pending |
";
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_absorb_collects_stage_outputs() {
        let mut input = StageInput::new("task-1", "analyze slip", "raw");
        assert!(input.require_prepared().is_err());

        let card = KnowledgeCard::new(
            "task-1",
            "design stage delayed",
            crate::card::CardContent::Fact(FactSheet {
                facts: vec![],
                headline: "design stage delayed".to_string(),
            }),
            0.9,
        );
        input.absorb(&StagePayload::Card(card));
        let (_, sheet) = input.require_facts().unwrap();
        assert_eq!(sheet.headline, "design stage delayed");
        assert!(input.require_risk().is_err());
    }

    #[tokio::test]
    async fn test_disabled_skill_falls_back_to_direct_logic() {
        let tmp = TempDir::new().unwrap();
        let ctx = context(tmp.path(), "").await;
        ctx.skills.set_enabled("rank_factors", false).await.unwrap();

        let ranked: interpreter::RankedFactors = run_skill(
            &ctx,
            "rank_factors",
            text_args("1. Staffing - 40%"),
            interpreter::rank_factors,
        )
        .await
        .unwrap();
        assert_eq!(ranked.factors.len(), 1);
        assert_eq!(ctx.skills.get("rank_factors").await.unwrap().usage_count, 0);
    }

    #[tokio::test]
    async fn test_route_query_skill() {
        let tmp = TempDir::new().unwrap();
        let ctx = context(tmp.path(), "").await;
        let out = ctx
            .skills
            .invoke("route_query", text_args("hello there"))
            .await
            .unwrap();
        assert_eq!(out["tier"], "simple");
        assert_eq!(out["backend"], "compact");
    }

    #[tokio::test]
    async fn test_stage_timeout_is_stage_failure() {
        struct Slow;

        #[async_trait]
        impl crate::backend::InferenceBackend for Slow {
            fn name(&self) -> &str {
                "slow"
            }

            async fn generate(&self, _prompt: &str, _max_tokens: u32) -> Result<String> {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(String::new())
            }
        }

        let tmp = TempDir::new().unwrap();
        let mut config = crate::config::PipelineConfig::in_dir(tmp.path());
        config.stage_timeout_secs = Some(0);
        let ctx = AppContext::with_backends(config, crate::backend::BackendSet::new(Arc::new(Slow)))
            .await
            .unwrap();

        let err = call_backend(&ctx, Stage::Interpreter, "why").await.unwrap_err();
        assert!(matches!(err, Error::Timeout { ref stage, .. } if stage == "interpreter"));
        assert!(err.is_stage_failure());
    }
}
