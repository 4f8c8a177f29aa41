//! Shared services handed to every stage agent

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, info};

use crate::agents::builtin_skills;
use crate::backend::BackendSet;
use crate::config::{EmbeddingProvider, PipelineConfig};
use crate::error::{Error, Result};
use crate::hub::MessageHub;
use crate::memory::{Embedder, HashingEmbedder, KnowledgeMemory};
use crate::router::ModelRouter;
use crate::skills::SkillRegistry;

pub struct AppContext {
    pub config: PipelineConfig,
    pub skills: Arc<SkillRegistry>,
    pub router: ModelRouter,
    pub backends: BackendSet,
    pub memory: Arc<KnowledgeMemory>,
}

impl AppContext {
    /// Build everything from configuration, backends included
    pub async fn build(config: PipelineConfig) -> Result<Arc<Self>> {
        let backends = BackendSet::from_config(&config.backend);
        Self::with_backends(config, backends).await
    }

    /// Same as [`build`](Self::build) with caller-supplied backends
    pub async fn with_backends(config: PipelineConfig, backends: BackendSet) -> Result<Arc<Self>> {
        config.validate()?;
        std::fs::create_dir_all(&config.data_dir)?;

        let embedder = embedder_for(&config)?;
        let memory = Arc::new(KnowledgeMemory::open(&config.data_dir, embedder)?);
        let router = ModelRouter::new(config.router.max_input_chars);

        let skills = Arc::new(SkillRegistry::new());
        for (skill, handler) in builtin_skills(router.clone()) {
            skills.register(skill, handler).await;
        }

        let ctx = Self {
            skills,
            router,
            backends,
            memory,
            config,
        };
        let restored = ctx.skills.restore_usage(ctx.skills_path()).await?;
        if restored > 0 {
            debug!("Restored usage for {} skills", restored);
        }

        info!("Pipeline context ready at {:?}", ctx.config.data_dir);
        Ok(Arc::new(ctx))
    }

    pub fn skills_path(&self) -> PathBuf {
        self.config.data_dir.join("skills.json")
    }

    /// Persist skill usage counters next to the other tables
    pub async fn save_skills(&self) -> Result<()> {
        self.skills.save(self.skills_path()).await
    }

    /// Open the hub over this context's memory
    pub fn open_hub(&self) -> Result<Arc<MessageHub>> {
        Ok(Arc::new(MessageHub::open(
            &self.config.data_dir,
            self.memory.clone(),
        )?))
    }
}

fn embedder_for(config: &PipelineConfig) -> Result<Arc<dyn Embedder>> {
    match config.embedding.provider {
        EmbeddingProvider::Hashing => Ok(Arc::new(HashingEmbedder::new(
            config.embedding.dimension,
        )?)),
        #[cfg(feature = "fastembed-embeddings")]
        EmbeddingProvider::Fastembed => Ok(Arc::new(crate::memory::FastEmbedder::new()?)),
        #[cfg(not(feature = "fastembed-embeddings"))]
        EmbeddingProvider::Fastembed => Err(Error::Config(
            "embedding provider 'fastembed' needs the fastembed-embeddings feature".to_string(),
        )),
    }
}
