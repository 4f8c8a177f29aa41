pub mod agents;
pub mod backend;
pub mod card;
pub mod config;
pub mod context;
pub mod error;
pub mod hub;
pub mod memory;
pub mod pipeline;
pub mod router;
pub mod skills;

pub use agents::{StageAgent, StageInput};
pub use backend::{BackendSet, CommandBackend, InferenceBackend, OfflineBackend};
pub use card::{CardContent, CardType, CausalLink, KnowledgeCard};
pub use config::PipelineConfig;
pub use context::AppContext;
pub use error::{Error, Result};
pub use hub::{Ack, AuditEntry, MessageHub, Stage, StagePayload, Task, TaskStatus};
pub use memory::{Embedder, HashingEmbedder, KnowledgeMemory, SearchHit};
pub use pipeline::Pipeline;
pub use router::{ComplexityTier, ModelBackend, ModelRouter, RouteDecision};
pub use skills::{Skill, SkillHandler, SkillRegistry};
