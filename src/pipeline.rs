//! Drives tasks through the five stages via the hub
//!
//! The pipeline owns no task state. Before every run it rebuilds the stage
//! input from what the hub has accepted, so an interrupted task resumes at
//! its stage cursor.

use std::sync::Arc;

use futures::future::join_all;
use tracing::{debug, error, info, warn};

use crate::agents::{default_agents, StageAgent, StageInput};
use crate::context::AppContext;
use crate::error::{Error, Result};
use crate::hub::{MessageHub, Stage, Task};

pub struct Pipeline {
    ctx: Arc<AppContext>,
    hub: Arc<MessageHub>,
    agents: Vec<Box<dyn StageAgent>>,
}

impl Pipeline {
    pub fn new(ctx: Arc<AppContext>, hub: Arc<MessageHub>) -> Self {
        let agents = default_agents(&ctx);
        Self::with_agents(ctx, hub, agents)
    }

    /// Pipeline with a custom agent line-up, looked up by stage
    pub fn with_agents(
        ctx: Arc<AppContext>,
        hub: Arc<MessageHub>,
        agents: Vec<Box<dyn StageAgent>>,
    ) -> Self {
        Self { ctx, hub, agents }
    }

    pub fn hub(&self) -> &Arc<MessageHub> {
        &self.hub
    }

    pub fn context(&self) -> &Arc<AppContext> {
        &self.ctx
    }

    /// Submit a task and run it to completion or failure
    pub async fn run(&self, description: &str, raw_material: &str) -> Result<Task> {
        let task_id = self.hub.submit_task(description, raw_material).await?;
        self.resume(&task_id).await
    }

    /// Run the remaining stages of a task.
    ///
    /// A stage failure marks the task failed and is returned as the task's
    /// state, not as an error. When another driver advances the same task,
    /// the hub's sequence error makes this one pick up from the hub's cursor.
    /// Errors are reserved for the hub itself.
    pub async fn resume(&self, task_id: &str) -> Result<Task> {
        let mut task = self.hub.get_task_state(task_id).await?;
        if task.status.is_terminal() {
            return Ok(task);
        }

        let mut input = self.load_input(&task).await?;
        while let Some(stage) = task.expected_stage() {
            let agent = self.agent(stage)?;
            info!("Task {}: running {}", task_id, stage);

            let payload = match agent.run(task_id, &input).await {
                Ok(payload) => payload,
                Err(e) => {
                    task = self.fail(task_id, stage, e).await?;
                    if !task.status.is_terminal() {
                        input = self.load_input(&task).await?;
                    }
                    continue;
                }
            };
            input.absorb(&payload);

            match self
                .hub
                .receive_result(task_id, stage, payload, stage.as_str())
                .await
            {
                Ok(_) => task = self.hub.get_task_state(task_id).await?,
                Err(Error::Sequence { .. }) => {
                    task = self.hub.get_task_state(task_id).await?;
                    debug!(
                        "Task {}: {} result superseded, continuing at cursor {}",
                        task_id, stage, task.stage_cursor
                    );
                    input = self.load_input(&task).await?;
                }
                Err(e @ Error::InvalidPayload(_)) => {
                    task = self.fail(task_id, stage, e).await?;
                    if !task.status.is_terminal() {
                        input = self.load_input(&task).await?;
                    }
                }
                Err(e) => return Err(e),
            }
        }

        if task.is_completed() {
            info!("Task {}: completed with {} cards", task_id, task.card_ids.len());
        }
        self.save_skills().await;
        Ok(task)
    }

    /// Run several tasks concurrently; results come back in input order
    pub async fn run_many(self: &Arc<Self>, jobs: Vec<(String, String)>) -> Vec<Result<Task>> {
        let handles: Vec<_> = jobs
            .into_iter()
            .map(|(description, raw_material)| {
                let pipeline = Arc::clone(self);
                tokio::spawn(async move { pipeline.run(&description, &raw_material).await })
            })
            .collect();

        join_all(handles)
            .await
            .into_iter()
            .map(|joined| joined.unwrap_or_else(|e| Err(Error::Other(format!("task panicked: {}", e)))))
            .collect()
    }

    async fn load_input(&self, task: &Task) -> Result<StageInput> {
        let raw_material = self.hub.raw_material(&task.task_id).await?;
        let mut input = StageInput::new(&task.task_id, &task.description, raw_material);
        input.prepared = self.hub.prepared_material(&task.task_id).await?;
        for card in self.hub.cards(&task.task_id).await? {
            input.absorb_card(&card);
        }
        input.links = self.hub.causal_links(&task.task_id).await?;
        Ok(input)
    }

    fn agent(&self, stage: Stage) -> Result<&dyn StageAgent> {
        self.agents
            .iter()
            .find(|a| a.stage() == stage)
            .map(|a| a.as_ref())
            .ok_or_else(|| Error::Config(format!("no agent configured for stage {}", stage)))
    }

    /// Mark the task failed at `stage` and return its state. If another
    /// driver already moved past `stage`, the task is left as it is.
    async fn fail(&self, task_id: &str, stage: Stage, error: Error) -> Result<Task> {
        if error.is_stage_failure() {
            warn!("Task {}: {} failed: {}", task_id, stage, error);
        } else {
            error!("Task {}: {} failed unexpectedly: {}", task_id, stage, error);
        }
        let task = match self.hub.fail_task(task_id, stage, &error).await {
            Ok(task) => task,
            // Another driver moved the task on; report where it is now
            Err(Error::Sequence { .. }) => self.hub.get_task_state(task_id).await?,
            Err(e) => return Err(e),
        };
        self.save_skills().await;
        Ok(task)
    }

    async fn save_skills(&self) {
        if let Err(e) = self.ctx.save_skills().await {
            warn!("Failed to save skill usage: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::testing::{context, SCHEDULE_TABLE};
    use crate::hub::TaskStatus;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_offline_run_completes_degraded() {
        let tmp = TempDir::new().unwrap();
        let ctx = context(tmp.path(), "").await;
        let hub = ctx.open_hub().unwrap();
        let pipeline = Pipeline::new(ctx, hub.clone());

        let task = pipeline
            .run("Analyze the schedule slip", SCHEDULE_TABLE)
            .await
            .unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.stage_cursor, Stage::ALL.len());

        let cards = hub.cards(&task.task_id).await.unwrap();
        assert_eq!(cards.len(), 4);
        assert_eq!(cards[0].facts().unwrap().headline, "design stage delayed");
    }

    #[tokio::test]
    async fn test_resume_of_finished_task_is_noop() {
        let tmp = TempDir::new().unwrap();
        let ctx = context(tmp.path(), "").await;
        let hub = ctx.open_hub().unwrap();
        let pipeline = Pipeline::new(ctx, hub.clone());

        let task = pipeline.run("Analyze", SCHEDULE_TABLE).await.unwrap();
        let audit_before = hub.audit_log(&task.task_id).await.unwrap().len();
        let again = pipeline.resume(&task.task_id).await.unwrap();
        assert_eq!(again, task);
        assert_eq!(hub.audit_log(&task.task_id).await.unwrap().len(), audit_before);
    }

    #[tokio::test]
    async fn test_missing_agent_is_error() {
        let tmp = TempDir::new().unwrap();
        let ctx = context(tmp.path(), "").await;
        let hub = ctx.open_hub().unwrap();
        let pipeline = Pipeline::with_agents(ctx, hub, Vec::new());

        let result = pipeline.run("Analyze", SCHEDULE_TABLE).await;
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
