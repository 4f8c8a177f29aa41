//! Message hub: sequencing authority for analysis tasks
//!
//! Stage agents never talk to each other. Each one posts its result to the
//! hub, which checks the result against the task's stage cursor, persists
//! it, advances the cursor and appends an audit entry. The hub does not run
//! stages itself; a driver such as [`crate::pipeline::Pipeline`] does.

pub mod audit;
pub mod task;

pub use audit::{AuditEntry, AuditLog};
pub use task::{
    MaterialShape, PreparedMaterial, QualityLabel, Stage, StageFailure, Task, TaskStatus,
};

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::card::{validate_chain, CardType, CausalLink, KnowledgeCard};
use crate::error::{Error, Result};
use crate::memory::KnowledgeMemory;

/// Result a stage agent hands to the hub
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StagePayload {
    Prepared(PreparedMaterial),
    Card(KnowledgeCard),
    Interpretation {
        card: KnowledgeCard,
        links: Vec<CausalLink>,
    },
}

impl StagePayload {
    pub fn card(&self) -> Option<&KnowledgeCard> {
        match self {
            StagePayload::Prepared(_) => None,
            StagePayload::Card(card) => Some(card),
            StagePayload::Interpretation { card, .. } => Some(card),
        }
    }

    fn check_for(&self, task_id: &str, stage: Stage) -> Result<()> {
        let expected = stage.card_type();
        match (self, expected) {
            (StagePayload::Prepared(_), None) => Ok(()),
            (StagePayload::Card(card), Some(card_type))
                if card_type != CardType::Interpretation =>
            {
                check_card(card, task_id, card_type)
            }
            (StagePayload::Interpretation { card, links }, Some(card_type))
                if card_type == CardType::Interpretation =>
            {
                check_card(card, task_id, card_type)?;
                if let Some(stray) = links.iter().find(|l| l.task_id != task_id) {
                    return Err(Error::InvalidPayload(format!(
                        "causal link belongs to task {}, expected {}",
                        stray.task_id, task_id
                    )));
                }
                validate_chain(links)
            }
            _ => Err(Error::InvalidPayload(format!(
                "payload kind does not match stage {}",
                stage
            ))),
        }
    }
}

fn check_card(card: &KnowledgeCard, task_id: &str, card_type: CardType) -> Result<()> {
    if card.task_id != task_id {
        return Err(Error::InvalidPayload(format!(
            "card {} belongs to task {}, expected {}",
            card.card_id, card.task_id, task_id
        )));
    }
    if card.card_type != card_type {
        return Err(Error::InvalidPayload(format!(
            "expected a {} card, got {}",
            card_type.as_str(),
            card.card_type.as_str()
        )));
    }
    Ok(())
}

/// Hub acknowledgement of an accepted stage result
#[derive(Debug, Clone, Serialize)]
pub struct Ack {
    pub task_id: String,
    pub stage: Stage,
    pub stage_cursor: usize,
    pub status: TaskStatus,
    pub card_id: Option<String>,
}

/// Everything persisted for one task
#[derive(Debug, Clone, Serialize, Deserialize)]
struct TaskRecord {
    task: Task,
    raw_material: String,
    #[serde(default)]
    prepared: Option<PreparedMaterial>,
    #[serde(default)]
    audit_seq: u64,
}

pub struct MessageHub {
    tasks_dir: PathBuf,
    links_dir: PathBuf,
    audit: AuditLog,
    memory: Arc<KnowledgeMemory>,
    tasks: RwLock<HashMap<String, Arc<Mutex<TaskRecord>>>>,
}

impl MessageHub {
    /// Open the hub's tables under `data_dir`, reloading existing tasks
    pub fn open(data_dir: impl AsRef<Path>, memory: Arc<KnowledgeMemory>) -> Result<Self> {
        let data_dir = data_dir.as_ref();
        let tasks_dir = data_dir.join("tasks");
        let links_dir = data_dir.join("links");
        fs::create_dir_all(&tasks_dir)?;
        fs::create_dir_all(&links_dir)?;
        let audit = AuditLog::open(data_dir.join("audit"))?;

        let mut tasks = HashMap::new();
        for entry in fs::read_dir(&tasks_dir)? {
            let path = entry?.path();
            if !path.extension().is_some_and(|e| e == "json") {
                continue;
            }
            let content = fs::read_to_string(&path)?;
            match serde_json::from_str::<TaskRecord>(&content) {
                Ok(record) => {
                    tasks.insert(record.task.task_id.clone(), Arc::new(Mutex::new(record)));
                }
                Err(e) => warn!("Skipping unreadable task file {:?}: {}", path, e),
            }
        }
        debug!("Message hub loaded {} tasks", tasks.len());

        Ok(Self {
            tasks_dir,
            links_dir,
            audit,
            memory,
            tasks: RwLock::new(tasks),
        })
    }

    /// Register a new task at stage cursor 0; no stage is run
    pub async fn submit_task(&self, description: &str, raw_material: &str) -> Result<String> {
        let record = TaskRecord {
            task: Task::new(description),
            raw_material: raw_material.to_string(),
            prepared: None,
            audit_seq: 0,
        };
        let task_id = record.task.task_id.clone();
        self.save_record(&record)?;

        self.tasks
            .write()
            .await
            .insert(task_id.clone(), Arc::new(Mutex::new(record)));

        info!("Task submitted: {} ({})", task_id, description);
        Ok(task_id)
    }

    /// Accept or reject one stage result.
    ///
    /// Every call for a known task appends exactly one audit entry, whether
    /// the result is accepted or not.
    pub async fn receive_result(
        &self,
        task_id: &str,
        stage: Stage,
        payload: StagePayload,
        sender: &str,
    ) -> Result<Ack> {
        let handle = self.handle(task_id).await?;
        let mut record = handle.lock().await;

        let digest = audit::digest(&serde_json::to_vec(&payload)?);
        let to_agent = stage.next().map(|s| s.as_str()).unwrap_or("hub");

        match self.accept(&mut record, stage, payload).await {
            Ok(ack) => {
                self.record_audit(&mut record, sender, to_agent, digest, true, String::new())?;
                info!(
                    "Task {}: accepted {} result from {} (cursor {})",
                    task_id, stage, sender, ack.stage_cursor
                );
                if ack.status == TaskStatus::Completed {
                    info!("Task {} completed", task_id);
                }
                Ok(ack)
            }
            Err(e) => {
                warn!("Task {}: rejected {} result from {}: {}", task_id, stage, sender, e);
                self.record_audit(&mut record, sender, to_agent, digest, false, e.summary())?;
                Err(e)
            }
        }
    }

    /// Transport-facing name for [`receive_result`](Self::receive_result)
    pub async fn post_result(
        &self,
        task_id: &str,
        stage: Stage,
        payload: StagePayload,
        sender: &str,
    ) -> Result<Ack> {
        self.receive_result(task_id, stage, payload, sender).await
    }

    async fn accept(
        &self,
        record: &mut TaskRecord,
        stage: Stage,
        payload: StagePayload,
    ) -> Result<Ack> {
        let task_id = record.task.task_id.clone();
        let expected = record.task.expected_stage().ok_or_else(|| Error::Sequence {
            task_id: task_id.clone(),
            expected: format!("none (task {})", record.task.status.as_str()),
            got: stage.to_string(),
        })?;
        if stage != expected {
            return Err(Error::Sequence {
                task_id,
                expected: expected.to_string(),
                got: stage.to_string(),
            });
        }
        payload.check_for(&task_id, stage)?;

        // Changes land in `next` and replace the record only once saved
        let mut next = record.clone();
        let card_id = match payload {
            StagePayload::Prepared(material) => {
                next.prepared = Some(material);
                None
            }
            StagePayload::Card(card) => Some(self.memory.add_card(card).await?),
            StagePayload::Interpretation { card, links } => {
                let card_id = self.memory.add_card(card).await?;
                self.save_links(&task_id, &links)?;
                Some(card_id)
            }
        };

        let task = &mut next.task;
        if let Some(ref id) = card_id {
            task.card_ids.push(id.clone());
        }
        task.stage_cursor += 1;
        task.status = if stage.is_terminal() {
            TaskStatus::Completed
        } else {
            TaskStatus::Running
        };
        task.updated_at = Utc::now();
        self.save_record(&next)?;
        *record = next;

        Ok(Ack {
            task_id,
            stage,
            stage_cursor: record.task.stage_cursor,
            status: record.task.status,
            card_id,
        })
    }

    /// Mark a task failed at `stage`; accepted results stay in place.
    ///
    /// Only the stage the task is waiting on can fail it. A failure reported
    /// for any other stage is stale and rejected as a sequence error.
    pub async fn fail_task(&self, task_id: &str, stage: Stage, error: &Error) -> Result<Task> {
        let handle = self.handle(task_id).await?;
        let mut record = handle.lock().await;

        match record.task.expected_stage() {
            Some(expected) if expected == stage => {}
            Some(expected) => {
                return Err(Error::Sequence {
                    task_id: task_id.to_string(),
                    expected: expected.to_string(),
                    got: stage.to_string(),
                })
            }
            None => {
                return Err(Error::Sequence {
                    task_id: task_id.to_string(),
                    expected: format!("none (task {})", record.task.status.as_str()),
                    got: stage.to_string(),
                })
            }
        }

        let summary = error.summary();
        let mut next = record.clone();
        next.task.status = TaskStatus::Failed;
        next.task.failure = Some(StageFailure {
            stage,
            error: summary.clone(),
            failed_at: Utc::now(),
        });
        next.task.updated_at = Utc::now();
        self.save_record(&next)?;
        *record = next;

        let digest = audit::digest(summary.as_bytes());
        self.record_audit(&mut record, stage.as_str(), "hub", digest, false, summary.clone())?;

        warn!("Task {} failed at {}: {}", task_id, stage, summary);
        Ok(record.task.clone())
    }

    pub async fn get_task_state(&self, task_id: &str) -> Result<Task> {
        let handle = self.handle(task_id).await?;
        let record = handle.lock().await;
        Ok(record.task.clone())
    }

    /// Alias of [`get_task_state`](Self::get_task_state)
    pub async fn get_status(&self, task_id: &str) -> Result<Task> {
        self.get_task_state(task_id).await
    }

    pub async fn raw_material(&self, task_id: &str) -> Result<String> {
        let handle = self.handle(task_id).await?;
        let record = handle.lock().await;
        Ok(record.raw_material.clone())
    }

    pub async fn prepared_material(&self, task_id: &str) -> Result<Option<PreparedMaterial>> {
        let handle = self.handle(task_id).await?;
        let record = handle.lock().await;
        Ok(record.prepared.clone())
    }

    pub async fn audit_log(&self, task_id: &str) -> Result<Vec<AuditEntry>> {
        self.handle(task_id).await?;
        self.audit.read(task_id)
    }

    pub async fn causal_links(&self, task_id: &str) -> Result<Vec<CausalLink>> {
        self.handle(task_id).await?;
        let path = self.links_path(task_id);
        if !path.exists() {
            return Ok(Vec::new());
        }
        Ok(serde_json::from_str(&fs::read_to_string(path)?)?)
    }

    /// Cards accepted for a task, in stage order
    pub async fn cards(&self, task_id: &str) -> Result<Vec<KnowledgeCard>> {
        let task = self.get_task_state(task_id).await?;
        let mut cards = Vec::with_capacity(task.card_ids.len());
        for card_id in &task.card_ids {
            let card = self.memory.get(card_id).await.ok_or_else(|| {
                Error::IndexCorruption(format!("card {} of task {} is missing", card_id, task_id))
            })?;
            cards.push(card);
        }
        Ok(cards)
    }

    /// All tasks, oldest first
    pub async fn list_tasks(&self) -> Vec<Task> {
        let handles: Vec<_> = self.tasks.read().await.values().cloned().collect();
        let mut tasks = Vec::with_capacity(handles.len());
        for handle in handles {
            tasks.push(handle.lock().await.task.clone());
        }
        tasks.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.task_id.cmp(&b.task_id))
        });
        tasks
    }

    async fn handle(&self, task_id: &str) -> Result<Arc<Mutex<TaskRecord>>> {
        self.tasks
            .read()
            .await
            .get(task_id)
            .cloned()
            .ok_or_else(|| Error::TaskNotFound(task_id.to_string()))
    }

    fn record_audit(
        &self,
        record: &mut TaskRecord,
        from_agent: &str,
        to_agent: &str,
        payload_digest: String,
        accepted: bool,
        note: String,
    ) -> Result<()> {
        record.audit_seq += 1;
        self.audit.append(&AuditEntry {
            seq: record.audit_seq,
            task_id: record.task.task_id.clone(),
            from_agent: from_agent.to_string(),
            to_agent: to_agent.to_string(),
            timestamp: Utc::now(),
            payload_digest,
            accepted,
            note,
        })?;
        self.save_record(record)
    }

    fn save_record(&self, record: &TaskRecord) -> Result<()> {
        let path = self.tasks_dir.join(format!("{}.json", record.task.task_id));
        fs::write(path, serde_json::to_string_pretty(record)?)?;
        Ok(())
    }

    fn links_path(&self, task_id: &str) -> PathBuf {
        self.links_dir.join(format!("{}.json", task_id))
    }

    fn save_links(&self, task_id: &str, links: &[CausalLink]) -> Result<()> {
        fs::write(self.links_path(task_id), serde_json::to_string_pretty(links)?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::card::{CardContent, FactSheet};
    use crate::memory::HashingEmbedder;
    use tempfile::TempDir;

    fn hub(dir: &Path) -> MessageHub {
        let embedder = Arc::new(HashingEmbedder::new(32).unwrap());
        let memory = Arc::new(KnowledgeMemory::open(dir, embedder).unwrap());
        MessageHub::open(dir, memory).unwrap()
    }

    fn prepared() -> StagePayload {
        StagePayload::Prepared(PreparedMaterial {
            shape: MaterialShape::Prose,
            headers: vec![],
            rows: vec![],
            json: None,
            text: "notes".to_string(),
            missing_cells: 0,
            total_cells: 0,
            quality: 1.0,
            quality_label: QualityLabel::Excellent,
            summary: String::new(),
            confidence: 0.9,
            degradations: vec![],
        })
    }

    fn fact(task_id: &str) -> StagePayload {
        StagePayload::Card(KnowledgeCard::new(
            task_id,
            "design stage delayed",
            CardContent::Fact(FactSheet {
                facts: vec![],
                headline: "design stage delayed".to_string(),
            }),
            0.9,
        ))
    }

    #[tokio::test]
    async fn test_submit_starts_pending() {
        let tmp = TempDir::new().unwrap();
        let hub = hub(tmp.path());
        let id = hub.submit_task("analyze slip", "raw").await.unwrap();

        let task = hub.get_task_state(&id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.stage_cursor, 0);
        assert_eq!(hub.raw_material(&id).await.unwrap(), "raw");
        assert!(hub.audit_log(&id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_out_of_order_result_is_rejected_and_audited() {
        let tmp = TempDir::new().unwrap();
        let hub = hub(tmp.path());
        let id = hub.submit_task("analyze slip", "raw").await.unwrap();

        let err = hub
            .receive_result(&id, Stage::FactExtractor, fact(&id), "fact_extractor")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Sequence { .. }));

        let task = hub.get_task_state(&id).await.unwrap();
        assert_eq!(task.stage_cursor, 0);
        let log = hub.audit_log(&id).await.unwrap();
        assert_eq!(log.len(), 1);
        assert!(!log[0].accepted);
    }

    #[tokio::test]
    async fn test_replay_cannot_double_advance() {
        let tmp = TempDir::new().unwrap();
        let hub = hub(tmp.path());
        let id = hub.submit_task("analyze slip", "raw").await.unwrap();

        hub.post_result(&id, Stage::Preprocessor, prepared(), "preprocessor")
            .await
            .unwrap();
        assert!(hub
            .post_result(&id, Stage::Preprocessor, prepared(), "preprocessor")
            .await
            .is_err());

        let task = hub.get_status(&id).await.unwrap();
        assert_eq!(task.stage_cursor, 1);
        assert_eq!(task.status, TaskStatus::Running);
        let log = hub.audit_log(&id).await.unwrap();
        assert_eq!(log.iter().map(|e| e.seq).collect::<Vec<_>>(), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_mismatched_payload_is_invalid() {
        let tmp = TempDir::new().unwrap();
        let hub = hub(tmp.path());
        let id = hub.submit_task("analyze slip", "raw").await.unwrap();

        let err = hub
            .receive_result(&id, Stage::Preprocessor, fact(&id), "preprocessor")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidPayload(_)));

        hub.receive_result(&id, Stage::Preprocessor, prepared(), "preprocessor")
            .await
            .unwrap();
        let err = hub
            .receive_result(&id, Stage::FactExtractor, fact("task-other"), "fact_extractor")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidPayload(_)));
        assert_eq!(hub.audit_log(&id).await.unwrap().len(), 3);
        assert!(hub.cards(&id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_fail_task_keeps_accepted_cards() {
        let tmp = TempDir::new().unwrap();
        let hub = hub(tmp.path());
        let id = hub.submit_task("analyze slip", "raw").await.unwrap();

        hub.receive_result(&id, Stage::Preprocessor, prepared(), "preprocessor")
            .await
            .unwrap();
        let ack = hub
            .receive_result(&id, Stage::FactExtractor, fact(&id), "fact_extractor")
            .await
            .unwrap();
        assert!(ack.card_id.is_some());

        let error = Error::Backend {
            stage: "interpreter".to_string(),
            message: "model unavailable".to_string(),
        };
        let task = hub.fail_task(&id, Stage::Interpreter, &error).await.unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        let failure = task.failure.unwrap();
        assert_eq!(failure.stage, Stage::Interpreter);
        assert!(failure.error.contains("model unavailable"));

        assert_eq!(hub.cards(&id).await.unwrap().len(), 1);
        assert!(matches!(
            hub.receive_result(&id, Stage::Interpreter, prepared(), "interpreter").await,
            Err(Error::Sequence { .. })
        ));
    }

    #[tokio::test]
    async fn test_failed_save_leaves_task_unchanged() {
        let tmp = TempDir::new().unwrap();
        let hub = hub(tmp.path());
        let id = hub.submit_task("analyze slip", "raw").await.unwrap();

        // A directory in place of the record file makes every save fail
        let record_path = tmp.path().join("tasks").join(format!("{id}.json"));
        fs::remove_file(&record_path).unwrap();
        fs::create_dir(&record_path).unwrap();

        assert!(hub
            .receive_result(&id, Stage::Preprocessor, prepared(), "preprocessor")
            .await
            .is_err());
        let task = hub.get_task_state(&id).await.unwrap();
        assert_eq!(task.stage_cursor, 0);
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(hub.prepared_material(&id).await.unwrap().is_none());
        let log = hub.audit_log(&id).await.unwrap();
        assert!(!log.last().unwrap().accepted);

        fs::remove_dir(&record_path).unwrap();
        let ack = hub
            .receive_result(&id, Stage::Preprocessor, prepared(), "preprocessor")
            .await
            .unwrap();
        assert_eq!(ack.stage_cursor, 1);
    }

    #[tokio::test]
    async fn test_stale_failure_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let hub = hub(tmp.path());
        let id = hub.submit_task("analyze slip", "raw").await.unwrap();
        hub.receive_result(&id, Stage::Preprocessor, prepared(), "preprocessor")
            .await
            .unwrap();

        let error = Error::Backend {
            stage: "preprocessor".to_string(),
            message: "late failure".to_string(),
        };
        assert!(matches!(
            hub.fail_task(&id, Stage::Preprocessor, &error).await,
            Err(Error::Sequence { .. })
        ));
        let task = hub.get_task_state(&id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Running);
        assert!(task.failure.is_none());
    }

    #[tokio::test]
    async fn test_reopen_restores_tasks() {
        let tmp = TempDir::new().unwrap();
        let id = {
            let hub = hub(tmp.path());
            let id = hub.submit_task("analyze slip", "raw").await.unwrap();
            hub.receive_result(&id, Stage::Preprocessor, prepared(), "preprocessor")
                .await
                .unwrap();
            id
        };

        let hub = hub(tmp.path());
        let task = hub.get_task_state(&id).await.unwrap();
        assert_eq!(task.stage_cursor, 1);
        assert!(hub.prepared_material(&id).await.unwrap().is_some());
        assert_eq!(hub.list_tasks().await.len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_task() {
        let tmp = TempDir::new().unwrap();
        let hub = hub(tmp.path());
        assert!(matches!(
            hub.get_task_state("task-missing").await,
            Err(Error::TaskNotFound(_))
        ));
    }
}
