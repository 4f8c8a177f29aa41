//! Skill registry
//!
//! A catalog of named capabilities with usage bookkeeping. Invoking a skill
//! counts the call and delegates to its handler. The registry has no say in
//! pipeline ordering.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Skill logic: JSON arguments in, JSON result out
pub type SkillHandler = Arc<dyn Fn(Value) -> Result<Value> + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Skill {
    pub name: String,
    pub category: String,
    pub owning_agent: String,
    pub enabled: bool,
    pub usage_count: u64,
    pub last_used: Option<DateTime<Utc>>,
}

impl Skill {
    pub fn new(
        name: impl Into<String>,
        category: impl Into<String>,
        owning_agent: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            category: category.into(),
            owning_agent: owning_agent.into(),
            enabled: true,
            usage_count: 0,
            last_used: None,
        }
    }
}

impl fmt::Display for Skill {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{}] owner={} enabled={} uses={}",
            self.name, self.category, self.owning_agent, self.enabled, self.usage_count
        )
    }
}

struct SkillEntry {
    skill: Skill,
    handler: SkillHandler,
}

#[derive(Default)]
pub struct SkillRegistry {
    skills: RwLock<HashMap<String, SkillEntry>>,
}

impl SkillRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a skill, replacing any existing skill of the same name
    pub async fn register(&self, skill: Skill, handler: SkillHandler) {
        let name = skill.name.clone();
        let mut skills = self.skills.write().await;
        if skills.insert(name.clone(), SkillEntry { skill, handler }).is_some() {
            warn!("Skill {} re-registered, overwriting previous definition", name);
        } else {
            debug!("Registered skill {}", name);
        }
    }

    pub async fn get(&self, name: &str) -> Result<Skill> {
        self.skills
            .read()
            .await
            .get(name)
            .map(|entry| entry.skill.clone())
            .ok_or_else(|| Error::SkillNotFound(name.to_string()))
    }

    /// Skills sorted by name, optionally filtered by owner and category
    pub async fn list(
        &self,
        agent_filter: Option<&str>,
        category_filter: Option<&str>,
    ) -> Vec<Skill> {
        let skills = self.skills.read().await;
        let mut listed: Vec<Skill> = skills
            .values()
            .map(|entry| &entry.skill)
            .filter(|s| agent_filter.map_or(true, |a| s.owning_agent == a))
            .filter(|s| category_filter.map_or(true, |c| s.category == c))
            .cloned()
            .collect();
        listed.sort_by(|a, b| a.name.cmp(&b.name));
        listed
    }

    /// Count the call, then run the skill's handler
    pub async fn invoke(&self, name: &str, args: Value) -> Result<Value> {
        let handler = {
            let mut skills = self.skills.write().await;
            let entry = skills
                .get_mut(name)
                .ok_or_else(|| Error::SkillNotFound(name.to_string()))?;
            if !entry.skill.enabled {
                return Err(Error::SkillDisabled(name.to_string()));
            }
            entry.skill.usage_count += 1;
            entry.skill.last_used = Some(Utc::now());
            entry.handler.clone()
        };

        handler(args)
    }

    pub async fn set_enabled(&self, name: &str, enabled: bool) -> Result<()> {
        let mut skills = self.skills.write().await;
        let entry = skills
            .get_mut(name)
            .ok_or_else(|| Error::SkillNotFound(name.to_string()))?;
        entry.skill.enabled = enabled;
        info!(
            "Skill {} {}",
            name,
            if enabled { "enabled" } else { "disabled" }
        );
        Ok(())
    }

    /// Write the skill table (without handlers) as JSON
    pub async fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let table = self.list(None, None).await;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        // Concurrent savers each rename a complete file into place
        let tmp = path.with_extension(format!("{}.tmp", Uuid::new_v4().simple()));
        std::fs::write(&tmp, serde_json::to_string_pretty(&table)?)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Restore usage counters and enabled flags for registered skills.
    ///
    /// Entries for unknown skills are ignored. Returns how many skills were
    /// restored; a missing file restores nothing.
    pub async fn restore_usage(&self, path: impl AsRef<Path>) -> Result<usize> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(0);
        }
        let table: Vec<Skill> = serde_json::from_str(&std::fs::read_to_string(path)?)?;

        let mut skills = self.skills.write().await;
        let mut restored = 0;
        for saved in table {
            match skills.get_mut(&saved.name) {
                Some(entry) => {
                    entry.skill.usage_count = saved.usage_count;
                    entry.skill.last_used = saved.last_used;
                    entry.skill.enabled = saved.enabled;
                    restored += 1;
                }
                None => debug!("Ignoring saved state for unknown skill {}", saved.name),
            }
        }
        Ok(restored)
    }
}
