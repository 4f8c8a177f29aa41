//! Append-only audit trail of hub traffic, one JSON line per call

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Per-task sequence number, starting at 1
    pub seq: u64,
    pub task_id: String,
    pub from_agent: String,
    pub to_agent: String,
    pub timestamp: DateTime<Utc>,
    /// SHA-256 of the serialized payload, lowercase hex
    pub payload_digest: String,
    pub accepted: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub note: String,
}

pub fn digest(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Audit files live at `<dir>/<task_id>.jsonl`
#[derive(Debug, Clone)]
pub struct AuditLog {
    dir: PathBuf,
}

impl AuditLog {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn path(&self, task_id: &str) -> PathBuf {
        self.dir.join(format!("{}.jsonl", task_id))
    }

    pub fn append(&self, entry: &AuditEntry) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path(&entry.task_id))?;
        let line = serde_json::to_string(entry)?;
        writeln!(file, "{}", line)?;
        Ok(())
    }

    /// Entries for a task in append order; no file means no entries
    pub fn read(&self, task_id: &str) -> Result<Vec<AuditEntry>> {
        let path = self.path(task_id);
        if !path.exists() {
            return Ok(Vec::new());
        }

        let content = fs::read_to_string(path)?;
        content
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| serde_json::from_str(l).map_err(Into::into))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn entry(seq: u64, accepted: bool) -> AuditEntry {
        AuditEntry {
            seq,
            task_id: "task-1".to_string(),
            from_agent: "preprocessor".to_string(),
            to_agent: "fact_extractor".to_string(),
            timestamp: Utc::now(),
            payload_digest: digest(b"{}"),
            accepted,
            note: String::new(),
        }
    }

    #[test]
    fn test_digest_is_sha256_hex() {
        assert_eq!(
            digest(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_append_and_read() {
        let tmp = TempDir::new().unwrap();
        let log = AuditLog::open(tmp.path()).unwrap();
        assert!(log.read("task-1").unwrap().is_empty());

        log.append(&entry(1, true)).unwrap();
        log.append(&entry(2, false)).unwrap();

        let entries = log.read("task-1").unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].seq, 1);
        assert!(!entries[1].accepted);
    }
}
