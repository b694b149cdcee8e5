//! Agent manifests: crash-recovery checkpoints and the persistent identity
//! overlay.
//!
//! The checkpoint is the agent's resumable state (`checkpoint.json`),
//! written atomically via write-temp + rename so a crash mid-write can
//! never leave a torn file. The identity (`identity.yaml`) is the agent's
//! CV across sessions: completed-session count, expertise domains, and a
//! FIFO-capped list of recent tasks.

use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::session::Capability;
use crate::{Error, Result};

/// Recent tasks kept on an identity before FIFO eviction.
pub const RECENT_TASK_CAP: usize = 20;

/// Resumable session state for crash recovery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub agent_name: String,
    pub bead_id: String,
    pub session_id: String,
    pub progress_summary: String,
    pub files_modified: Vec<String>,
    pub current_branch: String,
    pub pending_work: String,
}

impl Checkpoint {
    /// Atomically write the checkpoint: serialize to a temp file in the same
    /// directory, then rename over the target.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, &json)?;
        fs::rename(&tmp, path).map_err(|e| Error::Checkpoint {
            agent: self.agent_name.clone(),
            message: format!("atomic rename failed: {}", e),
        })?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| Error::Checkpoint {
            agent: path.display().to_string(),
            message: format!("cannot read checkpoint: {}", e),
        })?;
        let checkpoint = serde_json::from_str(&content).map_err(|e| Error::Checkpoint {
            agent: path.display().to_string(),
            message: format!("malformed checkpoint: {}", e),
        })?;
        Ok(checkpoint)
    }

    pub fn exists(path: &Path) -> bool {
        path.exists()
    }
}

/// One entry in an identity's recent-task list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecentTask {
    pub task_id: String,
    pub summary: String,
    pub ts: DateTime<Utc>,
}

/// Persistent agent CV (`identity.yaml`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    pub name: String,
    pub capability: Capability,
    pub sessions_completed: u32,
    #[serde(default)]
    pub expertise_domains: Vec<String>,
    #[serde(default)]
    pub recent_tasks: Vec<RecentTask>,
}

impl Identity {
    pub fn new(name: impl Into<String>, capability: Capability) -> Self {
        Self {
            name: name.into(),
            capability,
            sessions_completed: 0,
            expertise_domains: Vec::new(),
            recent_tasks: Vec::new(),
        }
    }

    /// Record a completed task: bump the session counter, merge domains,
    /// and append to the recent list with FIFO eviction at the cap.
    pub fn record_task(
        &mut self,
        task_id: impl Into<String>,
        summary: impl Into<String>,
        domains: &[String],
    ) {
        self.sessions_completed += 1;
        for domain in domains {
            if !self.expertise_domains.contains(domain) {
                self.expertise_domains.push(domain.clone());
            }
        }
        self.recent_tasks.push(RecentTask {
            task_id: task_id.into(),
            summary: summary.into(),
            ts: Utc::now(),
        });
        while self.recent_tasks.len() > RECENT_TASK_CAP {
            self.recent_tasks.remove(0);
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let yaml = serde_yaml::to_string(self)?;
        let tmp = path.with_extension("yaml.tmp");
        fs::write(&tmp, &yaml)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Load an identity, or start a fresh one when the file is absent.
    pub fn load_or_new(path: &Path, name: &str, capability: Capability) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::new(name, capability));
        }
        let content = fs::read_to_string(path)?;
        let identity = serde_yaml::from_str(&content)?;
        Ok(identity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn checkpoint() -> Checkpoint {
        Checkpoint {
            agent_name: "builder-1".into(),
            bead_id: "task-abc".into(),
            session_id: "sess-1".into(),
            progress_summary: "implemented parser".into(),
            files_modified: vec!["src/parse.rs".into(), "src/lib.rs".into()],
            current_branch: "overstory/builder-1/task-abc".into(),
            pending_work: "wire up error cases".into(),
        }
    }

    // ── checkpoint ──

    #[test]
    fn checkpoint_save_load_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("agents/builder-1/checkpoint.json");
        let original = checkpoint();
        original.save(&path).unwrap();

        let loaded = Checkpoint::load(&path).unwrap();
        assert_eq!(loaded, original);
    }

    #[test]
    fn checkpoint_save_is_byte_idempotent() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("checkpoint.json");
        let original = checkpoint();
        original.save(&path).unwrap();
        let first = std::fs::read(&path).unwrap();

        let loaded = Checkpoint::load(&path).unwrap();
        loaded.save(&path).unwrap();
        let second = std::fs::read(&path).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn checkpoint_no_temp_file_left_behind() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("checkpoint.json");
        checkpoint().save(&path).unwrap();
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn checkpoint_load_missing_is_lifecycle_error() {
        let err = Checkpoint::load(Path::new("/nonexistent/checkpoint.json")).unwrap_err();
        assert_eq!(err.kind(), "lifecycle");
    }

    #[test]
    fn checkpoint_load_malformed() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("checkpoint.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(Checkpoint::load(&path).is_err());
    }

    // ── identity ──

    #[test]
    fn identity_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("identity.yaml");
        let mut identity = Identity::new("builder-1", Capability::Builder);
        identity.record_task("task-1", "built a thing", &["core-code".into()]);
        identity.save(&path).unwrap();

        let loaded = Identity::load_or_new(&path, "builder-1", Capability::Builder).unwrap();
        assert_eq!(loaded, identity);
    }

    #[test]
    fn identity_load_missing_starts_fresh() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("identity.yaml");
        let identity = Identity::load_or_new(&path, "scout-1", Capability::Scout).unwrap();
        assert_eq!(identity.sessions_completed, 0);
        assert!(identity.recent_tasks.is_empty());
    }

    #[test]
    fn record_task_merges_domains_without_duplicates() {
        let mut identity = Identity::new("b", Capability::Builder);
        identity.record_task("t1", "s", &["core-code".into(), "testing".into()]);
        identity.record_task("t2", "s", &["core-code".into()]);
        assert_eq!(identity.expertise_domains, vec!["core-code", "testing"]);
        assert_eq!(identity.sessions_completed, 2);
    }

    #[test]
    fn recent_tasks_fifo_evict_at_cap() {
        let mut identity = Identity::new("b", Capability::Builder);
        for i in 0..25 {
            identity.record_task(format!("task-{}", i), "s", &[]);
        }
        assert_eq!(identity.recent_tasks.len(), RECENT_TASK_CAP);
        // Oldest five evicted
        assert_eq!(identity.recent_tasks[0].task_id, "task-5");
        assert_eq!(identity.recent_tasks.last().unwrap().task_id, "task-24");
    }
}
