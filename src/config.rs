//! Project configuration and the `.overstory/` state directory layout.
//!
//! The front end owns `config.yaml`; the core reads it (missing file means
//! defaults) and derives every path inside the state directory from it.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{olog_debug, Result};

pub const STATE_DIR_NAME: &str = ".overstory";

/// Watchdog thresholds. The rules are fixed; only the numbers move.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WatchdogConfig {
    /// Seconds without activity before a session counts as stalled.
    pub stall_threshold_secs: u64,
    /// Seconds without activity before the session is hard-killed outright.
    pub hard_kill_threshold_secs: u64,
    /// Seconds between watchdog ticks.
    pub poll_interval_secs: u64,
    /// Seconds between SIGTERM and SIGKILL when killing a process tree.
    pub grace_period_secs: u64,
    /// Whether Tier-1 AI triage runs at escalation level 2.
    pub triage_enabled: bool,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            stall_threshold_secs: 600,
            hard_kill_threshold_secs: 1800,
            poll_interval_secs: 30,
            grace_period_secs: 2,
            triage_enabled: false,
        }
    }
}

impl WatchdogConfig {
    pub fn stall_threshold(&self) -> Duration {
        Duration::from_secs(self.stall_threshold_secs)
    }

    pub fn hard_kill_threshold(&self) -> Duration {
        Duration::from_secs(self.hard_kill_threshold_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }
}

/// Subprocess deadlines. Every external invocation carries one.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DeadlineConfig {
    pub git_secs: u64,
    pub ai_secs: u64,
    pub mux_secs: u64,
}

impl Default for DeadlineConfig {
    fn default() -> Self {
        Self {
            git_secs: 30,
            ai_secs: 120,
            mux_secs: 5,
        }
    }
}

impl DeadlineConfig {
    pub fn git(&self) -> Duration {
        Duration::from_secs(self.git_secs)
    }

    pub fn ai(&self) -> Duration {
        Duration::from_secs(self.ai_secs)
    }

    pub fn mux(&self) -> Duration {
        Duration::from_secs(self.mux_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Integration target for merges (empty means the repo's default branch).
    pub canonical_branch: String,
    /// Command used to launch the agent process inside a pane.
    pub agent_command: Option<String>,
    /// Command for the AI resolver/triage subprocess.
    pub ai_command: Option<String>,
    pub watchdog: WatchdogConfig,
    pub deadlines: DeadlineConfig,
    /// Days before read mail and old events are purged.
    pub retention_days: Option<u32>,
}

impl Config {
    pub fn effective_agent_command(&self) -> &str {
        self.agent_command.as_deref().unwrap_or("claude")
    }

    pub fn effective_ai_command(&self) -> &str {
        self.ai_command.as_deref().unwrap_or("claude")
    }

    pub fn load(state_dir: &Path) -> Result<Self> {
        let path = state_dir.join("config.yaml");
        olog_debug!("Config::load path={}", path.display());
        if !path.exists() {
            olog_debug!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = serde_yaml::from_str(&fs::read_to_string(&path)?)?;
        Ok(config)
    }

    pub fn save(&self, state_dir: &Path) -> Result<()> {
        fs::create_dir_all(state_dir)?;
        let path = state_dir.join("config.yaml");
        fs::write(&path, serde_yaml::to_string(self)?)?;
        olog_debug!("Config saved to {}", path.display());
        Ok(())
    }
}

/// Resolved paths inside a project's state directory.
#[derive(Debug, Clone)]
pub struct StateDir {
    root: PathBuf,
}

impl StateDir {
    /// State directory for a project root (`<project>/.overstory`).
    pub fn for_project(project_root: &Path) -> Self {
        Self {
            root: project_root.join(STATE_DIR_NAME),
        }
    }

    /// Use an explicit state directory (e.g. from `OVERSTORY_STATE_DIR`).
    pub fn at(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sessions_db(&self) -> PathBuf {
        self.root.join("sessions.db")
    }

    pub fn mail_db(&self) -> PathBuf {
        self.root.join("mail.db")
    }

    pub fn events_db(&self) -> PathBuf {
        self.root.join("events.db")
    }

    pub fn merge_queue_db(&self) -> PathBuf {
        self.root.join("merge-queue.db")
    }

    pub fn spec_path(&self, task_id: &str) -> PathBuf {
        self.root.join("specs").join(format!("{}.md", task_id))
    }

    pub fn agent_dir(&self, agent_name: &str) -> PathBuf {
        self.root.join("agents").join(agent_name)
    }

    pub fn checkpoint_path(&self, agent_name: &str) -> PathBuf {
        self.agent_dir(agent_name).join("checkpoint.json")
    }

    pub fn identity_path(&self, agent_name: &str) -> PathBuf {
        self.agent_dir(agent_name).join("identity.yaml")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    /// Legacy flat-file session list imported by the session store on first open.
    pub fn legacy_sessions_file(&self) -> PathBuf {
        self.root.join("sessions.json")
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        fs::create_dir_all(&self.root)?;
        fs::create_dir_all(self.root.join("specs"))?;
        fs::create_dir_all(self.root.join("agents"))?;
        fs::create_dir_all(self.logs_dir())?;
        Ok(())
    }
}
