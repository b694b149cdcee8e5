//! Agent session and run types.
//!
//! An [`AgentSession`] is the durable record of one worker process: its
//! identity, capability, worktree/branch, pane, lifecycle state and
//! escalation level. Sessions group into [`Run`]s under a coordinator.
//!
//! State transitions are forward-only; the allowed pairs are encoded in
//! [`SessionState::can_transition`] and enforced by the session store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

use crate::{Error, Result};

/// Agent capability tag. Controls spawn rights and run-completion semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    Coordinator,
    Supervisor,
    Lead,
    Builder,
    Scout,
    Reviewer,
    Merger,
    Monitor,
}

impl Capability {
    pub const ALL: [Capability; 8] = [
        Capability::Coordinator,
        Capability::Supervisor,
        Capability::Lead,
        Capability::Builder,
        Capability::Scout,
        Capability::Reviewer,
        Capability::Merger,
        Capability::Monitor,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::Coordinator => "coordinator",
            Capability::Supervisor => "supervisor",
            Capability::Lead => "lead",
            Capability::Builder => "builder",
            Capability::Scout => "scout",
            Capability::Reviewer => "reviewer",
            Capability::Merger => "merger",
            Capability::Monitor => "monitor",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "coordinator" => Ok(Capability::Coordinator),
            "supervisor" => Ok(Capability::Supervisor),
            "lead" => Ok(Capability::Lead),
            "builder" => Ok(Capability::Builder),
            "scout" => Ok(Capability::Scout),
            "reviewer" => Ok(Capability::Reviewer),
            "merger" => Ok(Capability::Merger),
            "monitor" => Ok(Capability::Monitor),
            other => Err(Error::Validation(format!("unknown capability: {}", other))),
        }
    }

    /// Persistent capabilities live for the whole run: they are excluded from
    /// run-level completion checks but still liveness-monitored.
    pub fn is_persistent(&self) -> bool {
        matches!(self, Capability::Coordinator | Capability::Monitor)
    }

    /// Capabilities this agent may spawn as children.
    pub fn spawnable(&self) -> &'static [Capability] {
        match self {
            Capability::Coordinator => &[
                Capability::Supervisor,
                Capability::Lead,
                Capability::Scout,
                Capability::Merger,
            ],
            Capability::Supervisor => &[Capability::Lead, Capability::Builder, Capability::Scout],
            Capability::Lead => &[Capability::Builder, Capability::Scout, Capability::Reviewer],
            Capability::Builder | Capability::Scout | Capability::Reviewer => &[],
            Capability::Merger => &[],
            Capability::Monitor => &[],
        }
    }

    pub fn can_spawn(&self, child: Capability) -> bool {
        self.spawnable().contains(&child)
    }

    /// The group address (`@builders`, ...) this capability answers to, if any.
    pub fn group_address(&self) -> Option<&'static str> {
        match self {
            Capability::Builder => Some("@builders"),
            Capability::Scout => Some("@scouts"),
            Capability::Reviewer => Some("@reviewers"),
            Capability::Merger => Some("@mergers"),
            Capability::Lead => Some("@leads"),
            _ => None,
        }
    }
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Booting,
    Working,
    Completed,
    Stalled,
    Zombie,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Booting => "booting",
            SessionState::Working => "working",
            SessionState::Completed => "completed",
            SessionState::Stalled => "stalled",
            SessionState::Zombie => "zombie",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "booting" => Ok(SessionState::Booting),
            "working" => Ok(SessionState::Working),
            "completed" => Ok(SessionState::Completed),
            "stalled" => Ok(SessionState::Stalled),
            "zombie" => Ok(SessionState::Zombie),
            other => Err(Error::Validation(format!("unknown session state: {}", other))),
        }
    }

    /// Terminal states admit no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Completed | SessionState::Zombie)
    }

    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    /// Check whether a transition to `target` is allowed.
    ///
    /// `zombie` is reachable from every non-terminal state because observable
    /// liveness overrides recorded state; `stalled` is reachable from
    /// `booting` because the stall rule keys on `last_activity` alone.
    pub fn can_transition(&self, target: SessionState) -> bool {
        matches!(
            (self, target),
            (SessionState::Booting, SessionState::Working)
                | (SessionState::Booting, SessionState::Stalled)
                | (SessionState::Booting, SessionState::Zombie)
                | (SessionState::Working, SessionState::Completed)
                | (SessionState::Working, SessionState::Stalled)
                | (SessionState::Working, SessionState::Zombie)
                | (SessionState::Stalled, SessionState::Working)
                | (SessionState::Stalled, SessionState::Zombie)
        )
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Durable record of one agent's lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSession {
    /// Process-wide unique identity.
    pub agent_name: String,
    pub capability: Capability,
    pub worktree_path: PathBuf,
    pub branch_name: String,
    /// Opaque unit-of-work identifier.
    pub bead_id: String,
    /// Multiplexer pane name.
    pub pane_name: String,
    pub state: SessionState,
    pub pid: Option<u32>,
    pub parent_agent: Option<String>,
    /// Spawn-tree depth; 0 iff capability is coordinator or monitor.
    pub depth: u32,
    pub run_id: Option<String>,
    pub started_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub stalled_since: Option<DateTime<Utc>>,
    /// Monotone 0..3 while non-terminal.
    pub escalation_level: u8,
}

impl AgentSession {
    pub fn new(
        agent_name: impl Into<String>,
        capability: Capability,
        worktree_path: impl Into<PathBuf>,
        branch_name: impl Into<String>,
        bead_id: impl Into<String>,
        pane_name: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        let depth = if capability.is_persistent() { 0 } else { 1 };
        Self {
            agent_name: agent_name.into(),
            capability,
            worktree_path: worktree_path.into(),
            branch_name: branch_name.into(),
            bead_id: bead_id.into(),
            pane_name: pane_name.into(),
            state: SessionState::Booting,
            pid: None,
            parent_agent: None,
            depth,
            run_id: None,
            started_at: now,
            last_activity: now,
            stalled_since: None,
            escalation_level: 0,
        }
    }

    pub fn with_parent(mut self, parent: impl Into<String>, depth: u32) -> Self {
        self.parent_agent = Some(parent.into());
        self.depth = depth;
        self
    }

    pub fn with_run(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    pub fn with_pid(mut self, pid: u32) -> Self {
        self.pid = Some(pid);
        self
    }

    /// Depth 0 is reserved for the persistent capabilities (coordinator,
    /// monitor) and vice versa.
    pub fn validate(&self) -> Result<()> {
        if self.agent_name.is_empty() {
            return Err(Error::Validation("agent_name cannot be empty".to_string()));
        }
        if (self.depth == 0) != self.capability.is_persistent() {
            return Err(Error::Validation(format!(
                "depth 0 is reserved for coordinator/monitor, got depth {} for {}",
                self.depth, self.capability
            )));
        }
        Ok(())
    }
}

/// Status of a coordinator run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Active,
    Completed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Active => "active",
            RunStatus::Completed => "completed",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "active" => Ok(RunStatus::Active),
            "completed" => Ok(RunStatus::Completed),
            other => Err(Error::Validation(format!("unknown run status: {}", other))),
        }
    }
}

/// A grouping of related agent sessions under one coordinator activity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub run_id: String,
    /// Free-form description of the coordinator activity.
    pub objective: String,
    pub status: RunStatus,
    pub agent_count: u32,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Run {
    pub fn new(objective: impl Into<String>) -> Self {
        Self {
            run_id: Uuid::new_v4().to_string(),
            objective: objective.into(),
            status: RunStatus::Active,
            agent_count: 0,
            created_at: Utc::now(),
            completed_at: None,
        }
    }
}
