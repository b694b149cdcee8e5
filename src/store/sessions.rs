//! Session and run store (`sessions.db`).
//!
//! Durable, concurrent-safe record of every agent's lifecycle plus grouping
//! into runs. State transitions are validated inside the writing transaction
//! against the forward-only rule; escalation levels only move up.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};

use crate::session::{AgentSession, Capability, Run, RunStatus, SessionState};
use crate::{olog, olog_debug, Error, Result};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS sessions (
    agent_name    TEXT PRIMARY KEY,
    capability    TEXT NOT NULL,
    worktree_path TEXT NOT NULL,
    branch_name   TEXT NOT NULL,
    bead_id       TEXT NOT NULL,
    pane_name     TEXT NOT NULL,
    state         TEXT NOT NULL,
    pid           INTEGER,
    parent_agent  TEXT,
    depth         INTEGER NOT NULL DEFAULT 0,
    started_at    TEXT NOT NULL,
    last_activity TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS runs (
    run_id       TEXT PRIMARY KEY,
    objective    TEXT NOT NULL,
    status       TEXT NOT NULL DEFAULT 'active',
    agent_count  INTEGER NOT NULL DEFAULT 0,
    created_at   TEXT NOT NULL,
    completed_at TEXT
);

CREATE TABLE IF NOT EXISTS meta (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_sessions_state ON sessions(state);
";

/// Result of opening the store: the handle plus whether a legacy flat file
/// was imported, so the front end can log the migration exactly once.
pub struct SessionStoreOpen {
    pub store: SessionStore,
    pub migrated: bool,
}

pub struct SessionStore {
    conn: Mutex<Connection>,
}

impl SessionStore {
    /// Open (or create) the store at `path`, applying idempotent column-add
    /// migrations and importing `legacy_file` if the schema is fresh.
    pub fn open(path: &Path, legacy_file: Option<&Path>) -> Result<SessionStoreOpen> {
        let conn = super::open_db(path, SCHEMA)?;
        Self::migrate(&conn);
        let store = Self {
            conn: Mutex::new(conn),
        };
        let migrated = match legacy_file {
            Some(legacy) => store.import_legacy(legacy)?,
            None => false,
        };
        Ok(SessionStoreOpen { store, migrated })
    }

    /// In-memory store for tests and sub-agents.
    pub fn memory() -> Result<Self> {
        let conn = super::open_memory(SCHEMA)?;
        Self::migrate(&conn);
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Column-add migrations, applied on every open. Adding a column that
    /// already exists fails; the error is the signal the migration already
    /// ran, so it is ignored.
    fn migrate(conn: &Connection) {
        let _ = conn.execute_batch(
            "ALTER TABLE sessions ADD COLUMN escalation_level INTEGER NOT NULL DEFAULT 0",
        );
        let _ =
            conn.execute_batch("ALTER TABLE sessions ADD COLUMN stalled_since TEXT");
        let _ = conn.execute_batch("ALTER TABLE sessions ADD COLUMN run_id TEXT");
        let _ = conn
            .execute_batch("CREATE INDEX IF NOT EXISTS idx_sessions_run ON sessions(run_id)");
    }

    /// Import a legacy flat-file session list on first open.
    ///
    /// Runs only when the sessions table is empty and not yet marked
    /// migrated; every imported row is upserted as-is.
    fn import_legacy(&self, legacy: &Path) -> Result<bool> {
        {
            let conn = self.conn.lock().unwrap();
            let already: Option<String> = conn
                .query_row(
                    "SELECT value FROM meta WHERE key = 'legacy_imported'",
                    [],
                    |row| row.get(0),
                )
                .optional()?;
            if already.is_some() {
                return Ok(false);
            }
            let count: i64 =
                conn.query_row("SELECT COUNT(*) FROM sessions", [], |row| row.get(0))?;
            if count > 0 || !legacy.exists() {
                return Ok(false);
            }
        }

        let content = std::fs::read_to_string(legacy)?;
        let sessions: Vec<AgentSession> = serde_json::from_str(&content)
            .map_err(|e| Error::Store(format!("legacy session file unreadable: {}", e)))?;
        let imported = sessions.len();
        for session in sessions {
            self.upsert(&session)?;
        }

        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO meta (key, value) VALUES ('legacy_imported', ?1)",
            params![Utc::now().to_rfc3339()],
        )?;
        olog!(
            "Imported {} sessions from legacy file {}",
            imported,
            legacy.display()
        );
        Ok(true)
    }

    // ── Session operations ──

    /// Insert or replace by `agent_name`.
    pub fn upsert(&self, session: &AgentSession) -> Result<()> {
        session.validate()?;
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO sessions
             (agent_name, capability, worktree_path, branch_name, bead_id, pane_name,
              state, pid, parent_agent, depth, run_id, started_at, last_activity,
              stalled_since, escalation_level)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            params![
                session.agent_name,
                session.capability.as_str(),
                session.worktree_path.display().to_string(),
                session.branch_name,
                session.bead_id,
                session.pane_name,
                session.state.as_str(),
                session.pid,
                session.parent_agent,
                session.depth,
                session.run_id,
                session.started_at.to_rfc3339(),
                session.last_activity.to_rfc3339(),
                session.stalled_since.map(|t| t.to_rfc3339()),
                session.escalation_level,
            ],
        )?;
        Ok(())
    }

    pub fn get_by_name(&self, name: &str) -> Result<Option<AgentSession>> {
        let conn = self.conn.lock().unwrap();
        let session = conn
            .query_row(
                &format!("{} WHERE agent_name = ?1", SELECT_SESSION),
                params![name],
                row_to_session,
            )
            .optional()?;
        Ok(session)
    }

    /// Sessions in a non-terminal state (booting, working, stalled).
    pub fn get_active(&self) -> Result<Vec<AgentSession>> {
        self.query_sessions(
            &format!(
                "{} WHERE state IN ('booting', 'working', 'stalled') ORDER BY agent_name",
                SELECT_SESSION
            ),
            params![],
        )
    }

    pub fn get_all(&self) -> Result<Vec<AgentSession>> {
        self.query_sessions(&format!("{} ORDER BY agent_name", SELECT_SESSION), params![])
    }

    pub fn get_by_run(&self, run_id: &str) -> Result<Vec<AgentSession>> {
        self.query_sessions(
            &format!("{} WHERE run_id = ?1 ORDER BY agent_name", SELECT_SESSION),
            params![run_id],
        )
    }

    fn query_sessions(
        &self,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<AgentSession>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(params, row_to_session)?;
        let mut sessions = Vec::new();
        for row in rows {
            sessions.push(row?);
        }
        Ok(sessions)
    }

    /// Apply a forward-only state transition.
    ///
    /// The current row is re-read inside the same immediate transaction, so a
    /// concurrent writer cannot slip an illegal pair past the rule. Illegal
    /// transitions are rejected with a lifecycle error. `stalled_since` is
    /// set exactly when entering `stalled` and cleared on any other target;
    /// terminal transitions reset the escalation level.
    pub fn update_state(&self, name: &str, new_state: SessionState) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let current: SessionState = {
            let state_str: Option<String> = tx
                .query_row(
                    "SELECT state FROM sessions WHERE agent_name = ?1",
                    params![name],
                    |row| row.get(0),
                )
                .optional()?;
            match state_str {
                Some(s) => SessionState::parse(&s)?,
                None => {
                    return Err(Error::agent(name, "session not found"));
                }
            }
        };

        if !current.can_transition(new_state) {
            return Err(Error::Lifecycle {
                from: current.as_str().to_string(),
                to: new_state.as_str().to_string(),
            });
        }

        let stalled_since = if new_state == SessionState::Stalled {
            Some(Utc::now().to_rfc3339())
        } else {
            None
        };
        if new_state.is_terminal() {
            tx.execute(
                "UPDATE sessions
                 SET state = ?1, stalled_since = NULL, escalation_level = 0
                 WHERE agent_name = ?2",
                params![new_state.as_str(), name],
            )?;
        } else {
            tx.execute(
                "UPDATE sessions SET state = ?1, stalled_since = ?2 WHERE agent_name = ?3",
                params![new_state.as_str(), stalled_since, name],
            )?;
        }
        tx.commit()?;
        olog_debug!("Session '{}' transitioned {} -> {}", name, current, new_state);
        Ok(())
    }

    /// Touch the activity timestamp.
    pub fn update_last_activity(&self, name: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE sessions SET last_activity = ?1 WHERE agent_name = ?2",
            params![Utc::now().to_rfc3339(), name],
        )?;
        if changed == 0 {
            return Err(Error::agent(name, "session not found"));
        }
        Ok(())
    }

    /// Raise the escalation level. Level decreases are rejected; the level is
    /// monotone while the session is non-terminal.
    pub fn update_escalation(
        &self,
        name: &str,
        level: u8,
        stalled_since: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let current: Option<u8> = tx
            .query_row(
                "SELECT escalation_level FROM sessions WHERE agent_name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()?;
        let current = current.ok_or_else(|| Error::agent(name, "session not found"))?;

        if level < current {
            return Err(Error::Validation(format!(
                "escalation level cannot decrease ({} -> {}) for '{}'",
                current, level, name
            )));
        }

        tx.execute(
            "UPDATE sessions SET escalation_level = ?1, stalled_since = ?2 WHERE agent_name = ?3",
            params![level, stalled_since.map(|t| t.to_rfc3339()), name],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn remove(&self, name: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "DELETE FROM sessions WHERE agent_name = ?1",
            params![name],
        )?;
        Ok(changed > 0)
    }

    /// Delete sessions in the given state. Returns the count deleted.
    pub fn purge_by_state(&self, state: SessionState) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            "DELETE FROM sessions WHERE state = ?1",
            params![state.as_str()],
        )?;
        Ok(n)
    }

    /// Delete one agent's session row. Returns the count deleted.
    pub fn purge_by_agent(&self, name: &str) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            "DELETE FROM sessions WHERE agent_name = ?1",
            params![name],
        )?;
        Ok(n)
    }

    pub fn purge_all(&self) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute("DELETE FROM sessions", [])?;
        Ok(n)
    }

    // ── Run operations ──

    pub fn create_run(&self, run: &Run) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO runs (run_id, objective, status, agent_count, created_at, completed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                run.run_id,
                run.objective,
                run.status.as_str(),
                run.agent_count,
                run.created_at.to_rfc3339(),
                run.completed_at.map(|t| t.to_rfc3339()),
            ],
        )?;
        Ok(())
    }

    pub fn get_run(&self, run_id: &str) -> Result<Option<Run>> {
        let conn = self.conn.lock().unwrap();
        let run = conn
            .query_row(
                "SELECT run_id, objective, status, agent_count, created_at, completed_at
                 FROM runs WHERE run_id = ?1",
                params![run_id],
                row_to_run,
            )
            .optional()?;
        Ok(run)
    }

    /// The single active run, if any. Ties (which should not happen) resolve
    /// to the newest.
    pub fn get_active_run(&self) -> Result<Option<Run>> {
        let conn = self.conn.lock().unwrap();
        let run = conn
            .query_row(
                "SELECT run_id, objective, status, agent_count, created_at, completed_at
                 FROM runs WHERE status = 'active' ORDER BY created_at DESC LIMIT 1",
                [],
                row_to_run,
            )
            .optional()?;
        Ok(run)
    }

    pub fn list_runs(&self, limit: usize) -> Result<Vec<Run>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT run_id, objective, status, agent_count, created_at, completed_at
             FROM runs ORDER BY created_at DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], row_to_run)?;
        let mut runs = Vec::new();
        for row in rows {
            runs.push(row?);
        }
        Ok(runs)
    }

    pub fn increment_agent_count(&self, run_id: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE runs SET agent_count = agent_count + 1 WHERE run_id = ?1",
            params![run_id],
        )?;
        if changed == 0 {
            return Err(Error::Store(format!("run not found: {}", run_id)));
        }
        Ok(())
    }

    /// Mark a run completed, setting status and timestamp atomically.
    pub fn complete_run(&self, run_id: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE runs SET status = 'completed', completed_at = ?1 WHERE run_id = ?2",
            params![Utc::now().to_rfc3339(), run_id],
        )?;
        if changed == 0 {
            return Err(Error::Store(format!("run not found: {}", run_id)));
        }
        Ok(())
    }

    /// Live non-persistent sessions per run. Coordinators and monitors are
    /// excluded: they outlive the work they supervise.
    pub fn active_worker_counts(&self) -> Result<HashMap<String, usize>> {
        let sessions = self.get_active()?;
        let mut counts: HashMap<String, usize> = HashMap::new();
        for session in sessions {
            if session.capability.is_persistent() {
                continue;
            }
            if let Some(run_id) = session.run_id {
                *counts.entry(run_id).or_insert(0) += 1;
            }
        }
        Ok(counts)
    }

    /// Checkpoint the WAL and release the handle.
    pub fn close(self) -> Result<()> {
        let conn = self.conn.into_inner().unwrap();
        super::checkpoint(&conn)?;
        Ok(())
    }
}

const SELECT_SESSION: &str = "SELECT agent_name, capability, worktree_path, branch_name, bead_id, pane_name,
        state, pid, parent_agent, depth, run_id, started_at, last_activity,
        stalled_since, escalation_level
 FROM sessions";

fn row_to_session(row: &Row) -> rusqlite::Result<AgentSession> {
    let capability: String = row.get(1)?;
    let state: String = row.get(6)?;
    let worktree: String = row.get(2)?;
    let started_at: String = row.get(11)?;
    let last_activity: String = row.get(12)?;
    let stalled_since: Option<String> = row.get(13)?;
    Ok(AgentSession {
        agent_name: row.get(0)?,
        capability: Capability::parse(&capability)
            .map_err(|_| rusqlite::Error::InvalidQuery)?,
        worktree_path: PathBuf::from(worktree),
        branch_name: row.get(3)?,
        bead_id: row.get(4)?,
        pane_name: row.get(5)?,
        state: SessionState::parse(&state).map_err(|_| rusqlite::Error::InvalidQuery)?,
        pid: row.get(7)?,
        parent_agent: row.get(8)?,
        depth: row.get(9)?,
        run_id: row.get(10)?,
        started_at: parse_ts(&started_at),
        last_activity: parse_ts(&last_activity),
        stalled_since: stalled_since.as_deref().map(parse_ts),
        escalation_level: row.get(14)?,
    })
}

fn row_to_run(row: &Row) -> rusqlite::Result<Run> {
    let status: String = row.get(2)?;
    let created_at: String = row.get(4)?;
    let completed_at: Option<String> = row.get(5)?;
    Ok(Run {
        run_id: row.get(0)?,
        objective: row.get(1)?,
        status: RunStatus::parse(&status).map_err(|_| rusqlite::Error::InvalidQuery)?,
        agent_count: row.get(3)?,
        created_at: parse_ts(&created_at),
        completed_at: completed_at.as_deref().map(parse_ts),
    })
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}
