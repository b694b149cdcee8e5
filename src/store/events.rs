//! Event store (`events.db`).
//!
//! Insert-only append log of structured events plus in-store tool
//! correlation. Also hosts the per-session metric summaries and periodic
//! token snapshots that survive after transcripts are gone.

use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS events (
    id               INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id           TEXT,
    agent_name       TEXT NOT NULL,
    session_id       TEXT,
    event_kind       TEXT NOT NULL,
    tool_name        TEXT,
    tool_args        TEXT,
    tool_duration_ms INTEGER,
    level            TEXT NOT NULL DEFAULT 'info',
    payload          TEXT,
    created_at       TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_events_agent_time ON events(agent_name, created_at);
CREATE INDEX IF NOT EXISTS idx_events_run_time ON events(run_id, created_at);
CREATE INDEX IF NOT EXISTS idx_events_kind_time ON events(event_kind, created_at);
CREATE INDEX IF NOT EXISTS idx_events_tool_agent ON events(tool_name, agent_name);
CREATE INDEX IF NOT EXISTS idx_events_errors ON events(created_at) WHERE level = 'error';

CREATE TABLE IF NOT EXISTS session_metrics (
    agent_name       TEXT NOT NULL,
    bead_id          TEXT NOT NULL,
    tool_calls       INTEGER NOT NULL DEFAULT 0,
    input_tokens     INTEGER NOT NULL DEFAULT 0,
    output_tokens    INTEGER NOT NULL DEFAULT 0,
    duration_ms      INTEGER NOT NULL DEFAULT 0,
    outcome          TEXT NOT NULL DEFAULT '',
    updated_at       TEXT NOT NULL,
    PRIMARY KEY (agent_name, bead_id)
);

CREATE TABLE IF NOT EXISTS token_snapshots (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    agent_name    TEXT NOT NULL,
    input_tokens  INTEGER NOT NULL,
    output_tokens INTEGER NOT NULL,
    created_at    TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_snapshots_agent ON token_snapshots(agent_name, created_at);
";

/// Kind of a stored event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    ToolStart,
    ToolEnd,
    SessionStart,
    SessionEnd,
    MailSent,
    MailReceived,
    Error,
    Custom,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::ToolStart => "tool_start",
            EventKind::ToolEnd => "tool_end",
            EventKind::SessionStart => "session_start",
            EventKind::SessionEnd => "session_end",
            EventKind::MailSent => "mail_sent",
            EventKind::MailReceived => "mail_received",
            EventKind::Error => "error",
            EventKind::Custom => "custom",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "tool_start" => Ok(EventKind::ToolStart),
            "tool_end" => Ok(EventKind::ToolEnd),
            "session_start" => Ok(EventKind::SessionStart),
            "session_end" => Ok(EventKind::SessionEnd),
            "mail_sent" => Ok(EventKind::MailSent),
            "mail_received" => Ok(EventKind::MailReceived),
            "error" => Ok(EventKind::Error),
            "custom" => Ok(EventKind::Custom),
            other => Err(Error::Validation(format!("unknown event kind: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EventLevel {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl EventLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventLevel::Debug => "debug",
            EventLevel::Info => "info",
            EventLevel::Warn => "warn",
            EventLevel::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "debug" => Ok(EventLevel::Debug),
            "info" => Ok(EventLevel::Info),
            "warn" => Ok(EventLevel::Warn),
            "error" => Ok(EventLevel::Error),
            other => Err(Error::Validation(format!("unknown event level: {}", other))),
        }
    }
}

/// One row of the append log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredEvent {
    pub id: i64,
    pub run_id: Option<String>,
    pub agent_name: String,
    pub session_id: Option<String>,
    pub kind: EventKind,
    pub tool_name: Option<String>,
    /// Filtered tool arguments, JSON-encoded (see the tool filter module).
    pub tool_args: Option<String>,
    /// Back-filled by correlation; null until a matching tool_end lands.
    pub tool_duration_ms: Option<i64>,
    pub level: EventLevel,
    pub payload: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl StoredEvent {
    pub fn new(agent_name: impl Into<String>, kind: EventKind) -> Self {
        Self {
            id: 0,
            run_id: None,
            agent_name: agent_name.into(),
            session_id: None,
            kind,
            tool_name: None,
            tool_args: None,
            tool_duration_ms: None,
            level: EventLevel::Info,
            payload: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_tool(mut self, name: impl Into<String>, args: Option<String>) -> Self {
        self.tool_name = Some(name.into());
        self.tool_args = args;
        self
    }

    pub fn with_run(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    pub fn with_level(mut self, level: EventLevel) -> Self {
        self.level = level;
        self
    }

    pub fn with_payload(mut self, payload: impl Into<String>) -> Self {
        self.payload = Some(payload.into());
        self
    }
}

/// Aggregate statistics for one tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolStat {
    pub tool_name: String,
    pub count: u64,
    pub avg_duration_ms: Option<f64>,
    pub max_duration_ms: Option<i64>,
}

/// Upsert-replace summary of a finished session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMetrics {
    pub agent_name: String,
    pub bead_id: String,
    pub tool_calls: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub duration_ms: u64,
    pub outcome: String,
}

/// Periodic token usage sample.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenSnapshot {
    pub agent_name: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub created_at: DateTime<Utc>,
}

pub struct EventStore {
    conn: Mutex<Connection>,
}

impl EventStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = super::open_db(path, SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn memory() -> Result<Self> {
        let conn = super::open_memory(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Append an event. Returns the row id.
    pub fn insert(&self, event: &StoredEvent) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO events
             (run_id, agent_name, session_id, event_kind, tool_name, tool_args,
              tool_duration_ms, level, payload, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                event.run_id,
                event.agent_name,
                event.session_id,
                event.kind.as_str(),
                event.tool_name,
                event.tool_args,
                event.tool_duration_ms,
                event.level.as_str(),
                event.payload,
                event.created_at.to_rfc3339(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Pair the most recent un-timed `tool_start` for (`agent`, `tool`) with
    /// a completion happening now. Back-fills `tool_duration_ms` on the start
    /// row and returns its id and the duration, or `None` when no candidate
    /// exists (the caller still inserts its `tool_end`).
    pub fn correlate_tool_end(&self, agent_name: &str, tool_name: &str) -> Result<Option<(i64, i64)>> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;

        let candidate: Option<(i64, String)> = tx
            .query_row(
                "SELECT id, created_at FROM events
                 WHERE agent_name = ?1 AND tool_name = ?2
                   AND event_kind = 'tool_start' AND tool_duration_ms IS NULL
                 ORDER BY id DESC LIMIT 1",
                params![agent_name, tool_name],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let Some((start_id, started_at)) = candidate else {
            return Ok(None);
        };

        let started = DateTime::parse_from_rfc3339(&started_at)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| Error::Store(format!("bad event timestamp: {}", e)))?;
        let duration_ms = (Utc::now() - started).num_milliseconds().max(0);

        tx.execute(
            "UPDATE events SET tool_duration_ms = ?1 WHERE id = ?2",
            params![duration_ms, start_id],
        )?;
        tx.commit()?;
        Ok(Some((start_id, duration_ms)))
    }

    // ── Queries ──

    pub fn by_agent(&self, agent_name: &str, limit: usize) -> Result<Vec<StoredEvent>> {
        self.query_events(
            &format!(
                "{} WHERE agent_name = ?1 ORDER BY created_at DESC, id DESC LIMIT ?2",
                SELECT_EVENT
            ),
            params![agent_name, limit as i64],
        )
    }

    pub fn by_run(&self, run_id: &str, limit: usize) -> Result<Vec<StoredEvent>> {
        self.query_events(
            &format!(
                "{} WHERE run_id = ?1 ORDER BY created_at DESC, id DESC LIMIT ?2",
                SELECT_EVENT
            ),
            params![run_id, limit as i64],
        )
    }

    /// Error-level events across all agents, newest first.
    pub fn errors(&self, limit: usize) -> Result<Vec<StoredEvent>> {
        self.query_events(
            &format!(
                "{} WHERE level = 'error' ORDER BY created_at DESC, id DESC LIMIT ?1",
                SELECT_EVENT
            ),
            params![limit as i64],
        )
    }

    /// Chronological view since a required lower bound; id breaks ties.
    pub fn timeline(&self, since: DateTime<Utc>) -> Result<Vec<StoredEvent>> {
        self.query_events(
            &format!(
                "{} WHERE created_at >= ?1 ORDER BY created_at ASC, id ASC",
                SELECT_EVENT
            ),
            params![since.to_rfc3339()],
        )
    }

    /// Per-tool aggregates: count, mean and max duration (nulls skipped).
    pub fn tool_stats(&self) -> Result<Vec<ToolStat>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT tool_name, COUNT(*), AVG(tool_duration_ms), MAX(tool_duration_ms)
             FROM events
             WHERE event_kind = 'tool_start' AND tool_name IS NOT NULL
             GROUP BY tool_name
             ORDER BY COUNT(*) DESC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(ToolStat {
                tool_name: row.get(0)?,
                count: row.get::<_, i64>(1)? as u64,
                avg_duration_ms: row.get(2)?,
                max_duration_ms: row.get(3)?,
            })
        })?;
        let mut stats = Vec::new();
        for row in rows {
            stats.push(row?);
        }
        Ok(stats)
    }

    fn query_events(&self, sql: &str, params: impl rusqlite::Params) -> Result<Vec<StoredEvent>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(params, row_to_event)?;
        let mut events = Vec::new();
        for row in rows {
            events.push(row?);
        }
        Ok(events)
    }

    // ── Purge ──

    pub fn purge_by_age(&self, max_age: Duration) -> Result<usize> {
        let cutoff = (Utc::now() - max_age).to_rfc3339();
        let conn = self.conn.lock().unwrap();
        let n = conn.execute("DELETE FROM events WHERE created_at < ?1", params![cutoff])?;
        Ok(n)
    }

    pub fn purge_by_agent(&self, agent_name: &str) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            "DELETE FROM events WHERE agent_name = ?1",
            params![agent_name],
        )?;
        Ok(n)
    }

    pub fn purge_all(&self) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute("DELETE FROM events", [])?;
        Ok(n)
    }

    // ── Metrics & snapshots ──

    /// Upsert-replace the summary row for (`agent`, `bead`).
    pub fn record_session_metrics(&self, metrics: &SessionMetrics) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO session_metrics
             (agent_name, bead_id, tool_calls, input_tokens, output_tokens, duration_ms, outcome, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                metrics.agent_name,
                metrics.bead_id,
                metrics.tool_calls as i64,
                metrics.input_tokens as i64,
                metrics.output_tokens as i64,
                metrics.duration_ms as i64,
                metrics.outcome,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn get_session_metrics(&self, agent_name: &str, bead_id: &str) -> Result<Option<SessionMetrics>> {
        let conn = self.conn.lock().unwrap();
        let metrics = conn
            .query_row(
                "SELECT agent_name, bead_id, tool_calls, input_tokens, output_tokens, duration_ms, outcome
                 FROM session_metrics WHERE agent_name = ?1 AND bead_id = ?2",
                params![agent_name, bead_id],
                |row| {
                    Ok(SessionMetrics {
                        agent_name: row.get(0)?,
                        bead_id: row.get(1)?,
                        tool_calls: row.get::<_, i64>(2)? as u64,
                        input_tokens: row.get::<_, i64>(3)? as u64,
                        output_tokens: row.get::<_, i64>(4)? as u64,
                        duration_ms: row.get::<_, i64>(5)? as u64,
                        outcome: row.get(6)?,
                    })
                },
            )
            .optional()?;
        Ok(metrics)
    }

    pub fn record_token_snapshot(&self, snapshot: &TokenSnapshot) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO token_snapshots (agent_name, input_tokens, output_tokens, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                snapshot.agent_name,
                snapshot.input_tokens as i64,
                snapshot.output_tokens as i64,
                snapshot.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn token_history(&self, agent_name: &str) -> Result<Vec<TokenSnapshot>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT agent_name, input_tokens, output_tokens, created_at
             FROM token_snapshots WHERE agent_name = ?1 ORDER BY created_at ASC, id ASC",
        )?;
        let rows = stmt.query_map(params![agent_name], |row| {
            let created_at: String = row.get(3)?;
            Ok(TokenSnapshot {
                agent_name: row.get(0)?,
                input_tokens: row.get::<_, i64>(1)? as u64,
                output_tokens: row.get::<_, i64>(2)? as u64,
                created_at: DateTime::parse_from_rfc3339(&created_at)
                    .map(|t| t.with_timezone(&Utc))
                    .unwrap_or_else(|_| Utc::now()),
            })
        })?;
        let mut snapshots = Vec::new();
        for row in rows {
            snapshots.push(row?);
        }
        Ok(snapshots)
    }

    /// Checkpoint the WAL and release the handle.
    pub fn close(self) -> Result<()> {
        let conn = self.conn.into_inner().unwrap();
        super::checkpoint(&conn)?;
        Ok(())
    }
}

const SELECT_EVENT: &str = "SELECT id, run_id, agent_name, session_id, event_kind, tool_name, tool_args,
        tool_duration_ms, level, payload, created_at
 FROM events";

fn row_to_event(row: &Row) -> rusqlite::Result<StoredEvent> {
    let kind: String = row.get(4)?;
    let level: String = row.get(8)?;
    let created_at: String = row.get(10)?;
    Ok(StoredEvent {
        id: row.get(0)?,
        run_id: row.get(1)?,
        agent_name: row.get(2)?,
        session_id: row.get(3)?,
        kind: EventKind::parse(&kind).map_err(|_| rusqlite::Error::InvalidQuery)?,
        tool_name: row.get(5)?,
        tool_args: row.get(6)?,
        tool_duration_ms: row.get(7)?,
        level: EventLevel::parse(&level).map_err(|_| rusqlite::Error::InvalidQuery)?,
        payload: row.get(9)?,
        created_at: DateTime::parse_from_rfc3339(&created_at)
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
    })
}
