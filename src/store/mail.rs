//! Mail store (`mail.db`).
//!
//! Durable mailbox for inter-agent messages. One row per recipient: group
//! addresses are fanned out by the client *before* insertion, so the store
//! only ever sees concrete agent names in `recipient`.

use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS messages (
    id         TEXT PRIMARY KEY,
    sender     TEXT NOT NULL,
    recipient  TEXT NOT NULL,
    subject    TEXT NOT NULL,
    body       TEXT NOT NULL,
    msg_type   TEXT NOT NULL DEFAULT 'status',
    priority   TEXT NOT NULL DEFAULT 'normal',
    thread_id  TEXT,
    payload    TEXT,
    read       INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_messages_recipient_unread
    ON messages(recipient, read, created_at);
CREATE INDEX IF NOT EXISTS idx_messages_thread ON messages(thread_id);
";

/// Protocol type of a message payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Status,
    Question,
    Result,
    Error,
    WorkerDone,
    MergeReady,
    Merged,
    MergeFailed,
    Escalation,
    HealthCheck,
    Dispatch,
    Assign,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Status => "status",
            MessageType::Question => "question",
            MessageType::Result => "result",
            MessageType::Error => "error",
            MessageType::WorkerDone => "worker_done",
            MessageType::MergeReady => "merge_ready",
            MessageType::Merged => "merged",
            MessageType::MergeFailed => "merge_failed",
            MessageType::Escalation => "escalation",
            MessageType::HealthCheck => "health_check",
            MessageType::Dispatch => "dispatch",
            MessageType::Assign => "assign",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "status" => Ok(MessageType::Status),
            "question" => Ok(MessageType::Question),
            "result" => Ok(MessageType::Result),
            "error" => Ok(MessageType::Error),
            "worker_done" => Ok(MessageType::WorkerDone),
            "merge_ready" => Ok(MessageType::MergeReady),
            "merged" => Ok(MessageType::Merged),
            "merge_failed" => Ok(MessageType::MergeFailed),
            "escalation" => Ok(MessageType::Escalation),
            "health_check" => Ok(MessageType::HealthCheck),
            "dispatch" => Ok(MessageType::Dispatch),
            "assign" => Ok(MessageType::Assign),
            other => Err(Error::mail(format!("unknown message type: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
            Priority::Urgent => "urgent",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "low" => Ok(Priority::Low),
            "normal" => Ok(Priority::Normal),
            "high" => Ok(Priority::High),
            "urgent" => Ok(Priority::Urgent),
            other => Err(Error::mail(format!("unknown priority: {}", other))),
        }
    }
}

/// A single mail row. `to` is always one concrete recipient.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailMessage {
    pub id: String,
    pub from: String,
    pub to: String,
    pub subject: String,
    pub body: String,
    pub msg_type: MessageType,
    pub priority: Priority,
    /// Root message id of the conversation this belongs to, if any.
    pub thread_id: Option<String>,
    /// JSON-encoded structured body typed by `msg_type`.
    pub payload: Option<String>,
    pub read: bool,
    pub created_at: DateTime<Utc>,
}

impl MailMessage {
    pub fn new(
        from: impl Into<String>,
        to: impl Into<String>,
        subject: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            id: String::new(),
            from: from.into(),
            to: to.into(),
            subject: subject.into(),
            body: body.into(),
            msg_type: MessageType::Status,
            priority: Priority::Normal,
            thread_id: None,
            payload: None,
            read: false,
            created_at: Utc::now(),
        }
    }

    pub fn with_type(mut self, msg_type: MessageType) -> Self {
        self.msg_type = msg_type;
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_thread(mut self, thread_id: impl Into<String>) -> Self {
        self.thread_id = Some(thread_id.into());
        self
    }

    pub fn with_payload(mut self, payload: impl Into<String>) -> Self {
        self.payload = Some(payload.into());
        self
    }
}

/// Generate a message id: printable prefix plus 16 characters from the
/// thread RNG (a CSPRNG).
pub fn generate_message_id() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(16)
        .map(char::from)
        .collect();
    format!("msg-{}", suffix)
}

/// Dynamic filter for [`MailStore::get_all`].
#[derive(Debug, Clone, Default)]
pub struct MailFilter {
    pub from: Option<String>,
    pub to: Option<String>,
    pub unread_only: bool,
    pub limit: Option<usize>,
}

pub struct MailStore {
    conn: Mutex<Connection>,
}

impl MailStore {
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

    /// Insert a message, auto-generating id and created_at if missing.
    /// Returns the stored id.
    pub fn insert(&self, message: &MailMessage) -> Result<String> {
        let id = if message.id.is_empty() {
            generate_message_id()
        } else {
            message.id.clone()
        };
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO messages
             (id, sender, recipient, subject, body, msg_type, priority, thread_id, payload, read, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                id,
                message.from,
                message.to,
                message.subject,
                message.body,
                message.msg_type.as_str(),
                message.priority.as_str(),
                message.thread_id,
                message.payload,
                message.read as i64,
                message.created_at.to_rfc3339(),
            ],
        )
        .map_err(|e| Error::Mail {
            id: Some(id.clone()),
            message: format!("insert failed: {}", e),
        })?;
        Ok(id)
    }

    /// Unread mail for an agent, oldest first (ties broken by id).
    pub fn get_unread(&self, agent: &str) -> Result<Vec<MailMessage>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "{} WHERE recipient = ?1 AND read = 0 ORDER BY created_at ASC, id ASC",
            SELECT_MESSAGE
        ))?;
        let rows = stmt.query_map(params![agent], row_to_message)?;
        collect_messages(rows)
    }

    /// Atomically fetch an agent's unread mail and mark every returned row
    /// read in the same transaction.
    pub fn take_unread(&self, agent: &str) -> Result<Vec<MailMessage>> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
        let messages = {
            let mut stmt = tx.prepare(&format!(
                "{} WHERE recipient = ?1 AND read = 0 ORDER BY created_at ASC, id ASC",
                SELECT_MESSAGE
            ))?;
            let rows = stmt.query_map(params![agent], row_to_message)?;
            collect_messages(rows)?
        };
        for message in &messages {
            tx.execute(
                "UPDATE messages SET read = 1 WHERE id = ?1",
                params![message.id],
            )?;
        }
        tx.commit()?;
        Ok(messages)
    }

    /// All mail matching a dynamic filter, newest first.
    pub fn get_all(&self, filter: &MailFilter) -> Result<Vec<MailMessage>> {
        let mut sql = format!("{} WHERE 1=1", SELECT_MESSAGE);
        let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
        if let Some(from) = &filter.from {
            sql.push_str(&format!(" AND sender = ?{}", args.len() + 1));
            args.push(Box::new(from.clone()));
        }
        if let Some(to) = &filter.to {
            sql.push_str(&format!(" AND recipient = ?{}", args.len() + 1));
            args.push(Box::new(to.clone()));
        }
        if filter.unread_only {
            sql.push_str(" AND read = 0");
        }
        sql.push_str(" ORDER BY created_at DESC, id DESC");
        if let Some(limit) = filter.limit {
            sql.push_str(&format!(" LIMIT {}", limit));
        }

        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            rusqlite::params_from_iter(args.iter().map(|a| a.as_ref())),
            row_to_message,
        )?;
        collect_messages(rows)
    }

    pub fn get_by_id(&self, id: &str) -> Result<Option<MailMessage>> {
        let conn = self.conn.lock().unwrap();
        let message = conn
            .query_row(
                &format!("{} WHERE id = ?1", SELECT_MESSAGE),
                params![id],
                row_to_message,
            )
            .optional()?;
        Ok(message)
    }

    /// Conversation view: the thread root plus every reply, oldest first.
    pub fn get_by_thread(&self, thread_id: &str) -> Result<Vec<MailMessage>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "{} WHERE id = ?1 OR thread_id = ?1 ORDER BY created_at ASC, id ASC",
            SELECT_MESSAGE
        ))?;
        let rows = stmt.query_map(params![thread_id], row_to_message)?;
        collect_messages(rows)
    }

    pub fn mark_read(&self, id: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute("UPDATE messages SET read = 1 WHERE id = ?1", params![id])?;
        if changed == 0 {
            return Err(Error::Mail {
                id: Some(id.to_string()),
                message: "message not found".to_string(),
            });
        }
        Ok(())
    }

    /// Delete read messages older than `max_age`. Returns the count deleted.
    pub fn purge_by_age(&self, max_age: Duration) -> Result<usize> {
        let cutoff = (Utc::now() - max_age).to_rfc3339();
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            "DELETE FROM messages WHERE read = 1 AND created_at < ?1",
            params![cutoff],
        )?;
        Ok(n)
    }

    /// Delete all mail to or from an agent. Returns the count deleted.
    pub fn purge_by_agent(&self, agent: &str) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            "DELETE FROM messages WHERE sender = ?1 OR recipient = ?1",
            params![agent],
        )?;
        Ok(n)
    }

    pub fn purge_all(&self) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute("DELETE FROM messages", [])?;
        Ok(n)
    }

    /// Checkpoint the WAL and release the handle.
    pub fn close(self) -> Result<()> {
        let conn = self.conn.into_inner().unwrap();
        super::checkpoint(&conn)?;
        Ok(())
    }
}

const SELECT_MESSAGE: &str = "SELECT id, sender, recipient, subject, body, msg_type, priority, thread_id, payload, read, created_at
 FROM messages";

fn row_to_message(row: &Row) -> rusqlite::Result<MailMessage> {
    let msg_type: String = row.get(5)?;
    let priority: String = row.get(6)?;
    let read: i64 = row.get(9)?;
    let created_at: String = row.get(10)?;
    Ok(MailMessage {
        id: row.get(0)?,
        from: row.get(1)?,
        to: row.get(2)?,
        subject: row.get(3)?,
        body: row.get(4)?,
        msg_type: MessageType::parse(&msg_type).map_err(|_| rusqlite::Error::InvalidQuery)?,
        priority: Priority::parse(&priority).map_err(|_| rusqlite::Error::InvalidQuery)?,
        thread_id: row.get(7)?,
        payload: row.get(8)?,
        read: read != 0,
        created_at: DateTime::parse_from_rfc3339(&created_at)
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
    })
}

fn collect_messages(
    rows: rusqlite::MappedRows<'_, impl FnMut(&Row) -> rusqlite::Result<MailMessage>>,
) -> Result<Vec<MailMessage>> {
    let mut messages = Vec::new();
    for row in rows {
        messages.push(row?);
    }
    Ok(messages)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mem() -> MailStore {
        MailStore::memory().unwrap()
    }

    fn msg(from: &str, to: &str, body: &str) -> MailMessage {
        MailMessage::new(from, to, "subject", body)
    }

    // ── insert / get ──

    #[test]
    fn insert_generates_id() {
        let s = mem();
        let id = s.insert(&msg("a", "b", "hi")).unwrap();
        assert!(id.starts_with("msg-"));
        assert_eq!(id.len(), 4 + 16);
    }

    #[test]
    fn insert_get_by_id_roundtrip() {
        let s = mem();
        let original = msg("a", "b", "hello")
            .with_type(MessageType::Question)
            .with_priority(Priority::High)
            .with_payload(r#"{"k":1}"#);
        let id = s.insert(&original).unwrap();

        let got = s.get_by_id(&id).unwrap().unwrap();
        assert_eq!(got.from, "a");
        assert_eq!(got.to, "b");
        assert_eq!(got.body, "hello");
        assert_eq!(got.msg_type, MessageType::Question);
        assert_eq!(got.priority, Priority::High);
        assert_eq!(got.payload.as_deref(), Some(r#"{"k":1}"#));
        assert!(!got.read);
    }

    #[test]
    fn duplicate_id_rejected() {
        let s = mem();
        let mut m = msg("a", "b", "x");
        m.id = "msg-fixed".into();
        s.insert(&m).unwrap();
        let err = s.insert(&m).unwrap_err();
        assert!(matches!(err, Error::Mail { .. }));
    }

    // ── unread ordering ──

    #[test]
    fn get_unread_is_created_at_ascending() {
        let s = mem();
        let base = Utc::now();
        for i in [3i64, 1, 2] {
            let mut m = msg("a", "b", &format!("m{}", i));
            m.created_at = base + Duration::seconds(i);
            s.insert(&m).unwrap();
        }
        let unread = s.get_unread("b").unwrap();
        let bodies: Vec<&str> = unread.iter().map(|m| m.body.as_str()).collect();
        assert_eq!(bodies, vec!["m1", "m2", "m3"]);
    }

    #[test]
    fn get_unread_excludes_read_and_other_recipients() {
        let s = mem();
        let id = s.insert(&msg("a", "b", "one")).unwrap();
        s.insert(&msg("a", "c", "other")).unwrap();
        s.mark_read(&id).unwrap();
        assert!(s.get_unread("b").unwrap().is_empty());
        assert_eq!(s.get_unread("c").unwrap().len(), 1);
    }

    #[test]
    fn take_unread_is_atomic_read_and_mark() {
        let s = mem();
        s.insert(&msg("a", "b", "one")).unwrap();
        s.insert(&msg("a", "b", "two")).unwrap();

        let taken = s.take_unread("b").unwrap();
        assert_eq!(taken.len(), 2);
        // Second call sees nothing
        assert!(s.take_unread("b").unwrap().is_empty());
        // Rows still exist, marked read
        let all = s
            .get_all(&MailFilter {
                to: Some("b".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(all.len(), 2);
        assert!(all.iter().all(|m| m.read));
    }

    // ── filters ──

    #[test]
    fn get_all_filters_compose() {
        let s = mem();
        s.insert(&msg("a", "b", "1")).unwrap();
        s.insert(&msg("a", "c", "2")).unwrap();
        s.insert(&msg("x", "b", "3")).unwrap();

        let from_a_to_b = s
            .get_all(&MailFilter {
                from: Some("a".into()),
                to: Some("b".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(from_a_to_b.len(), 1);
        assert_eq!(from_a_to_b[0].body, "1");
    }

    #[test]
    fn get_all_respects_limit() {
        let s = mem();
        for i in 0..10 {
            s.insert(&msg("a", "b", &i.to_string())).unwrap();
        }
        let limited = s
            .get_all(&MailFilter {
                limit: Some(4),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(limited.len(), 4);
    }

    // ── threads ──

    #[test]
    fn thread_view_includes_root_and_replies() {
        let s = mem();
        let mut root = msg("a", "b", "root");
        root.id = "msg-root00000000000".into();
        s.insert(&root).unwrap();
        s.insert(&msg("b", "a", "re 1").with_thread("msg-root00000000000"))
            .unwrap();
        s.insert(&msg("a", "b", "re 2").with_thread("msg-root00000000000"))
            .unwrap();
        s.insert(&msg("a", "b", "unrelated")).unwrap();

        let thread = s.get_by_thread("msg-root00000000000").unwrap();
        let bodies: Vec<&str> = thread.iter().map(|m| m.body.as_str()).collect();
        assert_eq!(bodies, vec!["root", "re 1", "re 2"]);
    }

    // ── purge ──

    #[test]
    fn purge_by_age_only_touches_read() {
        let s = mem();
        let mut old_read = msg("a", "b", "old");
        old_read.created_at = Utc::now() - Duration::days(30);
        let id = s.insert(&old_read).unwrap();
        s.mark_read(&id).unwrap();

        let mut old_unread = msg("a", "b", "old unread");
        old_unread.created_at = Utc::now() - Duration::days(30);
        s.insert(&old_unread).unwrap();

        assert_eq!(s.purge_by_age(Duration::days(7)).unwrap(), 1);
        assert_eq!(s.get_unread("b").unwrap().len(), 1);
    }

    #[test]
    fn purge_by_agent_counts_both_directions() {
        let s = mem();
        s.insert(&msg("a", "b", "1")).unwrap();
        s.insert(&msg("b", "c", "2")).unwrap();
        s.insert(&msg("x", "y", "3")).unwrap();
        assert_eq!(s.purge_by_agent("b").unwrap(), 2);
        assert_eq!(s.purge_all().unwrap(), 1);
    }

    #[test]
    fn mark_read_unknown_id() {
        let s = mem();
        let err = s.mark_read("msg-missing").unwrap_err();
        assert!(matches!(err, Error::Mail { id: Some(_), .. }));
    }

    #[test]
    fn message_id_generation_unique() {
        let a = generate_message_id();
        let b = generate_message_id();
        assert_ne!(a, b);
        assert!(a.starts_with("msg-"));
    }
}
