//! Merge queue (`merge-queue.db`).
//!
//! FIFO backlog of branch integrations. Ordering is by the monotonic insert
//! id, never by `enqueued_at` (wall clocks skew). `dequeue` claims the head
//! inside one immediate transaction so concurrent resolvers cannot take the
//! same branch.

use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS merge_queue (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    branch_name   TEXT NOT NULL UNIQUE,
    bead_id       TEXT NOT NULL,
    agent_name    TEXT NOT NULL,
    files         TEXT NOT NULL DEFAULT '[]',
    status        TEXT NOT NULL DEFAULT 'pending',
    resolved_tier INTEGER,
    enqueued_at   TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_merge_status ON merge_queue(status, id);
";

/// Status of a queued branch integration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MergeStatus {
    Pending,
    Merging,
    Merged,
    Conflict,
    Failed,
}

impl MergeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MergeStatus::Pending => "pending",
            MergeStatus::Merging => "merging",
            MergeStatus::Merged => "merged",
            MergeStatus::Conflict => "conflict",
            MergeStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(MergeStatus::Pending),
            "merging" => Ok(MergeStatus::Merging),
            "merged" => Ok(MergeStatus::Merged),
            "conflict" => Ok(MergeStatus::Conflict),
            "failed" => Ok(MergeStatus::Failed),
            other => Err(Error::Validation(format!("unknown merge status: {}", other))),
        }
    }
}

/// One branch awaiting (or through) integration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeEntry {
    pub branch_name: String,
    pub bead_id: String,
    pub agent_name: String,
    /// Paths the agent reported modifying, used by the reimagine tier.
    pub files: Vec<String>,
    pub status: MergeStatus,
    /// Tier (1..=4) that produced the final outcome, null until resolved.
    pub resolved_tier: Option<u8>,
    pub enqueued_at: DateTime<Utc>,
}

impl MergeEntry {
    pub fn new(
        branch_name: impl Into<String>,
        bead_id: impl Into<String>,
        agent_name: impl Into<String>,
        files: Vec<String>,
    ) -> Self {
        Self {
            branch_name: branch_name.into(),
            bead_id: bead_id.into(),
            agent_name: agent_name.into(),
            files,
            status: MergeStatus::Pending,
            resolved_tier: None,
            enqueued_at: Utc::now(),
        }
    }
}

pub struct MergeQueue {
    conn: Mutex<Connection>,
}

impl MergeQueue {
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

    /// Append a branch to the queue. Status defaults to pending and
    /// `enqueued_at` is stamped here.
    pub fn enqueue(&self, entry: &MergeEntry) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO merge_queue (branch_name, bead_id, agent_name, files, status, enqueued_at)
             VALUES (?1, ?2, ?3, ?4, 'pending', ?5)",
            params![
                entry.branch_name,
                entry.bead_id,
                entry.agent_name,
                serde_json::to_string(&entry.files)?,
                Utc::now().to_rfc3339(),
            ],
        )
        .map_err(|e| Error::merge(&entry.branch_name, format!("enqueue failed: {}", e)))?;
        Ok(())
    }

    /// Claim the FIFO-head pending entry, flipping it to `merging`.
    pub fn dequeue(&self) -> Result<Option<MergeEntry>> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let entry = tx
            .query_row(
                &format!(
                    "{} WHERE status = 'pending' ORDER BY id ASC LIMIT 1",
                    SELECT_ENTRY
                ),
                [],
                row_to_entry,
            )
            .optional()?;
        let Some(mut entry) = entry else {
            return Ok(None);
        };
        tx.execute(
            "UPDATE merge_queue SET status = 'merging' WHERE branch_name = ?1",
            params![entry.branch_name],
        )?;
        tx.commit()?;
        entry.status = MergeStatus::Merging;
        Ok(Some(entry))
    }

    /// Look at the FIFO head without claiming it.
    pub fn peek(&self) -> Result<Option<MergeEntry>> {
        let conn = self.conn.lock().unwrap();
        let entry = conn
            .query_row(
                &format!(
                    "{} WHERE status = 'pending' ORDER BY id ASC LIMIT 1",
                    SELECT_ENTRY
                ),
                [],
                row_to_entry,
            )
            .optional()?;
        Ok(entry)
    }

    /// List entries, optionally restricted to one status, in queue order.
    pub fn list(&self, status: Option<MergeStatus>) -> Result<Vec<MergeEntry>> {
        let conn = self.conn.lock().unwrap();
        let mut entries = Vec::new();
        match status {
            Some(status) => {
                let mut stmt = conn.prepare(&format!(
                    "{} WHERE status = ?1 ORDER BY id ASC",
                    SELECT_ENTRY
                ))?;
                let rows = stmt.query_map(params![status.as_str()], row_to_entry)?;
                for row in rows {
                    entries.push(row?);
                }
            }
            None => {
                let mut stmt = conn.prepare(&format!("{} ORDER BY id ASC", SELECT_ENTRY))?;
                let rows = stmt.query_map([], row_to_entry)?;
                for row in rows {
                    entries.push(row?);
                }
            }
        }
        Ok(entries)
    }

    pub fn get(&self, branch_name: &str) -> Result<Option<MergeEntry>> {
        let conn = self.conn.lock().unwrap();
        let entry = conn
            .query_row(
                &format!("{} WHERE branch_name = ?1", SELECT_ENTRY),
                params![branch_name],
                row_to_entry,
            )
            .optional()?;
        Ok(entry)
    }

    /// Record the outcome for a branch, optionally stamping the winning tier.
    pub fn update_status(
        &self,
        branch_name: &str,
        status: MergeStatus,
        tier: Option<u8>,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE merge_queue SET status = ?1, resolved_tier = COALESCE(?2, resolved_tier)
             WHERE branch_name = ?3",
            params![status.as_str(), tier, branch_name],
        )?;
        if changed == 0 {
            return Err(Error::merge(branch_name, "queue entry not found"));
        }
        Ok(())
    }

    /// Checkpoint the WAL and release the handle.
    pub fn close(self) -> Result<()> {
        let conn = self.conn.into_inner().unwrap();
        super::checkpoint(&conn)?;
        Ok(())
    }
}

const SELECT_ENTRY: &str =
    "SELECT branch_name, bead_id, agent_name, files, status, resolved_tier, enqueued_at
 FROM merge_queue";

fn row_to_entry(row: &Row) -> rusqlite::Result<MergeEntry> {
    let files: String = row.get(3)?;
    let status: String = row.get(4)?;
    let enqueued_at: String = row.get(6)?;
    Ok(MergeEntry {
        branch_name: row.get(0)?,
        bead_id: row.get(1)?,
        agent_name: row.get(2)?,
        files: serde_json::from_str(&files).unwrap_or_default(),
        status: MergeStatus::parse(&status).map_err(|_| rusqlite::Error::InvalidQuery)?,
        resolved_tier: row.get(5)?,
        enqueued_at: DateTime::parse_from_rfc3339(&enqueued_at)
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mem() -> MergeQueue {
        MergeQueue::memory().unwrap()
    }

    fn entry(branch: &str) -> MergeEntry {
        MergeEntry::new(
            branch,
            "task-abc",
            "builder-1",
            vec!["src/a.ts".to_string()],
        )
    }

    #[test]
    fn enqueue_then_peek() {
        let q = mem();
        q.enqueue(&entry("overstory/builder-1/task-abc")).unwrap();
        let head = q.peek().unwrap().unwrap();
        assert_eq!(head.branch_name, "overstory/builder-1/task-abc");
        assert_eq!(head.status, MergeStatus::Pending);
        assert!(head.resolved_tier.is_none());
    }

    #[test]
    fn dequeue_is_fifo_by_insert_order() {
        let q = mem();
        q.enqueue(&entry("b/first")).unwrap();
        q.enqueue(&entry("b/second")).unwrap();
        q.enqueue(&entry("b/third")).unwrap();

        assert_eq!(q.dequeue().unwrap().unwrap().branch_name, "b/first");
        assert_eq!(q.dequeue().unwrap().unwrap().branch_name, "b/second");
        assert_eq!(q.dequeue().unwrap().unwrap().branch_name, "b/third");
        assert!(q.dequeue().unwrap().is_none());
    }

    #[test]
    fn dequeue_marks_merging() {
        let q = mem();
        q.enqueue(&entry("b/one")).unwrap();
        let taken = q.dequeue().unwrap().unwrap();
        assert_eq!(taken.status, MergeStatus::Merging);
        // No longer visible to peek
        assert!(q.peek().unwrap().is_none());
        // Still in the table
        assert_eq!(q.get("b/one").unwrap().unwrap().status, MergeStatus::Merging);
    }

    #[test]
    fn fifo_skips_non_pending() {
        let q = mem();
        q.enqueue(&entry("b/one")).unwrap();
        q.enqueue(&entry("b/two")).unwrap();
        q.update_status("b/one", MergeStatus::Failed, None).unwrap();
        assert_eq!(q.dequeue().unwrap().unwrap().branch_name, "b/two");
    }

    #[test]
    fn duplicate_branch_rejected() {
        let q = mem();
        q.enqueue(&entry("b/one")).unwrap();
        let err = q.enqueue(&entry("b/one")).unwrap_err();
        assert!(matches!(err, Error::Merge { .. }));
    }

    #[test]
    fn update_status_records_tier() {
        let q = mem();
        q.enqueue(&entry("b/one")).unwrap();
        q.update_status("b/one", MergeStatus::Merged, Some(2)).unwrap();
        let got = q.get("b/one").unwrap().unwrap();
        assert_eq!(got.status, MergeStatus::Merged);
        assert_eq!(got.resolved_tier, Some(2));
    }

    #[test]
    fn update_status_keeps_existing_tier_when_none() {
        let q = mem();
        q.enqueue(&entry("b/one")).unwrap();
        q.update_status("b/one", MergeStatus::Conflict, Some(3)).unwrap();
        q.update_status("b/one", MergeStatus::Failed, None).unwrap();
        assert_eq!(q.get("b/one").unwrap().unwrap().resolved_tier, Some(3));
    }

    #[test]
    fn update_status_unknown_branch() {
        let q = mem();
        assert!(q.update_status("b/ghost", MergeStatus::Merged, None).is_err());
    }

    #[test]
    fn list_filters_by_status() {
        let q = mem();
        q.enqueue(&entry("b/one")).unwrap();
        q.enqueue(&entry("b/two")).unwrap();
        q.update_status("b/one", MergeStatus::Merged, Some(1)).unwrap();

        assert_eq!(q.list(Some(MergeStatus::Pending)).unwrap().len(), 1);
        assert_eq!(q.list(Some(MergeStatus::Merged)).unwrap().len(), 1);
        assert_eq!(q.list(None).unwrap().len(), 2);
    }

    #[test]
    fn files_roundtrip() {
        let q = mem();
        let e = MergeEntry::new(
            "b/files",
            "t",
            "a",
            vec!["src/x.rs".into(), "src/y.rs".into()],
        );
        q.enqueue(&e).unwrap();
        let got = q.get("b/files").unwrap().unwrap();
        assert_eq!(got.files, vec!["src/x.rs", "src/y.rs"]);
    }
}
