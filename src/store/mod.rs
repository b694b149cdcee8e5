//! Durable stores for the orchestration core.
//!
//! Four independent SQLite databases live in the project state directory:
//! sessions (+ runs), mail, events (+ metrics) and the merge queue. Each
//! store owns its rows exclusively; joins happen in-process by identity
//! fields. All stores share the same pragmas: WAL journaling, a 5-second
//! busy timeout, and normal synchronous mode.

use std::path::Path;

use rusqlite::Connection;

use crate::Result;

pub mod events;
pub mod mail;
pub mod merge;
pub mod sessions;

pub use events::{
    EventKind, EventLevel, EventStore, SessionMetrics, StoredEvent, TokenSnapshot, ToolStat,
};
pub use mail::{MailFilter, MailMessage, MailStore, MessageType, Priority};
pub use merge::{MergeEntry, MergeQueue, MergeStatus};
pub use sessions::{SessionStore, SessionStoreOpen};

/// Busy timeout shared by every store, in milliseconds.
pub const BUSY_TIMEOUT_MS: u32 = 5000;

fn apply_pragmas(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(&format!(
        "PRAGMA journal_mode = WAL;
         PRAGMA synchronous = NORMAL;
         PRAGMA busy_timeout = {};
         PRAGMA foreign_keys = ON;",
        BUSY_TIMEOUT_MS
    ))
}

/// Open a database file with shared pragmas and apply the given schema.
pub(crate) fn open_db(path: &Path, schema: &str) -> Result<Connection> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let conn = Connection::open(path)?;
    apply_pragmas(&conn)?;
    conn.execute_batch(schema)?;
    Ok(conn)
}

/// In-memory database with the same pragmas (tests, sub-agents).
pub(crate) fn open_memory(schema: &str) -> Result<Connection> {
    let conn = Connection::open_in_memory()?;
    apply_pragmas(&conn)?;
    conn.execute_batch(schema)?;
    Ok(conn)
}

/// Checkpoint the WAL into the main file before releasing a handle.
pub(crate) fn checkpoint(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")
}
