use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Agent error [{agent}]: {message}")]
    Agent { agent: String, message: String },

    #[error("Mail error{}: {message}", id.as_deref().map(|i| format!(" [{}]", i)).unwrap_or_default())]
    Mail {
        id: Option<String>,
        message: String,
    },

    #[error("Merge error [{branch}, tier {}]: {message}", tier.map(|t| t.to_string()).unwrap_or_else(|| "-".into()))]
    Merge {
        branch: String,
        tier: Option<u8>,
        message: String,
    },

    #[error("Lifecycle error: invalid transition from {from} to {to}")]
    Lifecycle { from: String, to: String },

    #[error("Checkpoint error [{agent}]: {message}")]
    Checkpoint { agent: String, message: String },

    #[error("Worktree error [{branch} at {}]: {message}", path.display())]
    Worktree {
        branch: String,
        path: PathBuf,
        message: String,
    },

    #[error("Store error: {0}")]
    Store(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),
}

impl Error {
    /// Machine-readable kind tag, stable across releases.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Config(_) => "config",
            Error::Validation(_) => "validation",
            Error::Agent { .. } => "agent",
            Error::Mail { .. } => "mail",
            Error::Merge { .. } => "merge",
            Error::Lifecycle { .. } | Error::Checkpoint { .. } => "lifecycle",
            Error::Worktree { .. } => "worktree",
            Error::Store(_) => "store",
            Error::Timeout(_) => "store",
        }
    }

    /// Structured context map for `--json` consumers.
    pub fn context(&self) -> serde_json::Value {
        match self {
            Error::Agent { agent, .. } => serde_json::json!({ "agent": agent }),
            Error::Mail { id, .. } => serde_json::json!({ "message_id": id }),
            Error::Merge { branch, tier, .. } => {
                serde_json::json!({ "branch": branch, "tier": tier })
            }
            Error::Lifecycle { from, to } => serde_json::json!({ "from": from, "to": to }),
            Error::Checkpoint { agent, .. } => serde_json::json!({ "agent": agent }),
            Error::Worktree { branch, path, .. } => {
                serde_json::json!({ "branch": branch, "path": path.display().to_string() })
            }
            Error::Timeout(d) => serde_json::json!({ "timeout_ms": d.as_millis() as u64 }),
            _ => serde_json::json!({}),
        }
    }

    pub fn mail(message: impl Into<String>) -> Self {
        Error::Mail {
            id: None,
            message: message.into(),
        }
    }

    pub fn merge(branch: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Merge {
            branch: branch.into(),
            tier: None,
            message: message.into(),
        }
    }

    pub fn agent(agent: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Agent {
            agent: agent.into(),
            message: message.into(),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Store(format!("IO error: {}", e))
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::Store(format!("database error: {}", e))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Store(format!("JSON error: {}", e))
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Error::Config(format!("YAML error: {}", e))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
