//! Structured logging for the orchestration core.
//!
//! Two layers:
//! - a process-global file log (`overstory.log` under the state directory)
//!   with the `olog!` macro family, level-filtered;
//! - per-agent log directories (`logs/<agent>/<ts>/`) holding the launcher's
//!   `session.log`, `events.ndjson`, `tools.ndjson` and `errors.log` streams.
//!
//! Debug mode can be enabled with `OVERSTORY_DEBUG=1`.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::OnceLock;

static LOG_PATH: OnceLock<PathBuf> = OnceLock::new();
static LOG_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Info as u8);

/// Log levels for filtering messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
    Trace = 4,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
            LogLevel::Trace => "TRACE",
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            0 => LogLevel::Error,
            1 => LogLevel::Warn,
            2 => LogLevel::Info,
            3 => LogLevel::Debug,
            _ => LogLevel::Trace,
        }
    }
}

/// Initialize the global log file under `state_dir`.
///
/// Falls back to `~/.overstory/overstory.log` when no state directory is
/// given (library embedded outside a project).
pub fn init(state_dir: Option<&Path>) {
    let env_debug = std::env::var("OVERSTORY_DEBUG")
        .map(|v| v == "1" || v.to_lowercase() == "true")
        .unwrap_or(false);

    let level = if env_debug {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };
    LOG_LEVEL.store(level as u8, Ordering::SeqCst);

    let dir = state_dir
        .map(Path::to_path_buf)
        .or_else(|| dirs::home_dir().map(|h| h.join(".overstory")));
    if let Some(dir) = dir {
        let _ = std::fs::create_dir_all(&dir);
        LOG_PATH.set(dir.join("overstory.log")).ok();
    }
}

/// Set the minimum log level for output.
pub fn set_level(level: LogLevel) {
    LOG_LEVEL.store(level as u8, Ordering::SeqCst);
}

/// Get the current log level.
pub fn get_level() -> LogLevel {
    LogLevel::from_u8(LOG_LEVEL.load(Ordering::Relaxed))
}

/// Log a message at the specified level.
pub fn log_at(level: LogLevel, msg: &str) {
    let current_level = LogLevel::from_u8(LOG_LEVEL.load(Ordering::Relaxed));
    if level > current_level {
        return;
    }

    if let Some(path) = LOG_PATH.get() {
        if let Ok(mut file) = OpenOptions::new().create(true).append(true).open(path) {
            let timestamp = chrono::Local::now().format("%H:%M:%S%.3f");
            let _ = writeln!(file, "[{}] [{}] {}", timestamp, level.as_str(), msg);
        }
    }
}

pub fn error(msg: &str) {
    log_at(LogLevel::Error, msg);
}

pub fn warn(msg: &str) {
    log_at(LogLevel::Warn, msg);
}

pub fn info(msg: &str) {
    log_at(LogLevel::Info, msg);
}

pub fn debug(msg: &str) {
    log_at(LogLevel::Debug, msg);
}

pub fn trace(msg: &str) {
    log_at(LogLevel::Trace, msg);
}

/// Log macro for INFO level.
#[macro_export]
macro_rules! olog {
    ($($arg:tt)*) => {
        $crate::log::info(&format!($($arg)*))
    };
}

/// Log macro for ERROR level.
#[macro_export]
macro_rules! olog_error {
    ($($arg:tt)*) => {
        $crate::log::error(&format!($($arg)*))
    };
}

/// Log macro for WARN level.
#[macro_export]
macro_rules! olog_warn {
    ($($arg:tt)*) => {
        $crate::log::warn(&format!($($arg)*))
    };
}

/// Log macro for DEBUG level.
#[macro_export]
macro_rules! olog_debug {
    ($($arg:tt)*) => {
        $crate::log::debug(&format!($($arg)*))
    };
}

/// Log macro for TRACE level (very verbose).
#[macro_export]
macro_rules! olog_trace {
    ($($arg:tt)*) => {
        $crate::log::trace(&format!($($arg)*))
    };
}

/// Per-agent log directory: `logs/<agent>/<ts>/`.
///
/// The launcher writes four streams here; the watchdog's AI triage reads
/// the tail of `session.log`. Directories are timestamped per launch so a
/// respawned agent never clobbers its previous run.
pub struct AgentLogDir {
    root: PathBuf,
}

impl AgentLogDir {
    /// Create a fresh timestamped log directory for an agent launch.
    pub fn create(logs_root: &Path, agent_name: &str) -> std::io::Result<Self> {
        let ts = chrono::Utc::now().format("%Y%m%dT%H%M%SZ").to_string();
        let root = logs_root.join(agent_name).join(ts);
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// Open the most recent log directory for an agent, if any.
    pub fn latest(logs_root: &Path, agent_name: &str) -> Option<Self> {
        let agent_dir = logs_root.join(agent_name);
        let mut stamps: Vec<PathBuf> = std::fs::read_dir(&agent_dir)
            .ok()?
            .flatten()
            .map(|e| e.path())
            .filter(|p| p.is_dir())
            .collect();
        stamps.sort();
        stamps.pop().map(|root| Self { root })
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    pub fn session_log(&self) -> PathBuf {
        self.root.join("session.log")
    }

    /// Append a line to `session.log`.
    pub fn append_session(&self, line: &str) -> std::io::Result<()> {
        self.append(&self.session_log(), line)
    }

    /// Append a JSON record to `events.ndjson`.
    pub fn append_event(&self, record: &serde_json::Value) -> std::io::Result<()> {
        self.append(&self.root.join("events.ndjson"), &record.to_string())
    }

    /// Append a JSON record to `tools.ndjson`.
    pub fn append_tool(&self, record: &serde_json::Value) -> std::io::Result<()> {
        self.append(&self.root.join("tools.ndjson"), &record.to_string())
    }

    /// Append a line to `errors.log`.
    pub fn append_error(&self, line: &str) -> std::io::Result<()> {
        self.append(&self.root.join("errors.log"), line)
    }

    /// Read the last `n` lines of `session.log`, if present.
    pub fn session_tail(&self, n: usize) -> Option<String> {
        let content = std::fs::read_to_string(self.session_log()).ok()?;
        let lines: Vec<&str> = content.lines().collect();
        let start = lines.len().saturating_sub(n);
        Some(lines[start..].join("\n"))
    }

    fn append(&self, path: &Path, line: &str) -> std::io::Result<()> {
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        writeln!(file, "{}", line)
    }
}
