//! Multiplexer driver.
//!
//! The watchdog and launcher speak to panes through [`MuxDriver`]; the
//! concrete multiplexer stays behind it. [`TmuxDriver`] shells out to tmux
//! with a deadline on every command (default 5 s) so a wedged server can
//! never hang the watchdog tick.

use std::collections::HashMap;
use std::path::Path;
use std::process::Output;
use std::time::Duration;

use tokio::process::Command;

use crate::{olog_debug, olog_trace, olog_warn, Error, Result};

/// Pane operations the core needs. Implementations must be deadline-bounded.
pub trait MuxDriver: Send + Sync {
    fn create_pane(
        &self,
        name: &str,
        cwd: &Path,
        command: &[String],
        env: &HashMap<String, String>,
    ) -> impl std::future::Future<Output = Result<()>> + Send;

    fn kill_pane(&self, name: &str) -> impl std::future::Future<Output = Result<()>> + Send;

    fn is_pane_alive(&self, name: &str) -> impl std::future::Future<Output = bool> + Send;

    fn send_keys(&self, name: &str, text: &str)
        -> impl std::future::Future<Output = Result<()>> + Send;

    fn capture(
        &self,
        name: &str,
        lines: Option<u16>,
    ) -> impl std::future::Future<Output = Result<String>> + Send;

    fn list_panes(&self) -> impl std::future::Future<Output = Result<Vec<String>>> + Send;
}

/// tmux-backed driver. One detached session per pane, named with the
/// `overstory_` prefix so stray sessions are identifiable.
#[derive(Debug, Clone)]
pub struct TmuxDriver {
    deadline: Duration,
}

impl Default for TmuxDriver {
    fn default() -> Self {
        Self {
            deadline: Duration::from_secs(5),
        }
    }
}

impl TmuxDriver {
    pub fn new(deadline: Duration) -> Self {
        Self { deadline }
    }

    pub fn is_available() -> bool {
        which::which("tmux").is_ok()
    }

    /// Pane name for an agent: `overstory_<sanitized-agent-name>`.
    pub fn pane_name(agent_name: &str) -> String {
        format!("overstory_{}", sanitize_pane_name(agent_name))
    }

    async fn tmux(&self, pane: &str, args: &[&str]) -> Result<Output> {
        olog_trace!("tmux {:?}", args);
        let output = tokio::time::timeout(self.deadline, Command::new("tmux").args(args).output())
            .await
            .map_err(|_| Error::agent(pane, format!("tmux timed out after {:?}", self.deadline)))?
            .map_err(|e| Error::agent(pane, format!("tmux spawn failed: {}", e)))?;
        Ok(output)
    }
}

impl MuxDriver for TmuxDriver {
    async fn create_pane(
        &self,
        name: &str,
        cwd: &Path,
        command: &[String],
        env: &HashMap<String, String>,
    ) -> Result<()> {
        if command.is_empty() {
            return Err(Error::Validation("pane command cannot be empty".to_string()));
        }

        let cmd_str = command
            .iter()
            .map(|s| shell_escape(s))
            .collect::<Vec<_>>()
            .join(" ");
        olog_debug!(
            "TmuxDriver::create_pane name={} cwd={} cmd={}",
            name,
            cwd.display(),
            cmd_str
        );

        let cwd_str = cwd.display().to_string();
        let mut args: Vec<String> = vec![
            "new-session".into(),
            "-d".into(),
            "-s".into(),
            name.into(),
            "-c".into(),
            cwd_str,
        ];
        // Sorted for a reproducible command line
        let mut env_pairs: Vec<(&String, &String)> = env.iter().collect();
        env_pairs.sort();
        for (key, value) in env_pairs {
            args.push("-e".into());
            args.push(format!("{}={}", key, value));
        }
        args.push(cmd_str);

        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let output = self.tmux(name, &arg_refs).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            olog_warn!("tmux create_pane '{}' failed: {}", name, stderr);
            return Err(Error::agent(
                name,
                format!("failed to create pane: {}", stderr.trim()),
            ));
        }

        // Keep the pane visible after the command exits so the watchdog can
        // still capture the tail.
        let _ = self
            .tmux(name, &["set-option", "-t", name, "remain-on-exit", "on"])
            .await;
        Ok(())
    }

    async fn kill_pane(&self, name: &str) -> Result<()> {
        olog_debug!("TmuxDriver::kill_pane name={}", name);
        let output = self.tmux(name, &["kill-session", "-t", name]).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            // Already gone counts as killed
            if !stderr.contains("session not found") && !stderr.contains("can't find") {
                olog_warn!("tmux kill_pane '{}' failed: {}", name, stderr);
                return Err(Error::agent(
                    name,
                    format!("failed to kill pane: {}", stderr.trim()),
                ));
            }
        }
        Ok(())
    }

    async fn is_pane_alive(&self, name: &str) -> bool {
        self.tmux(name, &["has-session", "-t", name])
            .await
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    async fn send_keys(&self, name: &str, text: &str) -> Result<()> {
        olog_debug!("TmuxDriver::send_keys name={} len={}", name, text.len());
        let output = self
            .tmux(name, &["send-keys", "-t", name, text, "Enter"])
            .await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::agent(
                name,
                format!("failed to send keys: {}", stderr.trim()),
            ));
        }
        Ok(())
    }

    async fn capture(&self, name: &str, lines: Option<u16>) -> Result<String> {
        let output = match lines {
            // -S -N starts N lines back from the end
            Some(n) => {
                let start = format!("-{}", n);
                self.tmux(name, &["capture-pane", "-t", name, "-p", "-S", &start])
                    .await?
            }
            None => self.tmux(name, &["capture-pane", "-t", name, "-p"]).await?,
        };
        if !output.status.success() {
            return Err(Error::agent(
                name,
                format!(
                    "failed to capture pane: {}",
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    async fn list_panes(&self) -> Result<Vec<String>> {
        let output = self
            .tmux("", &["list-sessions", "-F", "#{session_name}"])
            .await?;
        if !output.status.success() {
            // No server running means no panes
            return Ok(Vec::new());
        }
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .filter(|s| s.starts_with("overstory_"))
            .map(String::from)
            .collect())
    }
}

/// Environment injected into every launched pane.
pub fn launcher_env(
    agent_name: &str,
    worktree_path: &Path,
    state_dir: &Path,
) -> HashMap<String, String> {
    let mut env = HashMap::new();
    env.insert("AGENT_NAME".to_string(), agent_name.to_string());
    env.insert(
        "WORKTREE_PATH".to_string(),
        worktree_path.display().to_string(),
    );
    env.insert(
        "OVERSTORY_STATE_DIR".to_string(),
        state_dir.display().to_string(),
    );
    for key in ["API_BASE_URL", "API_AUTH_TOKEN", "DEFAULT_MODEL"] {
        if let Ok(value) = std::env::var(key) {
            env.insert(key.to_string(), value);
        }
    }
    env
}

fn shell_escape(s: &str) -> String {
    if s.chars()
        .all(|c| c.is_alphanumeric() || c == '-' || c == '_' || c == '.' || c == '/')
    {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', "'\"'\"'"))
    }
}

fn sanitize_pane_name(s: &str) -> String {
    s.chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}
