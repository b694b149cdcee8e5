//! AI subprocess runner.
//!
//! The resolver's tiers 3/4 and the watchdog's triage both shell out to an
//! external AI tool: prompt in on stdin, proposed content out on stdout.
//! The runner is tool-agnostic (the command comes from config) and every
//! invocation carries a deadline.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::{olog_debug, Error, Result};

/// Default deadline for one AI invocation (per conflicted file).
pub const DEFAULT_AI_TIMEOUT_SECS: u64 = 120;

#[derive(Debug, Clone)]
pub struct AiRunner {
    binary: PathBuf,
    args: Vec<String>,
    timeout: Duration,
}

impl AiRunner {
    /// Build a runner from a configured command line (binary plus fixed
    /// arguments, e.g. `claude -p`).
    pub fn from_command(command: &str) -> Result<Self> {
        let mut parts = command.split_whitespace();
        let binary = parts
            .next()
            .ok_or_else(|| Error::Config("AI command is empty".to_string()))?;
        Ok(Self {
            binary: PathBuf::from(binary),
            args: parts.map(String::from).collect(),
            timeout: Duration::from_secs(DEFAULT_AI_TIMEOUT_SECS),
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Whether the configured binary resolves on PATH.
    pub fn is_available(&self) -> bool {
        which::which(&self.binary).is_ok()
    }

    /// Run the tool with `prompt` on stdin and return trimmed stdout.
    ///
    /// A non-zero exit or an expired deadline is an agent-kind error; the
    /// caller decides whether that aborts a tier or falls back.
    pub async fn invoke(&self, prompt: &str) -> Result<String> {
        olog_debug!(
            "AiRunner::invoke binary={} prompt_len={}",
            self.binary.display(),
            prompt.len()
        );

        let mut child = Command::new(&self.binary)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::agent("ai", format!("failed to spawn AI tool: {}", e)))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(prompt.as_bytes())
                .await
                .map_err(|e| Error::agent("ai", format!("failed to write prompt: {}", e)))?;
            // Close stdin so the tool sees EOF
            drop(stdin);
        }

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| Error::agent("ai", format!("AI tool timed out after {:?}", self.timeout)))?
            .map_err(|e| Error::agent("ai", format!("AI tool failed: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::agent(
                "ai",
                format!(
                    "AI tool exited with {}: {}",
                    output.status.code().unwrap_or(-1),
                    stderr.trim()
                ),
            ));
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_command_splits_args() {
        let runner = AiRunner::from_command("claude -p --output-format text").unwrap();
        assert_eq!(runner.binary, PathBuf::from("claude"));
        assert_eq!(runner.args, vec!["-p", "--output-format", "text"]);
    }

    #[test]
    fn from_empty_command_is_config_error() {
        let err = AiRunner::from_command("  ").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn missing_binary_is_unavailable() {
        let runner = AiRunner::from_command("definitely-not-a-real-binary-xyz").unwrap();
        assert!(!runner.is_available());
    }

    #[tokio::test]
    async fn invoke_pipes_stdin_to_stdout() {
        // `cat` echoes the prompt back: a faithful stand-in for the contract.
        let runner = AiRunner::from_command("cat").unwrap();
        let output = runner.invoke("fn main() {}\n").await.unwrap();
        assert_eq!(output, "fn main() {}");
    }

    #[tokio::test]
    async fn invoke_nonzero_exit_is_error() {
        let runner = AiRunner::from_command("false").unwrap();
        let err = runner.invoke("x").await.unwrap_err();
        assert!(matches!(err, Error::Agent { .. }));
    }

    #[tokio::test]
    async fn invoke_deadline_expires() {
        let runner = AiRunner::from_command("sleep 5")
            .unwrap()
            .with_timeout(Duration::from_millis(50));
        let err = runner.invoke("x").await.unwrap_err();
        assert!(matches!(err, Error::Agent { .. }));
    }

    #[tokio::test]
    async fn invoke_missing_binary_fails_fast() {
        let runner = AiRunner::from_command("definitely-not-a-real-binary-xyz").unwrap();
        assert!(runner.invoke("x").await.is_err());
    }
}
