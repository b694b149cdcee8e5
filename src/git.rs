//! Git driver for the merge resolver.
//!
//! Thin subprocess layer over the git CLI. Every call carries a deadline
//! (default 30 s) and returns the raw `{ exit_code, stdout, stderr }`
//! triplet; interpretation belongs to the resolver. The worktree add/remove
//! driver used at spawn time is an external collaborator and not part of
//! this surface.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::process::Command;

use crate::{olog_debug, olog_trace, Error, Result};

/// Raw outcome of one git invocation.
#[derive(Debug, Clone)]
pub struct GitOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl GitOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

#[derive(Debug, Clone)]
pub struct GitDriver {
    repo_path: PathBuf,
    deadline: Duration,
}

impl GitDriver {
    pub fn new(repo_path: impl Into<PathBuf>) -> Self {
        Self {
            repo_path: repo_path.into(),
            deadline: Duration::from_secs(30),
        }
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    async fn git(&self, args: &[&str]) -> Result<GitOutput> {
        olog_trace!("git {:?} in {}", args, self.repo_path.display());
        let output = tokio::time::timeout(
            self.deadline,
            Command::new("git")
                .args(args)
                .current_dir(&self.repo_path)
                .output(),
        )
        .await
        .map_err(|_| Error::Worktree {
            branch: String::new(),
            path: self.repo_path.clone(),
            message: format!("git {:?} timed out after {:?}", args.first(), self.deadline),
        })?
        .map_err(|e| Error::Worktree {
            branch: String::new(),
            path: self.repo_path.clone(),
            message: format!("git spawn failed: {}", e),
        })?;

        Ok(GitOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }

    /// Merge `branch` into the current branch. `--no-edit --no-ff` policy:
    /// the merge commit is always explicit and never opens an editor.
    pub async fn merge(&self, branch: &str, no_edit: bool, no_ff: bool) -> Result<GitOutput> {
        olog_debug!("GitDriver::merge branch={}", branch);
        let mut args = vec!["merge"];
        if no_edit {
            args.push("--no-edit");
        }
        if no_ff {
            args.push("--no-ff");
        }
        args.push(branch);
        self.git(&args).await
    }

    /// File content at a revision: `git show rev:path`.
    pub async fn show(&self, rev: &str, path: &str) -> Result<GitOutput> {
        let spec = format!("{}:{}", rev, path);
        self.git(&["show", &spec]).await
    }

    /// Paths currently in the unmerged (conflicted) state.
    pub async fn conflict_files(&self) -> Result<Vec<String>> {
        let output = self
            .git(&["diff", "--name-only", "--diff-filter=U"])
            .await?;
        if !output.success() {
            return Err(Error::Worktree {
                branch: String::new(),
                path: self.repo_path.clone(),
                message: format!("conflict listing failed: {}", output.stderr.trim()),
            });
        }
        Ok(output
            .stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect())
    }

    /// Abort an in-progress merge. Tolerates there being none.
    pub async fn abort(&self) -> Result<GitOutput> {
        olog_debug!("GitDriver::abort");
        self.git(&["merge", "--abort"]).await
    }

    /// Stage specific paths.
    pub async fn add(&self, paths: &[String]) -> Result<GitOutput> {
        let mut args = vec!["add", "--"];
        args.extend(paths.iter().map(String::as_str));
        self.git(&args).await
    }

    pub async fn add_all(&self) -> Result<GitOutput> {
        self.git(&["add", "-A"]).await
    }

    /// Commit staged changes. With `parents`, a synthetic merge commit is
    /// written via `commit-tree` so both histories are recorded even though
    /// the content was produced outside a live merge.
    pub async fn commit(&self, message: &str, parents: Option<(&str, &str)>) -> Result<GitOutput> {
        match parents {
            None => {
                self.git(&["commit", "--no-verify", "-m", message]).await
            }
            Some((parent_a, parent_b)) => {
                let tree = self.git(&["write-tree"]).await?;
                if !tree.success() {
                    return Ok(tree);
                }
                let tree_id = tree.stdout.trim().to_string();
                let commit = self
                    .git(&[
                        "commit-tree",
                        &tree_id,
                        "-p",
                        parent_a,
                        "-p",
                        parent_b,
                        "-m",
                        message,
                    ])
                    .await?;
                if !commit.success() {
                    return Ok(commit);
                }
                let commit_id = commit.stdout.trim().to_string();
                self.git(&["update-ref", "HEAD", &commit_id]).await
            }
        }
    }

    /// Commit a finished conflict resolution (`git commit --no-edit` keeps
    /// the merge message prepared by git).
    pub async fn commit_merge(&self) -> Result<GitOutput> {
        self.git(&["commit", "--no-edit", "--no-verify"]).await
    }

    pub async fn checkout(&self, branch: &str) -> Result<GitOutput> {
        self.git(&["checkout", branch]).await
    }

    pub async fn current_branch(&self) -> Result<String> {
        let output = self.git(&["branch", "--show-current"]).await?;
        if !output.success() {
            return Err(Error::Worktree {
                branch: String::new(),
                path: self.repo_path.clone(),
                message: format!("cannot resolve current branch: {}", output.stderr.trim()),
            });
        }
        Ok(output.stdout.trim().to_string())
    }

    /// Resolve a revision to its commit id.
    pub async fn rev_parse(&self, rev: &str) -> Result<String> {
        let output = self.git(&["rev-parse", rev]).await?;
        if !output.success() {
            return Err(Error::Worktree {
                branch: rev.to_string(),
                path: self.repo_path.clone(),
                message: format!("rev-parse failed: {}", output.stderr.trim()),
            });
        }
        Ok(output.stdout.trim().to_string())
    }

    /// Parent count of a commit (2 for merge commits).
    pub async fn parent_count(&self, rev: &str) -> Result<usize> {
        let spec = format!("{}^@", rev);
        let output = self.git(&["rev-parse", &spec]).await?;
        Ok(output.stdout.lines().filter(|l| !l.trim().is_empty()).count())
    }
}
