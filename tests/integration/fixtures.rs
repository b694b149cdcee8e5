//! Test fixtures: temporary git repositories, on-disk state directories,
//! and a scripted stand-in for the AI tool.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use tempfile::TempDir;

use overstory::config::StateDir;
use overstory::store::{EventStore, MailStore, MergeQueue, SessionStore};

/// A test repository with a temporary directory and initialized git.
pub struct TestRepo {
    pub temp_dir: TempDir,
    pub path: PathBuf,
}

impl TestRepo {
    /// Create a repository on branch `main` with an initial commit.
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let path = temp_dir.path().to_path_buf();

        run_git(&path, &["init", "-b", "main"]);
        run_git(&path, &["config", "user.email", "test@test.com"]);
        run_git(&path, &["config", "user.name", "Test User"]);

        std::fs::write(path.join("README.md"), "# Test Repository\n")
            .expect("Failed to write README");
        run_git(&path, &["add", "."]);
        run_git(&path, &["commit", "-m", "Initial commit"]);

        Self { temp_dir, path }
    }

    /// Write a file and commit it on the current branch.
    pub fn create_and_commit(&self, filename: &str, content: &str, message: &str) {
        let file_path = self.path.join(filename);
        if let Some(parent) = file_path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(&file_path, content).unwrap();
        run_git(&self.path, &["add", filename]);
        run_git(&self.path, &["commit", "-m", message]);
    }

    pub fn checkout(&self, branch: &str) {
        run_git(&self.path, &["checkout", branch]);
    }

    pub fn checkout_new(&self, branch: &str) {
        run_git(&self.path, &["checkout", "-b", branch]);
    }

    pub fn file_content(&self, filename: &str) -> String {
        std::fs::read_to_string(self.path.join(filename)).unwrap()
    }

    /// Set up the standard divergence for conflict tests: `filename` holds
    /// `canonical` on main and `incoming` on `branch`, both committed on top
    /// of a shared base. Leaves the repo on main.
    pub fn diverge(&self, branch: &str, filename: &str, canonical: &str, incoming: &str) {
        self.create_and_commit(filename, "base\n", "base");

        self.checkout_new(branch);
        self.create_and_commit(filename, incoming, "agent change");

        self.checkout("main");
        self.create_and_commit(filename, canonical, "canonical change");
    }
}

impl Default for TestRepo {
    fn default() -> Self {
        Self::new()
    }
}

fn run_git(path: &Path, args: &[&str]) {
    let output = Command::new("git")
        .args(args)
        .current_dir(path)
        .output()
        .unwrap_or_else(|e| panic!("git {:?} failed to spawn: {}", args, e));
    assert!(
        output.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
}

/// On-disk state directory with all four stores open.
pub struct StateHarness {
    pub temp_dir: TempDir,
    pub state_dir: StateDir,
    pub sessions: Arc<SessionStore>,
    pub mail: Arc<MailStore>,
    pub events: Arc<EventStore>,
    pub queue: Arc<MergeQueue>,
}

impl StateHarness {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().unwrap();
        let state_dir = StateDir::for_project(temp_dir.path());
        state_dir.ensure_dirs().unwrap();

        let sessions = Arc::new(
            SessionStore::open(&state_dir.sessions_db(), None)
                .unwrap()
                .store,
        );
        let mail = Arc::new(MailStore::open(&state_dir.mail_db()).unwrap());
        let events = Arc::new(EventStore::open(&state_dir.events_db()).unwrap());
        let queue = Arc::new(MergeQueue::open(&state_dir.merge_queue_db()).unwrap());

        Self {
            temp_dir,
            state_dir,
            sessions,
            mail,
            events,
            queue,
        }
    }
}

/// Write an executable shell script that ignores its stdin and prints a
/// fixed response, standing in for the AI tool.
pub fn fake_ai_tool(dir: &Path, response: &str) -> PathBuf {
    let script_path = dir.join("fake-ai.sh");
    let script = format!("#!/bin/sh\ncat > /dev/null\ncat <<'OVERSTORY_EOF'\n{}\nOVERSTORY_EOF\n", response);
    std::fs::write(&script_path, script).unwrap();

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = std::fs::metadata(&script_path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&script_path, perms).unwrap();
    }

    script_path
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repo_creation() {
        let repo = TestRepo::new();
        assert!(repo.path.join(".git").exists());
        assert!(repo.path.join("README.md").exists());
    }

    #[test]
    fn test_diverge_sets_up_conflict_shape() {
        let repo = TestRepo::new();
        repo.diverge("agent", "a.ts", "X\n", "Y\n");
        assert_eq!(repo.file_content("a.ts"), "X\n");
        repo.checkout("agent");
        assert_eq!(repo.file_content("a.ts"), "Y\n");
        repo.checkout("main");
    }

    #[test]
    fn test_state_harness_creates_dbs() {
        let h = StateHarness::new();
        assert!(h.state_dir.sessions_db().exists());
        assert!(h.state_dir.mail_db().exists());
        assert!(h.state_dir.events_db().exists());
        assert!(h.state_dir.merge_queue_db().exists());
    }
}
