//! Process-tree discovery and termination.
//!
//! Killing a pane must take the whole subtree with it: agent CLIs fork
//! compilers, test runners and language servers that would otherwise become
//! orphans. Discovery walks `/proc/<pid>/task/<pid>/children` (with a /proc
//! scan fallback for old kernels, and `pgrep -P` on macOS); termination is
//! deepest-first SIGTERM, a grace period, then SIGKILL for survivors, with
//! the root signalled last.

use std::time::Duration;

use crate::{olog_debug, olog_trace, olog_warn};

/// Outcome of one tree kill.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct KillReport {
    /// PIDs that exited after SIGTERM.
    pub terminated: Vec<u32>,
    /// PIDs that survived the grace period and got SIGKILL.
    pub killed: Vec<u32>,
}

impl KillReport {
    pub fn total(&self) -> usize {
        self.terminated.len() + self.killed.len()
    }
}

/// Whether a PID currently exists.
pub fn is_pid_alive(pid: u32) -> bool {
    #[cfg(target_os = "linux")]
    {
        std::path::Path::new(&format!("/proc/{}", pid)).exists()
    }
    #[cfg(not(target_os = "linux"))]
    {
        std::process::Command::new("kill")
            .args(["-0", &pid.to_string()])
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }
}

/// All descendants of `pid`, deepest first (children before parents), so a
/// signalling loop over the result never orphans a grandchild mid-walk.
pub fn descendants_deepest_first(pid: u32) -> Vec<u32> {
    let mut ordered = Vec::new();
    collect_descendants(pid, 0, &mut ordered);
    ordered.reverse();
    ordered
}

fn collect_descendants(pid: u32, depth: u32, out: &mut Vec<u32>) {
    // A runaway fork bomb should not stall the watchdog
    if depth > 16 {
        return;
    }
    for child in direct_children(pid) {
        out.push(child);
        collect_descendants(child, depth + 1, out);
    }
}

#[cfg(target_os = "linux")]
fn direct_children(pid: u32) -> Vec<u32> {
    // Kernels since 3.5 expose the child list directly; older ones force a
    // full /proc sweep.
    match std::fs::read_to_string(format!("/proc/{pid}/task/{pid}/children")) {
        Ok(listing) => parse_pid_list(&listing),
        Err(_) => {
            olog_trace!("no children file for pid {}, sweeping /proc", pid);
            children_by_stat_sweep(pid)
        }
    }
}

/// Fallback child discovery: keep every numeric `/proc` entry whose stat
/// line names `pid` as its parent.
#[cfg(target_os = "linux")]
fn children_by_stat_sweep(pid: u32) -> Vec<u32> {
    let Ok(proc_entries) = std::fs::read_dir("/proc") else {
        return Vec::new();
    };
    proc_entries
        .flatten()
        .filter_map(|entry| entry.file_name().to_str()?.parse::<u32>().ok())
        .filter(|candidate| {
            std::fs::read_to_string(format!("/proc/{candidate}/stat"))
                .ok()
                .and_then(|line| stat_ppid(&line))
                == Some(pid)
        })
        .collect()
}

/// Parent pid from a `/proc/<pid>/stat` line.
///
/// The comm field sits in parentheses and may itself contain spaces or
/// parens (`(tmux: server)`), so fields are counted from the *final* `)`:
/// state comes first, then ppid.
#[cfg(target_os = "linux")]
fn stat_ppid(stat_line: &str) -> Option<u32> {
    let after_comm = &stat_line[stat_line.rfind(')')? + 1..];
    after_comm.split_whitespace().nth(1)?.parse().ok()
}

#[cfg(not(target_os = "linux"))]
fn direct_children(pid: u32) -> Vec<u32> {
    // No /proc to walk; `pgrep -P` answers the same question. A non-zero
    // exit just means no children.
    let pgrep = std::process::Command::new("pgrep")
        .args(["-P", &pid.to_string()])
        .output();
    match pgrep {
        Ok(out) if out.status.success() => parse_pid_list(&String::from_utf8_lossy(&out.stdout)),
        _ => Vec::new(),
    }
}

/// Whitespace- or newline-separated pids, anything unparsable dropped.
fn parse_pid_list(raw: &str) -> Vec<u32> {
    raw.split_whitespace()
        .filter_map(|token| token.parse().ok())
        .collect()
}

/// Send a signal via the `kill` command. "No such process" counts as
/// success: the target already exited.
fn signal(pid: u32, sig: &str) -> bool {
    let output = std::process::Command::new("kill")
        .args([sig, &pid.to_string()])
        .output();
    match output {
        Ok(output) if output.status.success() => true,
        Ok(output) => {
            let stderr = String::from_utf8_lossy(&output.stderr);
            stderr.contains("No such process")
        }
        Err(e) => {
            olog_warn!("kill {} {} failed to spawn: {}", sig, pid, e);
            false
        }
    }
}

/// Terminate a process tree rooted at `root_pid`.
///
/// Deepest-first SIGTERM to every descendant then the root, a grace period,
/// then SIGKILL for anything still alive (again root last).
pub async fn kill_tree(root_pid: u32, grace_period: Duration) -> KillReport {
    let mut targets = descendants_deepest_first(root_pid);
    targets.push(root_pid);
    olog_debug!(
        "kill_tree root={} targets={:?} grace={:?}",
        root_pid,
        targets,
        grace_period
    );

    for &pid in &targets {
        signal(pid, "-TERM");
    }

    tokio::time::sleep(grace_period).await;

    let mut report = KillReport::default();
    for &pid in &targets {
        if is_pid_alive(pid) {
            signal(pid, "-KILL");
            report.killed.push(pid);
        } else {
            report.terminated.push(pid);
        }
    }
    report
}
