//! Session lifecycle properties against the on-disk store, plus manifest
//! persistence in the agent directory.

use chrono::Utc;

use overstory::manifest::{Checkpoint, Identity};
use overstory::session::{AgentSession, Capability, Run, SessionState};

use crate::fixtures::StateHarness;

fn builder(name: &str) -> AgentSession {
    AgentSession::new(
        name,
        Capability::Builder,
        "/tmp/wt",
        format!("overstory/{}/task-abc", name),
        "task-abc",
        format!("overstory_{}", name),
    )
}

#[test]
fn escalation_is_monotone_until_terminal_reset() {
    let h = StateHarness::new();
    h.sessions.upsert(&builder("b")).unwrap();
    h.sessions.update_state("b", SessionState::Working).unwrap();

    for level in 1..=3u8 {
        h.sessions
            .update_escalation("b", level, Some(Utc::now()))
            .unwrap();
    }
    assert!(h.sessions.update_escalation("b", 2, None).is_err());

    // Terminal transition resets the counter
    h.sessions.update_state("b", SessionState::Zombie).unwrap();
    let s = h.sessions.get_by_name("b").unwrap().unwrap();
    assert_eq!(s.escalation_level, 0);
    assert_eq!(s.state, SessionState::Zombie);
}

#[test]
fn stalled_coherence_on_disk() {
    let h = StateHarness::new();
    h.sessions.upsert(&builder("b")).unwrap();
    h.sessions.update_state("b", SessionState::Working).unwrap();
    h.sessions.update_state("b", SessionState::Stalled).unwrap();

    let stalled = h.sessions.get_by_name("b").unwrap().unwrap();
    assert!(stalled.stalled_since.is_some());

    h.sessions.update_state("b", SessionState::Working).unwrap();
    let recovered = h.sessions.get_by_name("b").unwrap().unwrap();
    assert!(recovered.stalled_since.is_none());
}

#[test]
fn run_groups_sessions_by_identity_field() {
    let h = StateHarness::new();
    let run = Run::new("build the feature");
    h.sessions.create_run(&run).unwrap();

    for name in ["b1", "b2"] {
        h.sessions.upsert(&builder(name).with_run(&run.run_id)).unwrap();
        h.sessions.increment_agent_count(&run.run_id).unwrap();
    }
    h.sessions.upsert(&builder("loner")).unwrap();

    let members = h.sessions.get_by_run(&run.run_id).unwrap();
    assert_eq!(members.len(), 2);
    assert_eq!(h.sessions.get_run(&run.run_id).unwrap().unwrap().agent_count, 2);
}

#[test]
fn killed_session_row_remains_visible() {
    let h = StateHarness::new();
    h.sessions.upsert(&builder("b")).unwrap();
    h.sessions.update_state("b", SessionState::Working).unwrap();
    h.sessions.update_state("b", SessionState::Zombie).unwrap();

    // Observers still see the terminal state; it is excluded from the
    // active sweep but never silently deleted.
    assert!(h.sessions.get_by_name("b").unwrap().is_some());
    assert!(h.sessions.get_active().unwrap().is_empty());

    // Explicit purge is what removes it
    assert_eq!(h.sessions.purge_by_state(SessionState::Zombie).unwrap(), 1);
    assert!(h.sessions.get_by_name("b").unwrap().is_none());
}

#[test]
fn checkpoint_and_identity_live_in_agent_dir() {
    let h = StateHarness::new();
    let checkpoint_path = h.state_dir.checkpoint_path("builder-1");
    let identity_path = h.state_dir.identity_path("builder-1");

    let checkpoint = Checkpoint {
        agent_name: "builder-1".into(),
        bead_id: "task-abc".into(),
        session_id: "sess-1".into(),
        progress_summary: "halfway".into(),
        files_modified: vec!["src/a.rs".into()],
        current_branch: "overstory/builder-1/task-abc".into(),
        pending_work: "tests".into(),
    };
    checkpoint.save(&checkpoint_path).unwrap();

    let mut identity = Identity::load_or_new(&identity_path, "builder-1", Capability::Builder).unwrap();
    identity.record_task("task-abc", "built the parser", &["core-code".into()]);
    identity.save(&identity_path).unwrap();

    // Idempotent checkpoint round-trip (save -> load -> save, byte equal)
    let bytes_before = std::fs::read(&checkpoint_path).unwrap();
    Checkpoint::load(&checkpoint_path).unwrap().save(&checkpoint_path).unwrap();
    assert_eq!(bytes_before, std::fs::read(&checkpoint_path).unwrap());

    let reloaded = Identity::load_or_new(&identity_path, "builder-1", Capability::Builder).unwrap();
    assert_eq!(reloaded.sessions_completed, 1);
    assert_eq!(reloaded.recent_tasks[0].task_id, "task-abc");
}
