//! End-to-end merge pipeline scenarios: queue in, resolver through the
//! tiers, status out.

use std::sync::Arc;

use overstory::ai::AiRunner;
use overstory::git::GitDriver;
use overstory::orchestration::{ConflictHistory, MergeResolver, MergeTier};
use overstory::store::{MergeEntry, MergeStatus};

use crate::fixtures::{fake_ai_tool, StateHarness, TestRepo};

fn resolver(repo: &TestRepo, h: &StateHarness) -> MergeResolver {
    MergeResolver::new(
        GitDriver::new(&repo.path),
        Arc::clone(&h.queue),
        Arc::clone(&h.events),
        "main",
    )
}

fn entry(branch: &str, files: &[&str]) -> MergeEntry {
    MergeEntry::new(
        branch,
        "task-abc",
        "builder-1",
        files.iter().map(|s| s.to_string()).collect(),
    )
}

#[tokio::test]
async fn happy_path_clean_merge() {
    let repo = TestRepo::new();
    repo.checkout_new("overstory/builder-1/task-abc");
    repo.create_and_commit("a.ts", "export const a = 1;\n", "add a.ts");
    repo.checkout("main");

    let h = StateHarness::new();
    h.queue
        .enqueue(&entry("overstory/builder-1/task-abc", &["a.ts"]))
        .unwrap();

    let resolver = resolver(&repo, &h);
    let result = resolver.resolve_next(None).await.unwrap().unwrap();

    assert!(result.success);
    assert_eq!(result.tier, Some(MergeTier::CleanMerge));
    assert!(result.conflict_files.is_empty());

    let row = h.queue.get("overstory/builder-1/task-abc").unwrap().unwrap();
    assert_eq!(row.status, MergeStatus::Merged);
    assert_eq!(row.resolved_tier, Some(1));

    // The work landed on main
    assert_eq!(repo.file_content("a.ts"), "export const a = 1;\n");
}

#[tokio::test]
async fn auto_resolve_keeps_incoming_side() {
    let repo = TestRepo::new();
    repo.diverge("overstory/builder-1/task-abc", "a.ts", "X\n", "Y\n");

    let h = StateHarness::new();
    h.queue
        .enqueue(&entry("overstory/builder-1/task-abc", &["a.ts"]))
        .unwrap();

    let resolver = resolver(&repo, &h);
    let result = resolver.resolve_next(None).await.unwrap().unwrap();

    assert!(result.success);
    assert_eq!(result.tier, Some(MergeTier::AutoResolve));
    assert_eq!(result.conflict_files, vec!["a.ts"]);

    // The agent's side won
    assert_eq!(repo.file_content("a.ts"), "Y\n");
    let row = h.queue.get("overstory/builder-1/task-abc").unwrap().unwrap();
    assert_eq!(row.status, MergeStatus::Merged);
    assert_eq!(row.resolved_tier, Some(2));
}

#[tokio::test]
async fn ai_resolve_used_when_auto_is_skipped() {
    let repo = TestRepo::new();
    repo.diverge("overstory/builder-1/task-abc", "a.ts", "X\n", "Y\n");

    let h = StateHarness::new();
    h.queue
        .enqueue(&entry("overstory/builder-1/task-abc", &["a.ts"]))
        .unwrap();

    let ai_script = fake_ai_tool(h.temp_dir.path(), "const merged = true;");
    let resolver = resolver(&repo, &h).with_ai(
        AiRunner::from_command(&ai_script.display().to_string()).unwrap(),
    );

    // History says tier 2 keeps failing for this pattern
    let history = ConflictHistory {
        skip_tiers: vec![2],
        ..Default::default()
    };
    let result = resolver.resolve_next(Some(&history)).await.unwrap().unwrap();

    assert!(result.success, "error: {:?}", result.error_message);
    assert_eq!(result.tier, Some(MergeTier::AiResolve));
    assert_eq!(repo.file_content("a.ts"), "const merged = true;\n");

    let row = h.queue.get("overstory/builder-1/task-abc").unwrap().unwrap();
    assert_eq!(row.resolved_tier, Some(3));
}

#[tokio::test]
async fn prose_output_falls_through_to_reimagine() {
    let repo = TestRepo::new();
    repo.diverge("overstory/builder-1/task-abc", "a.ts", "X\n", "Y\n");

    let h = StateHarness::new();
    h.queue
        .enqueue(&entry("overstory/builder-1/task-abc", &["a.ts"]))
        .unwrap();

    // The tool always apologizes: tier 3 and tier 4 must both reject it
    let ai_script = fake_ai_tool(h.temp_dir.path(), "I'm sorry, I cannot resolve this.");
    let resolver = resolver(&repo, &h).with_ai(
        AiRunner::from_command(&ai_script.display().to_string()).unwrap(),
    );

    let history = ConflictHistory {
        skip_tiers: vec![2],
        ..Default::default()
    };
    let result = resolver.resolve_next(Some(&history)).await.unwrap().unwrap();

    assert!(!result.success);
    assert!(result.tier.is_none());
    let row = h.queue.get("overstory/builder-1/task-abc").unwrap().unwrap();
    assert_eq!(row.status, MergeStatus::Conflict);

    // The repo is left clean for the next entry
    let git = GitDriver::new(&repo.path);
    assert!(git.conflict_files().await.unwrap().is_empty());
    assert_eq!(repo.file_content("a.ts"), "X\n");
}

#[tokio::test]
async fn reimagine_commits_with_both_parents() {
    let repo = TestRepo::new();
    repo.diverge("overstory/builder-1/task-abc", "a.ts", "X\n", "Y\n");

    let h = StateHarness::new();
    h.queue
        .enqueue(&entry("overstory/builder-1/task-abc", &["a.ts"]))
        .unwrap();

    let ai_script = fake_ai_tool(h.temp_dir.path(), "const reimagined = 'XY';");
    let resolver = resolver(&repo, &h).with_ai(
        AiRunner::from_command(&ai_script.display().to_string()).unwrap(),
    );

    let history = ConflictHistory {
        skip_tiers: vec![2, 3],
        ..Default::default()
    };
    let result = resolver.resolve_next(Some(&history)).await.unwrap().unwrap();

    assert!(result.success, "error: {:?}", result.error_message);
    assert_eq!(result.tier, Some(MergeTier::Reimagine));
    assert_eq!(repo.file_content("a.ts"), "const reimagined = 'XY';\n");

    let git = GitDriver::new(&repo.path);
    assert_eq!(git.parent_count("HEAD").await.unwrap(), 2);
    let row = h.queue.get("overstory/builder-1/task-abc").unwrap().unwrap();
    assert_eq!(row.resolved_tier, Some(4));
}

#[tokio::test]
async fn conflict_without_ai_ends_in_conflict_status() {
    let repo = TestRepo::new();
    repo.diverge("overstory/builder-1/task-abc", "a.ts", "X\n", "Y\n");

    let h = StateHarness::new();
    h.queue
        .enqueue(&entry("overstory/builder-1/task-abc", &["a.ts"]))
        .unwrap();

    // Skip tier 2, and no AI runner configured: nothing applicable remains
    let resolver = resolver(&repo, &h);
    let history = ConflictHistory {
        skip_tiers: vec![2],
        ..Default::default()
    };
    let result = resolver.resolve_next(Some(&history)).await.unwrap().unwrap();

    assert!(!result.success);
    assert_eq!(result.conflict_files, vec!["a.ts"]);
    let row = h.queue.get("overstory/builder-1/task-abc").unwrap().unwrap();
    assert_eq!(row.status, MergeStatus::Conflict);
}

#[tokio::test]
async fn queue_is_fifo_under_resolution() {
    let repo = TestRepo::new();
    for (i, branch) in ["overstory/b/one", "overstory/b/two"].iter().enumerate() {
        repo.checkout_new(branch);
        repo.create_and_commit(&format!("f{}.ts", i), "x\n", "work");
        repo.checkout("main");
    }

    let h = StateHarness::new();
    h.queue.enqueue(&entry("overstory/b/one", &[])).unwrap();
    h.queue.enqueue(&entry("overstory/b/two", &[])).unwrap();

    let resolver = resolver(&repo, &h);
    let first = resolver.resolve_next(None).await.unwrap().unwrap();
    let second = resolver.resolve_next(None).await.unwrap().unwrap();
    assert_eq!(first.entry.branch_name, "overstory/b/one");
    assert_eq!(second.entry.branch_name, "overstory/b/two");
    assert!(resolver.resolve_next(None).await.unwrap().is_none());
}

#[tokio::test]
async fn outcome_sink_collects_results() {
    let repo = TestRepo::new();
    repo.checkout_new("overstory/b/clean");
    repo.create_and_commit("ok.ts", "x\n", "work");
    repo.checkout("main");

    let h = StateHarness::new();
    h.queue.enqueue(&entry("overstory/b/clean", &["ok.ts"])).unwrap();

    let resolver = resolver(&repo, &h);
    let sink = resolver.outcome_sink();
    resolver.resolve_next(None).await.unwrap().unwrap();

    let outcomes = sink.drain();
    assert_eq!(outcomes.len(), 1);
    assert!(outcomes[0].success);
    assert_eq!(outcomes[0].tier, Some(MergeTier::CleanMerge));
}
