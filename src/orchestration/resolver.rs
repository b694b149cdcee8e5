//! Tiered merge resolution.
//!
//! Branches come off the FIFO queue and are integrated into the canonical
//! branch through four escalating tiers:
//!
//! 1. clean merge (`--no-edit --no-ff`)
//! 2. auto-resolve: parse conflict markers, keep the incoming agent side
//! 3. AI-resolve: per-file AI proposal, validated against a prose detector
//! 4. reimagine: abort the merge and synthesize both intents from scratch,
//!    committed with both parents recorded
//!
//! Historical conflict patterns can mark tiers as not worth attempting and
//! feed prior resolutions to the AI tier as few-shot context. The final
//! outcome is offered to a best-effort sink; recording never blocks a merge.

use std::sync::{Arc, OnceLock};

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::ai::AiRunner;
use crate::git::GitDriver;
use crate::mail::{MailClient, SendOptions};
use crate::sink::BestEffortSink;
use crate::store::{
    EventKind, EventLevel, EventStore, MergeEntry, MergeQueue, MergeStatus, MessageType,
    StoredEvent,
};
use crate::{olog, olog_debug, olog_trace, olog_warn, Result};

/// One escalation tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MergeTier {
    CleanMerge,
    AutoResolve,
    AiResolve,
    Reimagine,
}

impl MergeTier {
    pub const ALL: [MergeTier; 4] = [
        MergeTier::CleanMerge,
        MergeTier::AutoResolve,
        MergeTier::AiResolve,
        MergeTier::Reimagine,
    ];

    pub fn number(&self) -> u8 {
        match self {
            MergeTier::CleanMerge => 1,
            MergeTier::AutoResolve => 2,
            MergeTier::AiResolve => 3,
            MergeTier::Reimagine => 4,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MergeTier::CleanMerge => "clean-merge",
            MergeTier::AutoResolve => "auto-resolve",
            MergeTier::AiResolve => "ai-resolve",
            MergeTier::Reimagine => "reimagine",
        }
    }
}

/// A previously successful resolution, fed to the AI tier as context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PastResolution {
    pub file: String,
    pub resolution: String,
}

/// Prior knowledge about a conflict pattern, scoped to a file set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConflictHistory {
    /// Tier numbers that have repeatedly failed for this pattern.
    pub skip_tiers: Vec<u8>,
    pub past_resolutions: Vec<PastResolution>,
    pub predicted_conflict_files: Vec<String>,
}

/// Final outcome, offered to the expertise recorder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeOutcome {
    pub branch_name: String,
    pub files: Vec<String>,
    pub success: bool,
    pub tier: Option<MergeTier>,
    pub conflict_files: Vec<String>,
}

/// Result contract for one queue entry.
#[derive(Debug, Clone)]
pub struct MergeResult {
    pub entry: MergeEntry,
    pub success: bool,
    pub tier: Option<MergeTier>,
    pub conflict_files: Vec<String>,
    pub error_message: Option<String>,
}

/// Prose detector guarding AI output.
///
/// Conservative by default: content is accepted as code unless it reads like
/// a chat reply. Thresholds are fields so deployments can tighten them.
#[derive(Debug, Clone)]
pub struct CodeValidator {
    /// Minimum identifier tokens per non-blank line.
    pub min_ident_tokens_per_line: f64,
    /// Maximum fraction of lines that end like sentences.
    pub max_sentence_line_ratio: f64,
}

impl Default for CodeValidator {
    fn default() -> Self {
        Self {
            min_ident_tokens_per_line: 1.0,
            max_sentence_line_ratio: 0.5,
        }
    }
}

const APOLOGY_PHRASES: &[&str] = &[
    "i'm sorry",
    "i am sorry",
    "i apologize",
    "i cannot",
    "i can't help",
    "as an ai",
    "as a language model",
    "here is the resolved",
    "here's the resolved",
];

impl CodeValidator {
    /// Whether AI output plausibly is a whole source file rather than prose.
    pub fn looks_like_code(&self, content: &str) -> bool {
        let trimmed = content.trim();
        if trimmed.is_empty() {
            return false;
        }

        let lower = trimmed.to_lowercase();
        if APOLOGY_PHRASES.iter().any(|p| lower.contains(p)) {
            return false;
        }

        // Markdown fences mean the tool wrapped the file in a chat reply
        if trimmed.starts_with("```") {
            return false;
        }

        let lines: Vec<&str> = trimmed.lines().filter(|l| !l.trim().is_empty()).collect();
        if lines.is_empty() {
            return false;
        }

        let sentence_lines = lines
            .iter()
            .filter(|l| {
                let t = l.trim_end();
                t.ends_with('.') && !t.ends_with("..") || t.ends_with('?') || t.ends_with('!')
            })
            .count();
        if (sentence_lines as f64 / lines.len() as f64) > self.max_sentence_line_ratio {
            return false;
        }

        static IDENT_RE: OnceLock<Regex> = OnceLock::new();
        let ident = IDENT_RE.get_or_init(|| {
            Regex::new(r"[A-Za-z_][A-Za-z0-9_]*").expect("identifier pattern is valid")
        });
        let ident_count: usize = lines.iter().map(|l| ident.find_iter(l).count()).sum();
        (ident_count as f64 / lines.len() as f64) >= self.min_ident_tokens_per_line
    }
}

/// Resolve standard three-way conflict markers, keeping the incoming
/// (agent) side: the block between `=======` and `>>>>>>>`. Returns `None`
/// when the content has no markers or the markers are malformed.
pub fn resolve_markers_keep_incoming(content: &str) -> Option<String> {
    #[derive(PartialEq)]
    enum State {
        Outside,
        Ours,
        Theirs,
    }

    let mut state = State::Outside;
    let mut out: Vec<&str> = Vec::new();
    let mut blocks = 0usize;

    for line in content.lines() {
        if line.starts_with("<<<<<<<") {
            if state != State::Outside {
                return None;
            }
            state = State::Ours;
        } else if line.starts_with("=======") && state == State::Ours {
            state = State::Theirs;
        } else if line.starts_with(">>>>>>>") {
            if state != State::Theirs {
                return None;
            }
            state = State::Outside;
            blocks += 1;
        } else {
            match state {
                State::Outside | State::Theirs => out.push(line),
                State::Ours => {}
            }
        }
    }

    if state != State::Outside || blocks == 0 {
        return None;
    }

    let mut resolved = out.join("\n");
    if content.ends_with('\n') {
        resolved.push('\n');
    }
    Some(resolved)
}

pub struct MergeResolver {
    git: GitDriver,
    queue: Arc<MergeQueue>,
    events: Arc<EventStore>,
    ai: Option<AiRunner>,
    validator: CodeValidator,
    canonical_branch: String,
    mail: Option<Arc<MailClient>>,
    outcomes: Arc<BestEffortSink<MergeOutcome>>,
}

impl MergeResolver {
    pub fn new(
        git: GitDriver,
        queue: Arc<MergeQueue>,
        events: Arc<EventStore>,
        canonical_branch: impl Into<String>,
    ) -> Self {
        Self {
            git,
            queue,
            events,
            ai: None,
            validator: CodeValidator::default(),
            canonical_branch: canonical_branch.into(),
            mail: None,
            outcomes: Arc::new(BestEffortSink::new(256)),
        }
    }

    /// Enable the AI tiers (3 and 4).
    pub fn with_ai(mut self, runner: AiRunner) -> Self {
        self.ai = Some(runner);
        self
    }

    pub fn with_validator(mut self, validator: CodeValidator) -> Self {
        self.validator = validator;
        self
    }

    /// Notify the owning agent of outcomes over mail.
    pub fn with_mail(mut self, mail: Arc<MailClient>) -> Self {
        self.mail = Some(mail);
        self
    }

    /// Undelivered outcome records (drained by the expertise recorder).
    pub fn outcome_sink(&self) -> Arc<BestEffortSink<MergeOutcome>> {
        Arc::clone(&self.outcomes)
    }

    /// Pop the queue head and resolve it. `None` when the queue is empty.
    pub async fn resolve_next(
        &self,
        history: Option<&ConflictHistory>,
    ) -> Result<Option<MergeResult>> {
        let Some(entry) = self.queue.dequeue()? else {
            return Ok(None);
        };
        let result = self.resolve(entry, history).await?;
        Ok(Some(result))
    }

    /// Run one entry through the tiers. The queue row's status is updated
    /// exactly once, here.
    pub async fn resolve(
        &self,
        entry: MergeEntry,
        history: Option<&ConflictHistory>,
    ) -> Result<MergeResult> {
        olog!(
            "Resolver: integrating '{}' into '{}'",
            entry.branch_name,
            self.canonical_branch
        );

        let checkout = self.git.checkout(&self.canonical_branch).await?;
        if !checkout.success() {
            return Ok(self.finish(
                entry,
                None,
                Vec::new(),
                Some(format!(
                    "cannot checkout canonical branch: {}",
                    checkout.stderr.trim()
                )),
            ));
        }

        let skip = |tier: MergeTier| {
            history
                .map(|h| h.skip_tiers.contains(&tier.number()))
                .unwrap_or(false)
        };

        // Tier 1: clean merge. Even when history says this tier keeps
        // failing, the merge attempt is what materializes the conflicts the
        // later tiers work on; skipping only suppresses taking its result
        // as the outcome is decided by a later tier anyway.
        let merge = self.git.merge(&entry.branch_name, true, true).await?;
        if merge.success() {
            // With tier 1 skipped this means history predicted a conflict
            // that did not happen. Take the win either way.
            return Ok(self.finish(entry, Some(MergeTier::CleanMerge), Vec::new(), None));
        }
        let conflict_files = self.git.conflict_files().await?;
        if conflict_files.is_empty() {
            // Not a conflict: unborn branch, unrelated histories, ...
            let _ = self.git.abort().await;
            return Ok(self.finish(
                entry,
                None,
                Vec::new(),
                Some(format!(
                    "merge failed without conflicts: {}",
                    merge.stderr.trim()
                )),
            ));
        }
        olog_debug!("Resolver: {} conflicted file(s)", conflict_files.len());

        // Tier 2: keep the incoming side
        if !skip(MergeTier::AutoResolve) {
            match self.auto_resolve(&conflict_files).await {
                Ok(true) => {
                    return Ok(self.finish(
                        entry,
                        Some(MergeTier::AutoResolve),
                        conflict_files,
                        None,
                    ));
                }
                Ok(false) => olog_debug!("Resolver: tier 2 aborted (malformed markers)"),
                Err(e) => olog_warn!("Resolver: tier 2 errored: {}", e),
            }
        }

        // Tier 3: AI per-file resolution
        if !skip(MergeTier::AiResolve) && self.ai.is_some() {
            match self.ai_resolve(&entry, &conflict_files, history).await {
                Ok(true) => {
                    return Ok(self.finish(
                        entry,
                        Some(MergeTier::AiResolve),
                        conflict_files,
                        None,
                    ));
                }
                Ok(false) => olog_debug!("Resolver: tier 3 aborted (validation)"),
                Err(e) => olog_warn!("Resolver: tier 3 errored: {}", e),
            }
        }

        // Tier 4: abort and reimagine
        if !skip(MergeTier::Reimagine) && self.ai.is_some() {
            match self.reimagine(&entry).await {
                Ok(true) => {
                    return Ok(self.finish(
                        entry,
                        Some(MergeTier::Reimagine),
                        conflict_files,
                        None,
                    ));
                }
                Ok(false) => olog_debug!("Resolver: tier 4 aborted"),
                Err(e) => olog_warn!("Resolver: tier 4 errored: {}", e),
            }
        }

        // Nothing worked: leave the repo clean and report the conflict
        let _ = self.git.abort().await;
        Ok(self.finish(
            entry,
            None,
            conflict_files,
            Some("all applicable tiers failed".to_string()),
        ))
    }

    /// Tier 2. Parses every conflicted file first; nothing is written unless
    /// all of them carry well-formed markers.
    async fn auto_resolve(&self, conflict_files: &[String]) -> Result<bool> {
        let repo = self.git.repo_path().to_path_buf();
        let mut resolved: Vec<(String, String)> = Vec::with_capacity(conflict_files.len());
        for file in conflict_files {
            let content = std::fs::read_to_string(repo.join(file))?;
            match resolve_markers_keep_incoming(&content) {
                Some(clean) => resolved.push((file.clone(), clean)),
                None => return Ok(false),
            }
        }

        for (file, clean) in &resolved {
            std::fs::write(repo.join(file), clean)?;
        }
        let staged = self.git.add(conflict_files).await?;
        if !staged.success() {
            return Ok(false);
        }
        let commit = self.git.commit_merge().await?;
        Ok(commit.success())
    }

    /// Tier 3. Each conflicted file goes to the AI tool with both branch
    /// versions, the marker text, and any prior resolutions as few-shot
    /// context. Output failing the prose detector aborts the tier.
    async fn ai_resolve(
        &self,
        entry: &MergeEntry,
        conflict_files: &[String],
        history: Option<&ConflictHistory>,
    ) -> Result<bool> {
        let Some(runner) = self.ai.as_ref() else {
            return Ok(false);
        };
        let repo = self.git.repo_path().to_path_buf();

        let mut resolved: Vec<(String, String)> = Vec::with_capacity(conflict_files.len());
        for file in conflict_files {
            let ours = self.git.show("HEAD", file).await?;
            let theirs = self.git.show(&entry.branch_name, file).await?;
            let markers = std::fs::read_to_string(repo.join(file)).unwrap_or_default();

            let mut prompt = format!(
                "Resolve this merge conflict. Output ONLY the complete resolved file, \
                 no commentary, no code fences.\n\nFile: {}\n\n\
                 === CANONICAL ({}) ===\n{}\n\n=== INCOMING ({}) ===\n{}\n\n\
                 === CONFLICT MARKERS ===\n{}\n",
                file,
                self.canonical_branch,
                ours.stdout,
                entry.branch_name,
                theirs.stdout,
                markers
            );
            if let Some(history) = history {
                for past in &history.past_resolutions {
                    prompt.push_str(&format!(
                        "\n=== PRIOR RESOLUTION ({}) ===\n{}\n",
                        past.file, past.resolution
                    ));
                }
            }

            let output = match runner.invoke(&prompt).await {
                Ok(output) => output,
                Err(e) => {
                    olog_warn!("Resolver: AI failed on '{}': {}", file, e);
                    return Ok(false);
                }
            };
            if !self.validator.looks_like_code(&output) {
                olog_warn!("Resolver: AI output for '{}' rejected as prose", file);
                return Ok(false);
            }
            resolved.push((file.clone(), output));
        }

        for (file, content) in &resolved {
            let mut content = content.clone();
            if !content.ends_with('\n') {
                content.push('\n');
            }
            std::fs::write(repo.join(file), content)?;
        }
        let staged = self.git.add(conflict_files).await?;
        if !staged.success() {
            return Ok(false);
        }
        let commit = self.git.commit_merge().await?;
        Ok(commit.success())
    }

    /// Tier 4. Abort the merge, then ask the AI for a re-implementation per
    /// modified path that satisfies both intents, committed as a synthetic
    /// merge with both parents.
    async fn reimagine(&self, entry: &MergeEntry) -> Result<bool> {
        let Some(runner) = self.ai.as_ref() else {
            return Ok(false);
        };
        let _ = self.git.abort().await;

        let canonical_tip = self.git.rev_parse("HEAD").await?;
        let branch_tip = self.git.rev_parse(&entry.branch_name).await?;
        let repo = self.git.repo_path().to_path_buf();

        if entry.files.is_empty() {
            return Ok(false);
        }

        let mut produced: Vec<(String, String)> = Vec::with_capacity(entry.files.len());
        for file in &entry.files {
            let ours = self.git.show("HEAD", file).await?;
            let theirs = self.git.show(&entry.branch_name, file).await?;

            let prompt = format!(
                "Two branches changed the same file with irreconcilable diffs. Write a \
                 fresh implementation satisfying the union of both intents. Output ONLY \
                 the complete file, no commentary, no code fences.\n\nFile: {}\n\n\
                 === VERSION A ({}) ===\n{}\n\n=== VERSION B ({}) ===\n{}\n",
                file,
                self.canonical_branch,
                if ours.success() { ours.stdout } else { String::new() },
                entry.branch_name,
                if theirs.success() { theirs.stdout } else { String::new() },
            );

            let output = match runner.invoke(&prompt).await {
                Ok(output) => output,
                Err(e) => {
                    olog_warn!("Resolver: reimagine failed on '{}': {}", file, e);
                    return Ok(false);
                }
            };
            if !self.validator.looks_like_code(&output) {
                olog_warn!("Resolver: reimagined '{}' rejected as prose", file);
                return Ok(false);
            }
            produced.push((file.clone(), output));
        }

        for (file, content) in &produced {
            let path = repo.join(file);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let mut content = content.clone();
            if !content.ends_with('\n') {
                content.push('\n');
            }
            std::fs::write(path, content)?;
        }
        let staged = self.git.add_all().await?;
        if !staged.success() {
            return Ok(false);
        }
        let commit = self
            .git
            .commit(
                &format!(
                    "Reimagine merge of {} into {}",
                    entry.branch_name, self.canonical_branch
                ),
                Some((&canonical_tip, &branch_tip)),
            )
            .await?;
        Ok(commit.success())
    }

    /// Single exit point: one status update per entry, outcome offered to
    /// the sink, event and mail fired best-effort.
    fn finish(
        &self,
        entry: MergeEntry,
        tier: Option<MergeTier>,
        conflict_files: Vec<String>,
        error_message: Option<String>,
    ) -> MergeResult {
        let success = tier.is_some();
        let status = if success {
            MergeStatus::Merged
        } else if conflict_files.is_empty() {
            MergeStatus::Failed
        } else {
            MergeStatus::Conflict
        };

        if let Err(e) =
            self.queue
                .update_status(&entry.branch_name, status, tier.map(|t| t.number()))
        {
            olog_warn!("Resolver: status update for '{}' failed: {}", entry.branch_name, e);
        }

        self.outcomes.offer(MergeOutcome {
            branch_name: entry.branch_name.clone(),
            files: entry.files.clone(),
            success,
            tier,
            conflict_files: conflict_files.clone(),
        });

        let payload = serde_json::json!({
            "branch": entry.branch_name,
            "success": success,
            "tier": tier.map(|t| t.as_str()),
            "conflict_files": conflict_files,
        });
        let event = StoredEvent::new(&entry.agent_name, EventKind::Custom)
            .with_level(if success { EventLevel::Info } else { EventLevel::Warn })
            .with_payload(payload.to_string());
        if let Err(e) = self.events.insert(&event) {
            olog_trace!("Resolver: event insert swallowed: {}", e);
        }

        if let Some(mail) = &self.mail {
            let msg_type = if success {
                MessageType::Merged
            } else {
                MessageType::MergeFailed
            };
            let subject = format!(
                "{}: {}",
                if success { "merged" } else { "merge failed" },
                entry.branch_name
            );
            if let Err(e) = mail.send(
                "merge-resolver",
                &entry.agent_name,
                &subject,
                "",
                SendOptions {
                    msg_type: Some(msg_type),
                    payload: Some(payload.to_string()),
                    ..Default::default()
                },
            ) {
                olog_trace!("Resolver: mail notify swallowed: {}", e);
            }
        }

        if let Some(tier) = tier {
            olog!(
                "Resolver: '{}' merged via {}",
                entry.branch_name,
                tier.as_str()
            );
        } else {
            olog_warn!(
                "Resolver: '{}' not merged: {}",
                entry.branch_name,
                error_message.as_deref().unwrap_or("conflict unresolved")
            );
        }

        MergeResult {
            entry,
            success,
            tier,
            conflict_files,
            error_message,
        }
    }
}
