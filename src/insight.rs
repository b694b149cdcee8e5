//! Insight analysis over recorded events.
//!
//! Pure function: events and tool stats in, a compact workflow profile out.
//! The insight analyzer feeds post-run summaries and agent identity updates;
//! it performs no I/O of its own.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::store::{EventKind, EventLevel, StoredEvent, ToolStat};

/// Minimum tool calls before a workflow classification is attempted.
const MIN_CALLS_FOR_CLASSIFICATION: usize = 10;
/// Edits before a file counts as hot.
const HOT_FILE_EDITS: usize = 3;
const TOP_TOOLS: usize = 5;
const TOP_FILES: usize = 3;

/// Fixed path-prefix to domain-tag mapping.
const DOMAIN_PREFIXES: &[(&str, &str)] = &[
    ("src/", "core-code"),
    ("lib/", "core-code"),
    ("tests/", "testing"),
    ("test/", "testing"),
    ("docs/", "documentation"),
    ("doc/", "documentation"),
    ("migrations/", "database"),
    ("config/", "configuration"),
    ("scripts/", "tooling"),
    (".github/", "ci"),
    ("ci/", "ci"),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WorkflowKind {
    ReadHeavy,
    WriteHeavy,
    BashHeavy,
    Balanced,
}

impl WorkflowKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowKind::ReadHeavy => "read-heavy",
            WorkflowKind::WriteHeavy => "write-heavy",
            WorkflowKind::BashHeavy => "bash-heavy",
            WorkflowKind::Balanced => "balanced",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolProfile {
    pub tool_name: String,
    pub count: u64,
    pub mean_duration_ms: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileProfile {
    pub path: String,
    pub edits: usize,
    pub domains: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InsightAnalysis {
    /// Human-readable observations, most significant first.
    pub insights: Vec<String>,
    pub workflow: Option<WorkflowKind>,
    pub tool_profile: Vec<ToolProfile>,
    pub file_profile: Vec<FileProfile>,
    /// Tools that were involved in error events.
    pub error_tools: Vec<String>,
    pub error_count: usize,
}

/// Analyze one agent's recorded events and tool statistics.
pub fn analyze(events: &[StoredEvent], tool_stats: &[ToolStat]) -> InsightAnalysis {
    let tool_calls: Vec<&StoredEvent> = events
        .iter()
        .filter(|e| e.kind == EventKind::ToolStart)
        .collect();

    let workflow = classify_workflow(&tool_calls);
    let tool_profile = top_tools(tool_stats);
    let file_profile = hot_files(&tool_calls);
    let (error_count, error_tools) = summarize_errors(events);

    let mut insights = Vec::new();
    if let Some(kind) = workflow {
        insights.push(format!(
            "workflow is {} across {} tool calls",
            kind.as_str(),
            tool_calls.len()
        ));
    }
    if let Some(top) = tool_profile.first() {
        insights.push(format!(
            "most-used tool: {} ({} calls)",
            top.tool_name, top.count
        ));
    }
    for file in &file_profile {
        insights.push(format!("hot file: {} ({} edits)", file.path, file.edits));
    }
    if error_count > 0 {
        insights.push(format!(
            "{} error(s) involving: {}",
            error_count,
            if error_tools.is_empty() {
                "no tool".to_string()
            } else {
                error_tools.join(", ")
            }
        ));
    }

    InsightAnalysis {
        insights,
        workflow,
        tool_profile,
        file_profile,
        error_tools,
        error_count,
    }
}

/// Label the dominant style of work, requiring a minimum sample.
fn classify_workflow(tool_calls: &[&StoredEvent]) -> Option<WorkflowKind> {
    if tool_calls.len() < MIN_CALLS_FOR_CLASSIFICATION {
        return None;
    }

    let mut reads = 0usize;
    let mut writes = 0usize;
    let mut bash = 0usize;
    for event in tool_calls {
        match event.tool_name.as_deref() {
            Some("Read") | Some("Grep") | Some("Glob") => reads += 1,
            Some("Write") | Some("Edit") => writes += 1,
            Some("Bash") => bash += 1,
            _ => {}
        }
    }

    let total = tool_calls.len();
    let dominant = |n: usize| n * 2 > total;
    if dominant(reads) {
        Some(WorkflowKind::ReadHeavy)
    } else if dominant(writes) {
        Some(WorkflowKind::WriteHeavy)
    } else if dominant(bash) {
        Some(WorkflowKind::BashHeavy)
    } else {
        Some(WorkflowKind::Balanced)
    }
}

fn top_tools(tool_stats: &[ToolStat]) -> Vec<ToolProfile> {
    let mut sorted: Vec<&ToolStat> = tool_stats.iter().collect();
    sorted.sort_by(|a, b| b.count.cmp(&a.count).then(a.tool_name.cmp(&b.tool_name)));
    sorted
        .into_iter()
        .take(TOP_TOOLS)
        .map(|stat| ToolProfile {
            tool_name: stat.tool_name.clone(),
            count: stat.count,
            mean_duration_ms: stat.avg_duration_ms,
        })
        .collect()
}

/// Files edited at least [`HOT_FILE_EDITS`] times, capped at the top few.
fn hot_files(tool_calls: &[&StoredEvent]) -> Vec<FileProfile> {
    let mut edits: BTreeMap<String, usize> = BTreeMap::new();
    for event in tool_calls {
        if !matches!(event.tool_name.as_deref(), Some("Write") | Some("Edit")) {
            continue;
        }
        if let Some(path) = extract_file_path(event) {
            *edits.entry(path).or_insert(0) += 1;
        }
    }

    let mut hot: Vec<(String, usize)> = edits
        .into_iter()
        .filter(|(_, n)| *n >= HOT_FILE_EDITS)
        .collect();
    hot.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    hot.into_iter()
        .take(TOP_FILES)
        .map(|(path, edits)| {
            let domains = domain_tags(&path);
            FileProfile {
                path,
                edits,
                domains,
            }
        })
        .collect()
}

fn extract_file_path(event: &StoredEvent) -> Option<String> {
    let args = event.tool_args.as_deref()?;
    let parsed: serde_json::Value = serde_json::from_str(args).ok()?;
    let path = parsed["args"]["file_path"].as_str()?;
    if path.is_empty() {
        None
    } else {
        Some(path.to_string())
    }
}

/// Domain tags for a path by the fixed prefix table.
pub fn domain_tags(path: &str) -> Vec<String> {
    let normalized = path.trim_start_matches('/');
    let mut tags: BTreeSet<String> = BTreeSet::new();
    for (prefix, tag) in DOMAIN_PREFIXES {
        // Match both "src/..." and "<repo>/src/..."
        if normalized.starts_with(prefix) || normalized.contains(&format!("/{}", prefix)) {
            tags.insert(tag.to_string());
        }
    }
    tags.into_iter().collect()
}

fn summarize_errors(events: &[StoredEvent]) -> (usize, Vec<String>) {
    let mut tools: BTreeSet<String> = BTreeSet::new();
    let mut count = 0usize;
    for event in events {
        if event.level == EventLevel::Error || event.kind == EventKind::Error {
            count += 1;
            if let Some(tool) = &event.tool_name {
                tools.insert(tool.clone());
            }
        }
    }
    (count, tools.into_iter().collect())
}
