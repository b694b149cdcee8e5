//! Tool-argument filtering for event recording.
//!
//! Raw tool payloads can be huge (file contents, command output). Before an
//! event row is written, callers reduce the payload to a compact
//! `{ args, summary }` form that keeps the identifying fields and drops the
//! bulk. The filter is pure and deterministic; dispatch is a closed match on
//! known tool names, and unknown tools fall through to a key-list summary.

use serde_json::{json, Map, Value};

/// Compact, identifying form of a tool invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct FilteredArgs {
    pub args: Value,
    pub summary: String,
}

impl FilteredArgs {
    /// JSON encoding stored in the event row's `tool_args` column.
    pub fn to_json(&self) -> String {
        json!({ "args": self.args, "summary": self.summary }).to_string()
    }
}

const MAX_FIELD_LEN: usize = 200;

/// Reduce a tool invocation to its identifying fields.
pub fn filter_tool_args(tool_name: &str, raw: &Value) -> FilteredArgs {
    let obj = raw.as_object().cloned().unwrap_or_default();
    match tool_name {
        "Bash" => {
            let command = str_field(&obj, "command");
            FilteredArgs {
                args: json!({ "command": command }),
                summary: format!("$ {}", command),
            }
        }
        "Read" | "Write" | "Edit" => {
            let path = str_field(&obj, "file_path");
            FilteredArgs {
                args: json!({ "file_path": path }),
                summary: format!("{} {}", tool_name.to_lowercase(), path),
            }
        }
        "Grep" | "Glob" => {
            let pattern = str_field(&obj, "pattern");
            let path = str_field(&obj, "path");
            FilteredArgs {
                args: json!({ "pattern": pattern, "path": path }),
                summary: format!("{} '{}' in {}", tool_name.to_lowercase(), pattern, path),
            }
        }
        "WebFetch" | "WebSearch" => {
            let url = if obj.contains_key("url") {
                str_field(&obj, "url")
            } else {
                str_field(&obj, "query")
            };
            FilteredArgs {
                args: json!({ "url": url }),
                summary: format!("fetch {}", url),
            }
        }
        "Task" => {
            let description = str_field(&obj, "description");
            FilteredArgs {
                args: json!({ "description": description }),
                summary: format!("subtask: {}", description),
            }
        }
        _ => {
            let mut keys: Vec<&String> = obj.keys().collect();
            keys.sort();
            let key_list = keys
                .iter()
                .map(|k| k.as_str())
                .collect::<Vec<_>>()
                .join(", ");
            FilteredArgs {
                args: json!({}),
                summary: format!("{}({})", tool_name, key_list),
            }
        }
    }
}

fn str_field(obj: &Map<String, Value>, key: &str) -> String {
    let value = obj.get(key).and_then(Value::as_str).unwrap_or_default();
    truncate(value, MAX_FIELD_LEN)
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max).collect();
        format!("{}...", cut)
    }
}
