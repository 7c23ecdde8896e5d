// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use regex::Regex;
use serde_json::{json, Value};
use tracing::debug;
use walkdir::WalkDir;

use crate::tool::{Tool, ToolContext, ToolResult};

/// Maximum matches returned to the model.
const MAX_MATCHES: usize = 100;

/// Files larger than this are skipped; they are almost never source code.
const MAX_FILE_BYTES: u64 = 1_000_000;

/// Directory names never descended into.
const SKIP_DIRS: &[&str] = &[".git", "target", "node_modules"];

pub struct GrepTool;

#[async_trait]
impl Tool for GrepTool {
    fn name(&self) -> &str {
        "grep"
    }

    fn description(&self) -> &str {
        "Search file contents with a regular expression.\n\
         Results are `path:line:content`, capped at 100 matches.\n\
         Skips .git/, target/, node_modules/ and binary files.\n\
         For file-name search use glob."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "pattern": {
                    "type": "string",
                    "description": "Regular expression to search for"
                },
                "path": {
                    "type": "string",
                    "description": "Directory or file to search (default: project root)"
                }
            },
            "required": ["pattern"],
            "additionalProperties": false
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> anyhow::Result<ToolResult> {
        let pattern = args
            .get("pattern")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow::anyhow!("missing 'pattern'"))?
            .to_string();
        let root = args
            .get("path")
            .and_then(Value::as_str)
            .map(|p| ctx.resolve_path(p))
            .unwrap_or_else(|| ctx.root.clone());

        debug!(pattern = %pattern, root = %root.display(), "grep tool");
        let re = Regex::new(&pattern).map_err(|e| anyhow::anyhow!("invalid pattern: {e}"))?;

        let display_root = root.clone();
        let matches = tokio::task::spawn_blocking(move || {
            let mut found = Vec::new();
            let walker = WalkDir::new(&root).into_iter().filter_entry(|e| {
                e.file_name()
                    .to_str()
                    .map(|n| !SKIP_DIRS.contains(&n))
                    .unwrap_or(true)
            });
            'files: for entry in walker.filter_map(Result::ok) {
                if !entry.file_type().is_file() {
                    continue;
                }
                if entry.metadata().map(|m| m.len() > MAX_FILE_BYTES).unwrap_or(true) {
                    continue;
                }
                let Ok(text) = std::fs::read_to_string(entry.path()) else {
                    continue; // binary or unreadable
                };
                for (i, line) in text.lines().enumerate() {
                    if re.is_match(line) {
                        let rel = entry
                            .path()
                            .strip_prefix(&root)
                            .unwrap_or(entry.path())
                            .display();
                        found.push(format!("{rel}:{}:{line}", i + 1));
                        if found.len() >= MAX_MATCHES {
                            break 'files;
                        }
                    }
                }
            }
            found
        })
        .await?;

        let truncated = matches.len() >= MAX_MATCHES;
        let mut output = matches.join("\n");
        if truncated {
            output.push_str("\n[match limit reached; narrow the pattern]");
        }
        if output.is_empty() {
            output = "no matches".into();
        }

        Ok(ToolResult::new(
            format!("grep {pattern} in {}", display_root.display()),
            output,
        )
        .with_metadata(json!({ "matches": matches.len(), "truncated": truncated })))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
