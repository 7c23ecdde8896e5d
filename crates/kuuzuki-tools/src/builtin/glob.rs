// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;
use walkdir::WalkDir;

use crate::tool::{Tool, ToolContext, ToolResult};

const MAX_RESULTS: usize = 200;

const SKIP_DIRS: &[&str] = &[".git", "target", "node_modules"];

/// Built-in tool for recursive file search by glob pattern.
pub struct GlobTool;

#[async_trait]
impl Tool for GlobTool {
    fn name(&self) -> &str {
        "glob"
    }

    fn description(&self) -> &str {
        "Find files whose project-relative path matches a glob pattern.\n\
         `*` matches within a path segment, `**` matches across segments.\n\
         Excludes .git/, target/ and node_modules/. Max 200 results.\n\
         Examples: *.rs | src/**/*.rs | **/Cargo.toml\n\
         For content search use grep."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "pattern": {
                    "type": "string",
                    "description": "Glob pattern, e.g. '**/*.rs'"
                },
                "path": {
                    "type": "string",
                    "description": "Root directory to search from (default: project root)"
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

        debug!(pattern = %pattern, root = %root.display(), "glob tool");

        // A bare `*.rs` almost always means "anywhere in the tree".
        let pattern = if pattern.contains('/') || pattern.starts_with("**") {
            pattern
        } else {
            format!("**/{pattern}")
        };

        let pattern_for_blocking = pattern.clone();
        let hits = tokio::task::spawn_blocking(move || {
            let pattern = pattern_for_blocking;
            let mut hits = Vec::new();
            let walker = WalkDir::new(&root).into_iter().filter_entry(|e| {
                e.file_name()
                    .to_str()
                    .map(|n| !SKIP_DIRS.contains(&n))
                    .unwrap_or(true)
            });
            for entry in walker.filter_map(Result::ok) {
                if !entry.file_type().is_file() {
                    continue;
                }
                let rel = entry
                    .path()
                    .strip_prefix(&root)
                    .unwrap_or(entry.path())
                    .to_string_lossy()
                    .replace('\\', "/");
                if path_glob_match(&pattern, &rel) {
                    hits.push(rel);
                    if hits.len() >= MAX_RESULTS {
                        break;
                    }
                }
            }
            hits.sort();
            hits
        })
        .await?;

        let output = if hits.is_empty() {
            "no files matched".to_string()
        } else {
            hits.join("\n")
        };
        Ok(ToolResult::new(format!("glob {pattern}"), output)
            .with_metadata(json!({ "matches": hits.len() })))
    }
}

/// Path-aware glob match: `*` and `?` stay within one segment, `**` spans
/// segments.
fn path_glob_match(pattern: &str, path: &str) -> bool {
    fn segments(s: &str) -> Vec<&str> {
        s.split('/').filter(|p| !p.is_empty()).collect()
    }

    fn match_segments(pat: &[&str], path: &[&str]) -> bool {
        match (pat.first(), path.first()) {
            (None, None) => true,
            (Some(&"**"), _) => {
                // `**` consumes zero or more leading path segments.
                if match_segments(&pat[1..], path) {
                    return true;
                }
                !path.is_empty() && match_segments(pat, &path[1..])
            }
            (Some(p), Some(s)) => segment_match(p, s) && match_segments(&pat[1..], &path[1..]),
            _ => false,
        }
    }

    fn segment_match(pattern: &str, value: &str) -> bool {
        let p: Vec<char> = pattern.chars().collect();
        let v: Vec<char> = value.chars().collect();
        seg_match(&p, &v)
    }

    fn seg_match(p: &[char], v: &[char]) -> bool {
        match (p.first(), v.first()) {
            (None, None) => true,
            (Some('*'), _) => seg_match(&p[1..], v) || (!v.is_empty() && seg_match(p, &v[1..])),
            (Some('?'), Some(_)) => seg_match(&p[1..], &v[1..]),
            (Some(a), Some(b)) => a == b && seg_match(&p[1..], &v[1..]),
            _ => false,
        }
    }

    match_segments(&segments(pattern), &segments(path))
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use tokio_util::sync::CancellationToken;

    use super::*;

    fn ctx(root: &std::path::Path) -> ToolContext {
        ToolContext {
            session_id: "session_1".into(),
            message_id: "message_1".into(),
            call_id: "call_1".into(),
            root: root.to_path_buf(),
            abort: CancellationToken::new(),
        }
    }

    // ── Pattern semantics ─────────────────────────────────────────────────────

    #[test]
    fn star_stays_within_a_segment() {
        assert!(path_glob_match("*.rs", "main.rs"));
        assert!(!path_glob_match("*.rs", "src/main.rs"));
    }

    #[test]
    fn double_star_spans_segments() {
        assert!(path_glob_match("**/*.rs", "main.rs"));
        assert!(path_glob_match("**/*.rs", "src/deep/main.rs"));
        assert!(!path_glob_match("**/*.rs", "src/main.rs.bak"));
    }

    #[test]
    fn literal_segments_must_match() {
        assert!(path_glob_match("src/**/*.rs", "src/a/b.rs"));
        assert!(!path_glob_match("src/**/*.rs", "tests/a/b.rs"));
    }

    // ── Tool behavior ─────────────────────────────────────────────────────────

    #[tokio::test]
    async fn finds_files_recursively() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("src/inner")).unwrap();
        std::fs::write(dir.path().join("src/inner/lib.rs"), "").unwrap();
        std::fs::write(dir.path().join("readme.md"), "").unwrap();

        let result = GlobTool
            .execute(json!({"pattern": "*.rs"}), &ctx(dir.path()))
            .await
            .unwrap();
        assert_eq!(result.output, "src/inner/lib.rs");
    }

    #[tokio::test]
    async fn reports_empty_result() {
        let dir = tempfile::tempdir().unwrap();
        let result = GlobTool
            .execute(json!({"pattern": "*.zig"}), &ctx(dir.path()))
            .await
            .unwrap();
        assert_eq!(result.output, "no files matched");
        assert_eq!(result.metadata["matches"], 0);
    }
}
