// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use crate::tool::{Tool, ToolContext, ToolResult};

/// Default number of lines returned when the caller does not specify a limit.
/// Kept small to avoid flooding the model context on the first read; the
/// model can paginate with offset + limit.
const DEFAULT_LINE_LIMIT: usize = 200;

/// Hard byte ceiling applied in addition to the line limit.
const MAX_BYTES: usize = 20_000;

pub struct FileReadTool;

#[async_trait]
impl Tool for FileReadTool {
    fn name(&self) -> &str {
        "file_read"
    }

    fn description(&self) -> &str {
        "Read a file. Default: 200 lines / 20 KB — whichever comes first.\n\
         Lines are formatted as L{n}:content (1-indexed).\n\
         When more lines exist, a pagination notice shows the next offset.\n\
         Use grep to find the relevant region first, then read only those\n\
         lines with offset + limit."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Absolute or project-relative path to the file"
                },
                "offset": {
                    "type": "integer",
                    "description": "1-indexed line number to start reading from (default 1)"
                },
                "limit": {
                    "type": "integer",
                    "description": "Maximum number of lines to return (default 200)"
                }
            },
            "required": ["path"],
            "additionalProperties": false
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> anyhow::Result<ToolResult> {
        let path = args
            .get("path")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow::anyhow!("missing 'path'"))?;
        let offset = args.get("offset").and_then(Value::as_u64).unwrap_or(1).max(1) as usize;
        let limit = args
            .get("limit")
            .and_then(Value::as_u64)
            .unwrap_or(DEFAULT_LINE_LIMIT as u64) as usize;

        let resolved = ctx.resolve_path(path);
        debug!(path = %resolved.display(), offset, limit, "file_read tool");

        let text = tokio::fs::read_to_string(&resolved)
            .await
            .map_err(|e| anyhow::anyhow!("cannot read {}: {e}", resolved.display()))?;

        let total_lines = text.lines().count();
        let mut out = String::new();
        let mut emitted = 0usize;
        let mut last_line = 0usize;
        for (i, line) in text.lines().enumerate().skip(offset - 1) {
            if emitted >= limit || out.len() + line.len() > MAX_BYTES {
                break;
            }
            out.push_str(&format!("L{}:{line}\n", i + 1));
            emitted += 1;
            last_line = i + 1;
        }

        if last_line < total_lines {
            out.push_str(&format!(
                "[{} more lines; continue with offset={}]\n",
                total_lines - last_line,
                last_line + 1
            ));
        }

        Ok(ToolResult::new(path, out).with_metadata(json!({
            "lines": total_lines,
            "returned": emitted,
        })))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
