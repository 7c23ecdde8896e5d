// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use crate::tool::{PermissionSpec, Tool, ToolContext, ToolResult};

pub struct FileWriteTool;

#[async_trait]
impl Tool for FileWriteTool {
    fn name(&self) -> &str {
        "file_write"
    }

    fn description(&self) -> &str {
        "Write content to a file, replacing it if it exists.\n\
         Parent directories are created as needed.\n\
         For partial modifications read the file first and write it back whole."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Absolute or project-relative path to write"
                },
                "content": {
                    "type": "string",
                    "description": "Full file content"
                }
            },
            "required": ["path", "content"],
            "additionalProperties": false
        })
    }

    fn permission(&self, args: &Value) -> Option<PermissionSpec> {
        let path = args.get("path").and_then(Value::as_str).unwrap_or("");
        Some(PermissionSpec {
            pattern: Some(path.to_string()),
            title: format!("write {path}"),
            metadata: json!({ "path": path }),
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> anyhow::Result<ToolResult> {
        let path = args
            .get("path")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow::anyhow!("missing 'path'"))?;
        let content = args
            .get("content")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow::anyhow!("missing 'content'"))?;

        let resolved = ctx.resolve_path(path);
        debug!(path = %resolved.display(), bytes = content.len(), "file_write tool");

        if let Some(parent) = resolved.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| anyhow::anyhow!("cannot create {}: {e}", parent.display()))?;
        }
        tokio::fs::write(&resolved, content)
            .await
            .map_err(|e| anyhow::anyhow!("cannot write {}: {e}", resolved.display()))?;

        Ok(
            ToolResult::new(path, format!("wrote {} bytes to {path}", content.len()))
                .with_metadata(json!({ "bytes": content.len() })),
        )
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
