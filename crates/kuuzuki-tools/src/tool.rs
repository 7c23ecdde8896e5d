// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

/// Per-invocation context handed to a tool.  `abort` is the session's
/// cancellation token; long-running tools must select on it.
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub session_id: String,
    pub message_id: String,
    pub call_id: String,
    /// Project root; relative tool paths resolve against it.
    pub root: PathBuf,
    pub abort: CancellationToken,
}

impl ToolContext {
    /// Resolve a user-supplied path against the project root.
    pub fn resolve_path(&self, path: &str) -> PathBuf {
        let p = PathBuf::from(path);
        if p.is_absolute() {
            p
        } else {
            self.root.join(p)
        }
    }
}

/// What a tool invocation needs approved before it may run.
#[derive(Debug, Clone)]
pub struct PermissionSpec {
    /// Tool-computed pattern, e.g. the substituted shell command.
    pub pattern: Option<String>,
    pub title: String,
    /// Tool-specific context for the approval prompt.
    pub metadata: Value,
}

/// Successful tool output.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolResult {
    pub title: String,
    pub output: String,
    pub metadata: Value,
}

impl ToolResult {
    pub fn new(title: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            output: output.into(),
            metadata: Value::Object(Default::default()),
        }
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Trait every built-in, external and plugin-contributed tool implements.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON Schema for the arguments object.
    fn parameters_schema(&self) -> Value;

    /// Approval requirement for this invocation; `None` means the tool runs
    /// without consulting the permission gate.
    fn permission(&self, _args: &Value) -> Option<PermissionSpec> {
        None
    }

    /// Per-call execution deadline; `None` means no tool-level timeout.
    fn timeout(&self) -> Option<Duration> {
        None
    }

    /// Execute the tool.  An `Err` becomes an error part; the turn continues.
    async fn execute(&self, args: Value, ctx: &ToolContext) -> anyhow::Result<ToolResult>;
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
