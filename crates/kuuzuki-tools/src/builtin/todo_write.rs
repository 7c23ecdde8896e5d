// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use crate::tool::{Tool, ToolContext, ToolResult};

/// A structured todo item managed by the todo_write tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TodoItem {
    pub id: String,
    pub content: String,
    /// One of: "pending", "in_progress", "completed", "cancelled"
    pub status: String,
    /// One of: "low", "medium", "high", "critical"
    #[serde(default = "default_priority")]
    pub priority: String,
}

fn default_priority() -> String {
    "medium".into()
}

/// Session-scoped todo lists.  Calling the tool replaces the session's whole
/// list; the summary returned to the model reflects the new state.
#[derive(Default)]
pub struct TodoWriteTool {
    lists: Mutex<HashMap<String, Vec<TodoItem>>>,
}

impl TodoWriteTool {
    pub fn todos(&self, session_id: &str) -> Vec<TodoItem> {
        self.lists
            .lock()
            .expect("todo table poisoned")
            .get(session_id)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl Tool for TodoWriteTool {
    fn name(&self) -> &str {
        "todo_write"
    }

    fn description(&self) -> &str {
        "Create and manage a structured task list for the current session.\n\
         Statuses: pending, in_progress (only ONE at a time), completed, cancelled.\n\
         Priorities: low, medium, high, critical.\n\
         Use for multi-step tasks (3+ steps); skip for trivial ones.\n\
         Calling todo_write replaces the entire list (not a merge).\n\
         Mark items completed immediately after finishing them."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "todos": {
                    "type": "array",
                    "description": "Array of todo items to set (replaces the existing list)",
                    "items": {
                        "type": "object",
                        "properties": {
                            "id": {
                                "type": "string",
                                "description": "Unique identifier for the task"
                            },
                            "content": {
                                "type": "string",
                                "description": "Description of the task"
                            },
                            "status": {
                                "type": "string",
                                "enum": ["pending", "in_progress", "completed", "cancelled"]
                            },
                            "priority": {
                                "type": "string",
                                "enum": ["low", "medium", "high", "critical"]
                            }
                        },
                        "required": ["id", "content", "status"]
                    }
                }
            },
            "required": ["todos"],
            "additionalProperties": false
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> anyhow::Result<ToolResult> {
        let todos: Vec<TodoItem> = serde_json::from_value(
            args.get("todos")
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("missing 'todos'"))?,
        )
        .map_err(|e| anyhow::anyhow!("invalid todos: {e}"))?;

        let in_progress = todos.iter().filter(|t| t.status == "in_progress").count();
        if in_progress > 1 {
            anyhow::bail!("only one todo may be in_progress at a time (got {in_progress})");
        }

        debug!(session = %ctx.session_id, count = todos.len(), "todo_write tool");
        let summary = summarize(&todos);
        self.lists
            .lock()
            .expect("todo table poisoned")
            .insert(ctx.session_id.clone(), todos.clone());

        Ok(ToolResult::new(
            format!("{} todos", todos.len()),
            summary,
        )
        .with_metadata(json!({ "count": todos.len() })))
    }
}

fn summarize(todos: &[TodoItem]) -> String {
    if todos.is_empty() {
        return "todo list cleared".into();
    }
    todos
        .iter()
        .map(|t| format!("[{}] {} ({})", t.status, t.content, t.priority))
        .collect::<Vec<_>>()
        .join("\n")
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
