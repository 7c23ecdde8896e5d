// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
pub mod builtin;
mod registry;
mod resolve;
mod tool;
mod validate;

pub use registry::{ToolRegistry, ToolSchema, ToolSource};
pub use resolve::{levenshtein, Resolution, ResolvedVia};
pub use tool::{PermissionSpec, Tool, ToolContext, ToolResult};
pub use validate::{todo_write_remediation, validate_args, Remediation};

pub use builtin::bash::BashTool;
pub use builtin::file_read::FileReadTool;
pub use builtin::file_write::FileWriteTool;
pub use builtin::glob::GlobTool;
pub use builtin::grep::GrepTool;
pub use builtin::todo_write::{TodoItem, TodoWriteTool};

use std::sync::Arc;

/// Registry pre-populated with the built-in tool set and the default
/// remediations.
pub fn builtin_registry() -> Arc<ToolRegistry> {
    let registry = ToolRegistry::new();
    registry.register(Arc::new(BashTool::default()), ToolSource::Builtin);
    registry.register(Arc::new(FileReadTool), ToolSource::Builtin);
    registry.register(Arc::new(FileWriteTool), ToolSource::Builtin);
    registry.register(Arc::new(GrepTool), ToolSource::Builtin);
    registry.register(Arc::new(GlobTool), ToolSource::Builtin);
    registry.register(Arc::new(TodoWriteTool::default()), ToolSource::Builtin);
    Arc::new(registry)
}
