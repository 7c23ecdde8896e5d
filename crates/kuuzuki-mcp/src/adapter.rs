// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use kuuzuki_tools::{Tool, ToolContext, ToolResult};

use crate::manager::ServerHandle;
use crate::wire::ToolDef;

/// Registry adapter for one external tool.  Executing it performs a
/// `tools/call` against the owning server; the server's response is the
/// tool output.
pub struct McpTool {
    qualified_name: String,
    def: ToolDef,
    server: Arc<ServerHandle>,
}

impl McpTool {
    pub fn new(qualified_name: String, def: ToolDef, server: Arc<ServerHandle>) -> Self {
        Self {
            qualified_name,
            def,
            server,
        }
    }
}

#[async_trait]
impl Tool for McpTool {
    fn name(&self) -> &str {
        &self.qualified_name
    }

    fn description(&self) -> &str {
        self.def.description.as_deref().unwrap_or("external tool")
    }

    fn parameters_schema(&self) -> Value {
        self.def
            .input_schema
            .clone()
            .unwrap_or_else(|| json!({ "type": "object" }))
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> anyhow::Result<ToolResult> {
        let call = self.server.call(&self.def.name, args);
        let (output, is_error) = tokio::select! {
            _ = ctx.abort.cancelled() => anyhow::bail!("cancelled"),
            result = call => result?,
        };
        if is_error {
            anyhow::bail!("{output}");
        }
        Ok(
            ToolResult::new(format!("{}:{}", self.server.name, self.def.name), output)
                .with_metadata(json!({ "server": self.server.name })),
        )
    }
}
