// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::process::Command;
use tracing::debug;

use crate::tool::{PermissionSpec, Tool, ToolContext, ToolResult};

/// Hard byte ceiling for combined stdout + stderr returned to the model.
const OUTPUT_LIMIT_BYTES: usize = 20_000;

/// Lines kept from the head of oversized output.
const HEAD_LINES: usize = 100;

/// Lines kept from the tail of oversized output.  Errors and summaries
/// almost always appear at the end of build/test output, so preserving the
/// tail is at least as important as preserving the head.
const TAIL_LINES: usize = 100;

/// Built-in shell tool.  The permission pattern is the command string after
/// argument substitution, so policies can target command families (`git *`).
pub struct BashTool {
    pub timeout_secs: u64,
}

impl Default for BashTool {
    fn default() -> Self {
        Self { timeout_secs: 120 }
    }
}

#[async_trait]
impl Tool for BashTool {
    fn name(&self) -> &str {
        "bash"
    }

    fn description(&self) -> &str {
        "Execute a shell command and return stdout + stderr.\n\
         'command' is required and can be any bash one-liner.\n\
         Output is capped at ~20 KB; when larger, the first 100 and last 100\n\
         lines are preserved with an omission marker in the middle.\n\
         Prefer non-interactive commands; avoid commands that require a TTY.\n\
         For file reads use file_read, for content search use grep."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "The bash one-liner to execute."
                },
                "workdir": {
                    "type": "string",
                    "description": "Working directory (optional, defaults to the project root)"
                },
                "timeout_secs": {
                    "type": "integer",
                    "description": "Execution timeout in seconds (optional)"
                }
            },
            "required": ["command"],
            "additionalProperties": false
        })
    }

    fn permission(&self, args: &Value) -> Option<PermissionSpec> {
        let command = args.get("command").and_then(Value::as_str).unwrap_or("");
        Some(PermissionSpec {
            pattern: Some(command.to_string()),
            title: command.to_string(),
            metadata: json!({ "command": command }),
        })
    }

    fn timeout(&self) -> Option<Duration> {
        Some(Duration::from_secs(self.timeout_secs))
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> anyhow::Result<ToolResult> {
        let command = args
            .get("command")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow::anyhow!("missing 'command'"))?
            .to_string();
        let timeout = args
            .get("timeout_secs")
            .and_then(Value::as_u64)
            .unwrap_or(self.timeout_secs);
        let workdir = args
            .get("workdir")
            .and_then(Value::as_str)
            .map(|w| ctx.resolve_path(w))
            .unwrap_or_else(|| ctx.root.clone());

        debug!(cmd = %command, "executing bash tool");

        let mut cmd = Command::new("bash");
        cmd.arg("-c").arg(&command);
        cmd.current_dir(&workdir);
        // Detach from any controlling terminal: stdin on /dev/null defeats
        // isatty(0) probes, and kill_on_drop guarantees the child dies when
        // the timeout or the cancellation token drops this future.
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);
        #[cfg(unix)]
        unsafe {
            cmd.pre_exec(|| {
                libc::setsid();
                Ok(())
            });
        }

        let output = tokio::select! {
            _ = ctx.abort.cancelled() => anyhow::bail!("cancelled"),
            result = tokio::time::timeout(Duration::from_secs(timeout), cmd.output()) => {
                match result {
                    Ok(Ok(output)) => output,
                    Ok(Err(e)) => anyhow::bail!("spawn error: {e}"),
                    Err(_) => anyhow::bail!("timeout after {timeout}s"),
                }
            }
        };

        let mut content = String::new();
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stdout.is_empty() {
            content.push_str(&head_tail_truncate(&stdout));
        }
        if !stderr.is_empty() {
            if !content.is_empty() {
                content.push('\n');
            }
            content.push_str("[stderr]\n");
            content.push_str(&head_tail_truncate(&stderr));
        }

        let code = output.status.code().unwrap_or(-1);
        if content.is_empty() {
            content = format!("[exit {code}]");
        }
        // Exit code 1 is the Unix convention for "no matches" (grep) and
        // "condition false" (test); it is not a tool failure.
        if code > 1 || code < 0 {
            anyhow::bail!("[exit {code}]\n{content}");
        }

        Ok(ToolResult::new(command, content).with_metadata(json!({ "exit": code })))
    }
}

/// Keep the first `HEAD_LINES` and last `TAIL_LINES` of oversized output
/// with an omission marker in between.
fn head_tail_truncate(s: &str) -> String {
    if s.len() <= OUTPUT_LIMIT_BYTES {
        return s.to_string();
    }
    let lines: Vec<&str> = s.lines().collect();
    if lines.len() <= HEAD_LINES + TAIL_LINES {
        // Few but very long lines: fall back to a byte cut at a char boundary.
        let mut cut = OUTPUT_LIMIT_BYTES;
        while !s.is_char_boundary(cut) {
            cut -= 1;
        }
        return format!("{}\n[... output truncated ...]", &s[..cut]);
    }
    let omitted = lines.len() - HEAD_LINES - TAIL_LINES;
    let head = lines[..HEAD_LINES].join("\n");
    let tail = lines[lines.len() - TAIL_LINES..].join("\n");
    format!("{head}\n[... {omitted} lines omitted ...]\n{tail}")
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
