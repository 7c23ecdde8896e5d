// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::Context;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::wire::{Notification, Request, Response, PROTOCOL_VERSION};

/// Grace period between SIGTERM and SIGKILL on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug)]
struct Stdio2 {
    stdin: ChildStdin,
    lines: Lines<BufReader<ChildStdout>>,
}

/// A spawned child-process server.  stdio is single-writer/single-reader:
/// one request is in flight at a time, serialized behind the io mutex.
#[derive(Debug)]
pub struct LocalServer {
    child: Mutex<Child>,
    io: Mutex<Stdio2>,
    next_id: AtomicU64,
}

impl LocalServer {
    /// Spawn the process and run the `initialize` handshake.  The caller
    /// wraps this in the start timeout.
    pub async fn start(command: &[String], environment: &HashMap<String, String>) -> anyhow::Result<Self> {
        let (program, args) = command
            .split_first()
            .context("tool server command must not be empty")?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .envs(environment)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .with_context(|| format!("spawning tool server {program:?}"))?;
        let stdin = child.stdin.take().context("child stdin unavailable")?;
        let stdout = child.stdout.take().context("child stdout unavailable")?;

        let server = Self {
            child: Mutex::new(child),
            io: Mutex::new(Stdio2 {
                stdin,
                lines: BufReader::new(stdout).lines(),
            }),
            next_id: AtomicU64::new(1),
        };

        server
            .request(
                "initialize",
                json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": {},
                    "clientInfo": { "name": "kuuzuki", "version": env!("CARGO_PKG_VERSION") }
                }),
            )
            .await
            .context("initialize handshake")?;
        server.notify("notifications/initialized").await?;

        Ok(server)
    }

    /// One JSON-RPC roundtrip.  Lines that are not the matching response
    /// (notifications, other servers' logging) are skipped.
    pub async fn request(&self, method: &str, params: Value) -> anyhow::Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let payload = serde_json::to_string(&Request::new(id, method, params))?;

        let mut io = self.io.lock().await;
        io.stdin
            .write_all(payload.as_bytes())
            .await
            .context("writing request")?;
        io.stdin.write_all(b"\n").await.context("writing request")?;
        io.stdin.flush().await.context("flushing request")?;

        loop {
            let line = io
                .lines
                .next_line()
                .await
                .context("reading response")?
                .context("tool server closed its stdout")?;
            if line.trim().is_empty() {
                continue;
            }
            let response: Response = match serde_json::from_str(&line) {
                Ok(r) => r,
                Err(e) => {
                    warn!(error = %e, "skipping unparseable line from tool server");
                    continue;
                }
            };
            match response.id {
                Some(rid) if rid == id => {
                    if let Some(err) = response.error {
                        anyhow::bail!("tool server error {}: {}", err.code, err.message);
                    }
                    return Ok(response.result.unwrap_or(Value::Null));
                }
                // Server-initiated notification or stale response.
                _ => debug!(method, "skipping non-matching message from tool server"),
            }
        }
    }

    async fn notify(&self, method: &str) -> anyhow::Result<()> {
        let payload = serde_json::to_string(&Notification::new(method))?;
        let mut io = self.io.lock().await;
        io.stdin.write_all(payload.as_bytes()).await?;
        io.stdin.write_all(b"\n").await?;
        io.stdin.flush().await?;
        Ok(())
    }

    /// SIGTERM, grace period, SIGKILL.
    pub async fn shutdown(&self) {
        let mut child = self.child.lock().await;
        #[cfg(unix)]
        if let Some(pid) = child.id() {
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
        }
        match tokio::time::timeout(SHUTDOWN_GRACE, child.wait()).await {
            Ok(Ok(status)) => debug!(?status, "tool server exited"),
            _ => {
                warn!("tool server ignored SIGTERM, killing");
                let _ = child.start_kill();
                let _ = child.wait().await;
            }
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    /// A minimal shell-script MCP server: answers initialize and tools/list,
    /// then echoes tool calls.  Exercises the full stdio framing without any
    /// external binary.
    fn script_server() -> Vec<String> {
        let script = r#"
while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9]*\).*/\1/p')
  case "$line" in
    *'"initialize"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"protocolVersion":"2025-03-26"}}\n' "$id" ;;
    *'"tools/list"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"tools":[{"name":"echo","description":"echoes","inputSchema":{"type":"object"}}]}}\n' "$id" ;;
    *'"tools/call"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"content":[{"type":"text","text":"pong"}]}}\n' "$id" ;;
  esac
done
"#;
        vec!["bash".into(), "-c".into(), script.into()]
    }

    #[tokio::test]
    async fn handshake_list_and_call_roundtrip() {
        let server = LocalServer::start(&script_server(), &HashMap::new())
            .await
            .unwrap();

        let list = server.request("tools/list", Value::Null).await.unwrap();
        assert_eq!(list["tools"][0]["name"], "echo");

        let result = server
            .request("tools/call", json!({"name": "echo", "arguments": {}}))
            .await
            .unwrap();
        let (text, is_error) = crate::wire::call_result_text(&result);
        assert_eq!(text, "pong");
        assert!(!is_error);

        server.shutdown().await;
    }

    #[tokio::test]
    async fn empty_command_is_rejected() {
        let err = LocalServer::start(&[], &HashMap::new()).await.unwrap_err();
        assert!(err.to_string().contains("must not be empty"));
    }

    #[tokio::test]
    async fn server_closing_stdout_is_an_error() {
        let command = vec!["bash".into(), "-c".into(), "exit 0".into()];
        // Spawn succeeds; the handshake then fails on the closed pipe.
        let err = LocalServer::start(&command, &HashMap::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("initialize"));
    }
}
