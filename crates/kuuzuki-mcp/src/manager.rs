// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{info, warn};

use kuuzuki_bus::{Bus, Event};
use kuuzuki_config::McpServerConfig;
use kuuzuki_tools::{ToolRegistry, ToolSource};

use crate::adapter::McpTool;
use crate::local::LocalServer;
use crate::remote::RemoteServer;
use crate::sanitize::{qualified_tool_name, sanitize_name};
use crate::wire::{call_result_text, ToolDef, ToolListResult};

/// Hard deadline for connect + handshake + tool enumeration.
pub const START_TIMEOUT: Duration = Duration::from_secs(10);

enum Transport {
    Local(LocalServer),
    Remote(RemoteServer),
}

/// One running external tool server with its enumerated tool schemas.
pub struct ServerHandle {
    pub name: String,
    transport: Transport,
    pub tools: Vec<ToolDef>,
}

impl ServerHandle {
    /// Invoke `tools/call` and return the text content plus the error flag.
    /// The response payload is surfaced verbatim apart from content
    /// flattening.
    pub async fn call(&self, tool: &str, arguments: Value) -> anyhow::Result<(String, bool)> {
        let params = json!({ "name": tool, "arguments": arguments });
        let result = match &self.transport {
            Transport::Local(s) => s.request("tools/call", params).await?,
            Transport::Remote(s) => s.request("tools/call", params).await?,
        };
        Ok(call_result_text(&result))
    }

    async fn enumerate(transport: &Transport) -> anyhow::Result<Vec<ToolDef>> {
        let result = match transport {
            Transport::Local(s) => s.request("tools/list", Value::Null).await?,
            Transport::Remote(s) => s.request("tools/list", Value::Null).await?,
        };
        let parsed: ToolListResult = serde_json::from_value(result)?;
        Ok(parsed.tools)
    }
}

/// Lifecycle owner for all configured external tool servers.
pub struct McpManager {
    bus: Arc<Bus>,
    servers: Mutex<HashMap<String, Arc<ServerHandle>>>,
}

impl McpManager {
    pub fn new(bus: Arc<Bus>) -> Arc<Self> {
        Arc::new(Self {
            bus,
            servers: Mutex::new(HashMap::new()),
        })
    }

    /// Start every enabled configured server and register its tools.
    /// A server that fails to start is reported and skipped; the rest of
    /// the engine keeps working.
    pub async fn start_all(
        &self,
        configs: &HashMap<String, McpServerConfig>,
        registry: &ToolRegistry,
    ) {
        for (name, config) in configs {
            self.start(name, config, registry).await;
        }
    }

    /// Start one server under the 10-second hard deadline.
    pub async fn start(&self, name: &str, config: &McpServerConfig, registry: &ToolRegistry) {
        if !config.enabled() {
            info!(server = name, "tool server disabled, skipping");
            return;
        }

        let connected = tokio::time::timeout(START_TIMEOUT, async {
            let transport = match config {
                McpServerConfig::Local {
                    command,
                    environment,
                    ..
                } => Transport::Local(LocalServer::start(command, environment).await?),
                McpServerConfig::Remote { url, headers, .. } => {
                    let remote = RemoteServer::new(url.clone(), headers.clone());
                    // Remote servers have no process handshake; the
                    // enumeration below doubles as the connectivity probe.
                    Transport::Remote(remote)
                }
            };
            let tools = ServerHandle::enumerate(&transport).await?;
            anyhow::Ok((transport, tools))
        })
        .await;

        let (transport, tools) = match connected {
            Ok(Ok(pair)) => pair,
            Ok(Err(e)) => {
                warn!(server = name, error = %e, "tool server failed to start");
                self.bus
                    .publish(Event::SessionError {
                        session_id: None,
                        error: format!("tool server `{name}` failed to start: {e}"),
                    })
                    .await;
                return;
            }
            Err(_elapsed) => {
                warn!(server = name, "tool server start timed out");
                self.bus
                    .publish(Event::SessionError {
                        session_id: None,
                        error: format!(
                            "tool server `{name}` did not respond within {}s",
                            START_TIMEOUT.as_secs()
                        ),
                    })
                    .await;
                return;
            }
        };

        info!(server = name, tools = tools.len(), "tool server started");
        let handle = Arc::new(ServerHandle {
            name: name.to_string(),
            transport,
            tools,
        });
        self.register_tools(&handle, registry);
        self.servers
            .lock()
            .await
            .insert(name.to_string(), handle);
    }

    /// Wrap each enumerated tool in a registry adapter under its namespaced
    /// name, plus a bare-name alias for the resolver.
    fn register_tools(&self, handle: &Arc<ServerHandle>, registry: &ToolRegistry) {
        for def in &handle.tools {
            let qualified = qualified_tool_name(&handle.name, &def.name);
            registry.register(
                Arc::new(McpTool::new(qualified.clone(), def.clone(), Arc::clone(handle))),
                ToolSource::External(handle.name.clone()),
            );
            let bare = sanitize_name(&def.name);
            if bare != qualified {
                registry.register_alias(bare, qualified);
            }
        }
    }

    /// Shut down one server and drop its tools from the registry.
    pub async fn shutdown_server(&self, name: &str, registry: &ToolRegistry) {
        let handle = self.servers.lock().await.remove(name);
        if let Some(handle) = handle {
            if let Transport::Local(local) = &handle.transport {
                local.shutdown().await;
            }
            registry.remove_external(name);
            info!(server = name, "tool server stopped");
        }
    }

    /// Shut down every running server.
    pub async fn shutdown_all(&self, registry: &ToolRegistry) {
        let names: Vec<String> = self.servers.lock().await.keys().cloned().collect();
        for name in names {
            self.shutdown_server(&name, registry).await;
        }
    }

    pub async fn server_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.servers.lock().await.keys().cloned().collect();
        names.sort();
        names
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn script_server_config() -> McpServerConfig {
        let script = r#"
while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9]*\).*/\1/p')
  case "$line" in
    *'"initialize"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"protocolVersion":"2025-03-26"}}\n' "$id" ;;
    *'"tools/list"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"tools":[{"name":"kb.read","description":"read kb","inputSchema":{"type":"object"}}]}}\n' "$id" ;;
    *'"tools/call"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"content":[{"type":"text","text":"kb contents"}]}}\n' "$id" ;;
  esac
done
"#;
        McpServerConfig::Local {
            command: vec!["bash".into(), "-c".into(), script.into()],
            environment: HashMap::new(),
            enabled: true,
        }
    }

    #[tokio::test]
    async fn start_registers_namespaced_tools() {
        let bus = Bus::new();
        let manager = McpManager::new(Arc::clone(&bus));
        let registry = ToolRegistry::new();

        manager.start("kb-mcp", &script_server_config(), &registry).await;

        assert!(registry.get("kb_mcp_kb_read").is_some());
        // Bare-name alias resolves to the namespaced tool.
        let r = registry.resolve("session_1", "kb_read");
        assert_eq!(r.tool.name(), "kb_mcp_kb_read");
    }

    #[tokio::test]
    async fn disabled_server_is_skipped() {
        let bus = Bus::new();
        let manager = McpManager::new(Arc::clone(&bus));
        let registry = ToolRegistry::new();

        let config = McpServerConfig::Local {
            command: vec!["bash".into(), "-c".into(), "exit 0".into()],
            environment: HashMap::new(),
            enabled: false,
        };
        manager.start("off", &config, &registry).await;

        assert!(manager.server_names().await.is_empty());
        assert!(registry.names().is_empty());
    }

    #[tokio::test]
    async fn start_failure_publishes_session_error_and_continues() {
        let bus = Bus::new();
        let mut tap = bus.tap();
        let manager = McpManager::new(Arc::clone(&bus));
        let registry = ToolRegistry::new();

        let config = McpServerConfig::Local {
            command: vec!["bash".into(), "-c".into(), "exit 1".into()],
            environment: HashMap::new(),
            enabled: true,
        };
        manager.start("broken", &config, &registry).await;

        let env = tap.recv().await.unwrap();
        match env.event {
            Event::SessionError { error, .. } => {
                assert!(error.contains("broken"));
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert!(registry.names().is_empty());
    }

    #[tokio::test]
    async fn shutdown_then_restart_restores_the_same_registry() {
        let bus = Bus::new();
        let manager = McpManager::new(Arc::clone(&bus));
        let registry = ToolRegistry::new();

        manager.start("kb", &script_server_config(), &registry).await;
        let before = registry.names();

        manager.shutdown_server("kb", &registry).await;
        assert!(registry.names().is_empty());

        manager.start("kb", &script_server_config(), &registry).await;
        assert_eq!(registry.names(), before);
    }

    #[tokio::test]
    async fn call_through_handle_returns_text() {
        let bus = Bus::new();
        let manager = McpManager::new(Arc::clone(&bus));
        let registry = ToolRegistry::new();
        manager.start("kb", &script_server_config(), &registry).await;

        let handle = {
            let servers = manager.servers.lock().await;
            Arc::clone(servers.get("kb").unwrap())
        };
        let (text, is_error) = handle
            .call("kb.read", serde_json::json!({"path": "x"}))
            .await
            .unwrap();
        assert_eq!(text, "kb contents");
        assert!(!is_error);
    }
}
