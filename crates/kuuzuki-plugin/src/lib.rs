// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Plugin host.  A plugin implements [`Plugin`] and overrides the hooks it
//! cares about; every hook has a no-op default.  The host dispatches hooks
//! in registration order, sequentially.  A hook error is logged and never
//! propagates into the core flow — with one deliberate nuance for
//! `permission.ask`: whatever decision the hook wrote before failing is
//! still honored.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::warn;

use kuuzuki_bus::{Bus, Envelope};
use kuuzuki_config::PermissionDecision;
use kuuzuki_types::{MessageInfo, Part, PermissionInfo};

/// Sampling parameters a plugin may tune before streaming begins.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChatParams {
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
}

/// Identifies the tool invocation a `tool.execute.*` hook is observing.
#[derive(Debug, Clone)]
pub struct ToolCallRef {
    pub tool: String,
    pub call_id: String,
    pub session_id: String,
}

/// Mutable view of a tool result handed to `tool.execute.after`.
#[derive(Debug, Clone)]
pub struct ToolResultPayload {
    pub title: String,
    pub output: String,
    pub metadata: Value,
}

#[async_trait]
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    /// Fires on every bus event.
    async fn event(&self, _event: &Envelope) -> anyhow::Result<()> {
        Ok(())
    }

    /// After a user message (and its parts) has entered a session.
    async fn chat_message(&self, _message: &MessageInfo, _parts: &[Part]) -> anyhow::Result<()> {
        Ok(())
    }

    /// Before streaming begins; may mutate sampling parameters.
    async fn chat_params(&self, _params: &mut ChatParams) -> anyhow::Result<()> {
        Ok(())
    }

    /// Before the operator is prompted; writing `Allow` or `Deny` into
    /// `decision` short-circuits the prompt.
    async fn permission_ask(
        &self,
        _request: &PermissionInfo,
        _decision: &mut PermissionDecision,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    /// Before a tool executes; may mutate the arguments.
    async fn tool_execute_before(
        &self,
        _call: &ToolCallRef,
        _args: &mut Value,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    /// After a tool executed; may mutate the result.
    async fn tool_execute_after(
        &self,
        _call: &ToolCallRef,
        _result: &mut ToolResultPayload,
    ) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Ordered collection of plugins.  Registration order is trigger order.
#[derive(Default)]
pub struct PluginHost {
    plugins: Vec<Arc<dyn Plugin>>,
}

impl PluginHost {
    pub fn new(plugins: Vec<Arc<dyn Plugin>>) -> Arc<Self> {
        Arc::new(Self { plugins })
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    /// Wire the `event` hook to the bus.  Called once at startup.
    pub fn attach(self: &Arc<Self>, bus: &Bus) {
        let host = Arc::clone(self);
        bus.subscribe(
            "*",
            move |env| -> futures::future::BoxFuture<'static, anyhow::Result<()>> {
                let host = Arc::clone(&host);
                Box::pin(async move {
                    host.event(&env).await;
                    Ok(())
                })
            },
        );
    }

    pub async fn event(&self, env: &Envelope) {
        for plugin in &self.plugins {
            if let Err(e) = plugin.event(env).await {
                warn!(plugin = plugin.name(), error = %e, "event hook failed");
            }
        }
    }

    pub async fn chat_message(&self, message: &MessageInfo, parts: &[Part]) {
        for plugin in &self.plugins {
            if let Err(e) = plugin.chat_message(message, parts).await {
                warn!(plugin = plugin.name(), error = %e, "chat.message hook failed");
            }
        }
    }

    pub async fn chat_params(&self, params: &mut ChatParams) {
        for plugin in &self.plugins {
            if let Err(e) = plugin.chat_params(params).await {
                warn!(plugin = plugin.name(), error = %e, "chat.params hook failed");
            }
        }
    }

    /// Runs the `permission.ask` chain.  The decision object is shared down
    /// the chain; a decision written before a hook error still sticks.
    pub async fn permission_ask(
        &self,
        request: &PermissionInfo,
        decision: &mut PermissionDecision,
    ) {
        for plugin in &self.plugins {
            if let Err(e) = plugin.permission_ask(request, decision).await {
                warn!(plugin = plugin.name(), error = %e, "permission.ask hook failed");
            }
        }
    }

    pub async fn tool_execute_before(&self, call: &ToolCallRef, args: &mut Value) {
        for plugin in &self.plugins {
            if let Err(e) = plugin.tool_execute_before(call, args).await {
                warn!(plugin = plugin.name(), error = %e, "tool.execute.before hook failed");
            }
        }
    }

    pub async fn tool_execute_after(&self, call: &ToolCallRef, result: &mut ToolResultPayload) {
        for plugin in &self.plugins {
            if let Err(e) = plugin.tool_execute_after(call, result).await {
                warn!(plugin = plugin.name(), error = %e, "tool.execute.after hook failed");
            }
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
