// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;

use kuuzuki_bus::Bus;
use kuuzuki_config::{Config, ShareMode};
use kuuzuki_model::{Provider, ProviderRegistry};
use kuuzuki_permission::PermissionGate;
use kuuzuki_plugin::PluginHost;
use kuuzuki_storage::Storage;
use kuuzuki_tools::ToolRegistry;
use kuuzuki_types::{MessageInfo, ShareInfo};

use crate::store::SessionStore;
use crate::{CoreError, ShareClient};

/// Explicit application context.  Constructed once at startup and passed by
/// reference; components never reach for ambient process state.
pub struct App {
    pub bus: Arc<Bus>,
    pub storage: Arc<Storage>,
    pub config: Arc<Config>,
    pub providers: Arc<ProviderRegistry>,
    pub tools: Arc<ToolRegistry>,
    pub permissions: Arc<PermissionGate>,
    pub plugins: Arc<PluginHost>,
    pub sessions: Arc<SessionStore>,
    pub share_client: Option<Arc<dyn ShareClient>>,
    /// Project root; tool paths resolve against it.
    pub root: PathBuf,
}

impl App {
    #[allow(clippy::too_many_arguments)]
    pub fn assemble(
        bus: Arc<Bus>,
        storage: Arc<Storage>,
        config: Arc<Config>,
        providers: Arc<ProviderRegistry>,
        tools: Arc<ToolRegistry>,
        permissions: Arc<PermissionGate>,
        plugins: Arc<PluginHost>,
        share_client: Option<Arc<dyn ShareClient>>,
        root: PathBuf,
    ) -> anyhow::Result<Arc<Self>> {
        let sessions = SessionStore::new(Arc::clone(&bus), Arc::clone(&storage))?;
        plugins.attach(&bus);
        Ok(Arc::new(Self {
            bus,
            storage,
            config,
            providers,
            tools,
            permissions,
            plugins,
            sessions,
            share_client,
            root,
        }))
    }

    /// Resolve the provider for an explicit reference, the active agent's
    /// model, the mode's model, or the configured default — in that order.
    pub fn resolve_provider(
        &self,
        explicit: Option<&str>,
        agent: Option<&str>,
        mode: Option<&str>,
    ) -> Result<Arc<dyn Provider>, CoreError> {
        let agent_model = agent
            .and_then(|name| self.config.agent.get(name))
            .and_then(|a| a.model.as_deref());
        let mode_model = mode
            .and_then(|name| self.config.mode.get(name))
            .and_then(|m| m.model.as_deref());
        let reference = explicit
            .or(agent_model)
            .or(mode_model)
            .or(self.config.model.as_deref())
            .context("no model configured; set `model` in the config")?;
        Ok(self.providers.resolve(reference)?)
    }

    /// Cancel the active turn of `session_id`: the stream reader and any
    /// in-flight tool see the token, and every pending permission prompt is
    /// rejected with a session-ended cause.
    pub async fn cancel(&self, session_id: &str) -> bool {
        let had_turn = self.sessions.cancel(session_id);
        self.permissions.cancel_session(session_id).await;
        had_turn
    }

    // ── Share lifecycle ───────────────────────────────────────────────────────

    pub async fn share(&self, session_id: &str) -> Result<ShareInfo, CoreError> {
        if self.config.share == ShareMode::Disabled {
            return Err(CoreError::Other(anyhow::anyhow!(
                "sharing is disabled by configuration"
            )));
        }
        let client = self
            .share_client
            .as_ref()
            .context("no share collaborator configured")?;
        let session = self.sessions.get(session_id).await?;
        if let Some(existing) = session.share {
            return Ok(existing);
        }
        let info = client.create(session_id).await.context("creating share")?;
        self.sessions
            .update(session_id, |s| s.share = Some(info.clone()))
            .await?;
        Ok(info)
    }

    pub async fn unshare(&self, session_id: &str) -> Result<(), CoreError> {
        let session = self.sessions.get(session_id).await?;
        let Some(share) = session.share else {
            return Ok(());
        };
        if let Some(client) = &self.share_client {
            client
                .remove(session_id, &share.secret)
                .await
                .context("removing share")?;
        }
        self.sessions
            .update(session_id, |s| s.share = None)
            .await?;
        Ok(())
    }

    /// Summarize the session and set a new context floor, using the default
    /// provider chain.
    pub async fn compact_session(&self, session_id: &str) -> Result<MessageInfo, CoreError> {
        let provider = self.resolve_provider(None, None, None)?;
        crate::compact::compact(self, session_id, &provider).await
    }
}
