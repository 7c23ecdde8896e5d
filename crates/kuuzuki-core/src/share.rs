// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;

use kuuzuki_types::ShareInfo;

/// Boundary to the external share service.  The engine only drives the
/// lifecycle; publishing, rendering and storage of shared sessions are the
/// collaborator's concern.
#[async_trait]
pub trait ShareClient: Send + Sync {
    /// Publish a session; returns the public URL and the management secret.
    async fn create(&self, session_id: &str) -> anyhow::Result<ShareInfo>;

    /// Withdraw a published session.
    async fn remove(&self, session_id: &str, secret: &str) -> anyhow::Result<()>;
}
