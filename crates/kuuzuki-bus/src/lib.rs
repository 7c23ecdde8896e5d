// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! In-process event bus.  Events are a closed, typed union; subscribers
//! register an async handler for one event name (or `*`) and the publisher
//! awaits every matching handler in registration order before `publish`
//! returns.  Handler failures are logged and isolated.  A broadcast tap is
//! available for projection surfaces (SSE) that must never block a turn.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use futures::future::BoxFuture;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::warn;

use kuuzuki_types::{MessageInfo, Part, PermissionInfo, PermissionReply, SessionInfo};

/// A published event plus its process-unique, monotonically increasing id.
/// The id doubles as the SSE event id so reconnecting observers can dedupe.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub id: u64,
    #[serde(flatten)]
    pub event: Event,
}

/// The closed set of events the engine publishes.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "properties", rename_all_fields = "camelCase")]
pub enum Event {
    #[serde(rename = "session.updated")]
    SessionUpdated { info: SessionInfo },
    #[serde(rename = "session.deleted")]
    SessionDeleted { session_id: String },
    #[serde(rename = "session.error")]
    SessionError {
        session_id: Option<String>,
        error: String,
    },
    #[serde(rename = "message.updated")]
    MessageUpdated { info: MessageInfo },
    #[serde(rename = "message.removed")]
    MessageRemoved {
        session_id: String,
        message_id: String,
    },
    #[serde(rename = "part.updated")]
    PartUpdated { part: Part },
    #[serde(rename = "part.removed")]
    PartRemoved {
        session_id: String,
        message_id: String,
        part_id: String,
    },
    #[serde(rename = "permission.updated")]
    PermissionUpdated { info: PermissionInfo },
    #[serde(rename = "permission.replied")]
    PermissionReplied {
        session_id: String,
        permission_id: String,
        response: PermissionReply,
    },
    #[serde(rename = "storage.write")]
    StorageWrite { key: String },
    #[serde(rename = "installation.updated")]
    InstallationUpdated { version: String },
    #[serde(rename = "ide.installed")]
    IdeInstalled { ide: String },
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::SessionUpdated { .. } => "session.updated",
            Event::SessionDeleted { .. } => "session.deleted",
            Event::SessionError { .. } => "session.error",
            Event::MessageUpdated { .. } => "message.updated",
            Event::MessageRemoved { .. } => "message.removed",
            Event::PartUpdated { .. } => "part.updated",
            Event::PartRemoved { .. } => "part.removed",
            Event::PermissionUpdated { .. } => "permission.updated",
            Event::PermissionReplied { .. } => "permission.replied",
            Event::StorageWrite { .. } => "storage.write",
            Event::InstallationUpdated { .. } => "installation.updated",
            Event::IdeInstalled { .. } => "ide.installed",
        }
    }
}

pub type Handler = Arc<dyn Fn(Envelope) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

struct Subscriber {
    id: u64,
    /// Event name this subscriber wants, or `*` for everything.
    filter: String,
    handler: Handler,
}

impl std::fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscriber")
            .field("id", &self.id)
            .field("filter", &self.filter)
            .finish_non_exhaustive()
    }
}

pub struct Bus {
    seq: AtomicU64,
    sub_seq: AtomicU64,
    subscribers: RwLock<Vec<Subscriber>>,
    tap: broadcast::Sender<Envelope>,
}

impl std::fmt::Debug for Bus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bus")
            .field("seq", &self.seq)
            .field("sub_seq", &self.sub_seq)
            .field("subscribers", &self.subscribers)
            .finish_non_exhaustive()
    }
}

impl Bus {
    pub fn new() -> Arc<Self> {
        let (tap, _) = broadcast::channel(1024);
        Arc::new(Self {
            seq: AtomicU64::new(1),
            sub_seq: AtomicU64::new(1),
            subscribers: RwLock::new(Vec::new()),
            tap,
        })
    }

    /// Register a handler for `filter` (an event name or `*`).
    /// Returns a token for [`Bus::unsubscribe`].
    pub fn subscribe<F>(&self, filter: impl Into<String>, handler: F) -> u64
    where
        F: Fn(Envelope) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync + 'static,
    {
        let id = self.sub_seq.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .write()
            .expect("bus subscriber table poisoned")
            .push(Subscriber {
                id,
                filter: filter.into(),
                handler: Arc::new(handler),
            });
        id
    }

    pub fn unsubscribe(&self, token: u64) {
        self.subscribers
            .write()
            .expect("bus subscriber table poisoned")
            .retain(|s| s.id != token);
    }

    /// Lossy observer channel.  Unlike handlers, a lagging tap drops old
    /// envelopes instead of slowing the publisher down.
    pub fn tap(&self) -> broadcast::Receiver<Envelope> {
        self.tap.subscribe()
    }

    /// Publish `event`: every matching handler runs sequentially in
    /// registration order and is awaited; errors are logged and do not stop
    /// delivery to the remaining handlers.  Returns the envelope id.
    pub async fn publish(&self, event: Event) -> u64 {
        let envelope = Envelope {
            id: self.seq.fetch_add(1, Ordering::Relaxed),
            event,
        };

        let matching: Vec<Handler> = {
            let subs = self
                .subscribers
                .read()
                .expect("bus subscriber table poisoned");
            subs.iter()
                .filter(|s| s.filter == "*" || s.filter == envelope.event.name())
                .map(|s| Arc::clone(&s.handler))
                .collect()
        };

        for handler in matching {
            if let Err(e) = handler(envelope.clone()).await {
                warn!(event = envelope.event.name(), error = %e, "event handler failed");
            }
        }

        let _ = self.tap.send(envelope.clone());
        envelope.id
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
