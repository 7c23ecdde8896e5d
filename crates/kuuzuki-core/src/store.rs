// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::info;

use kuuzuki_bus::{Bus, Event};
use kuuzuki_id::{ascending, IdKind};
use kuuzuki_storage::Storage;
use kuuzuki_types::{now_ms, MessageInfo, Part, RevertAnchor, SessionInfo};

use crate::lock::{LockManager, SessionLock};
use crate::CoreError;

const DEFAULT_TITLE: &str = "Untitled";

/// Durable session state plus the per-process turn bookkeeping (locks and
/// cancellation tokens).  The turn loop is the sole writer of messages and
/// parts during an active turn.
pub struct SessionStore {
    bus: Arc<Bus>,
    storage: Arc<Storage>,
    locks: LockManager,
    active: Mutex<HashMap<String, CancellationToken>>,
}

fn info_key(id: &str) -> String {
    format!("session/info/{id}")
}

fn message_key(session_id: &str, message_id: &str) -> String {
    format!("session/message/{session_id}/{message_id}")
}

fn part_key(session_id: &str, message_id: &str, part_id: &str) -> String {
    format!("session/part/{session_id}/{message_id}/{part_id}")
}

impl SessionStore {
    /// Open the store.  Stale locks left by dead processes are swept here.
    pub fn new(bus: Arc<Bus>, storage: Arc<Storage>) -> anyhow::Result<Arc<Self>> {
        let locks = LockManager::new(storage.root())?;
        let swept = locks.sweep();
        if swept > 0 {
            info!(count = swept, "cleared stale session locks");
        }
        Ok(Arc::new(Self {
            bus,
            storage,
            locks,
            active: Mutex::new(HashMap::new()),
        }))
    }

    // ── Session info ──────────────────────────────────────────────────────────

    pub async fn create(&self, parent_id: Option<String>) -> Result<SessionInfo, CoreError> {
        let info = SessionInfo::new(ascending(IdKind::Session), parent_id, DEFAULT_TITLE);
        self.storage
            .write_json(&info_key(&info.id), &info)
            .await
            .context("writing session info")?;
        self.bus
            .publish(Event::SessionUpdated { info: info.clone() })
            .await;
        Ok(info)
    }

    pub async fn get(&self, id: &str) -> Result<SessionInfo, CoreError> {
        self.storage
            .read_json::<SessionInfo>(&info_key(id))
            .await
            .context("reading session info")?
            .ok_or_else(|| CoreError::SessionNotFound(id.to_string()))
    }

    /// Apply `mutate`, refresh `time_updated`, persist and publish.
    pub async fn update(
        &self,
        id: &str,
        mutate: impl FnOnce(&mut SessionInfo),
    ) -> Result<SessionInfo, CoreError> {
        let mut info = self.get(id).await?;
        mutate(&mut info);
        info.time_updated = now_ms().max(info.time_created);
        self.storage
            .write_json(&info_key(id), &info)
            .await
            .context("writing session info")?;
        self.bus
            .publish(Event::SessionUpdated { info: info.clone() })
            .await;
        Ok(info)
    }

    pub async fn list(&self) -> Result<Vec<SessionInfo>, CoreError> {
        let keys = self
            .storage
            .list("session/info")
            .await
            .context("listing sessions")?;
        let mut sessions = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(info) = self
                .storage
                .read_json::<SessionInfo>(&key)
                .await
                .context("reading session info")?
            {
                sessions.push(info);
            }
        }
        Ok(sessions)
    }

    /// Delete the session and its whole storage subtree.
    pub async fn remove(&self, id: &str) -> Result<(), CoreError> {
        self.get(id).await?;
        self.cancel(id);
        self.storage
            .remove_prefix(&format!("session/part/{id}"))
            .await
            .context("removing parts")?;
        self.storage
            .remove_prefix(&format!("session/message/{id}"))
            .await
            .context("removing messages")?;
        self.storage
            .remove(&info_key(id))
            .await
            .context("removing session info")?;
        self.bus
            .publish(Event::SessionDeleted {
                session_id: id.to_string(),
            })
            .await;
        Ok(())
    }

    // ── Messages and parts ────────────────────────────────────────────────────

    pub async fn messages(&self, session_id: &str) -> Result<Vec<MessageInfo>, CoreError> {
        let keys = self
            .storage
            .list(&format!("session/message/{session_id}"))
            .await
            .context("listing messages")?;
        let mut messages = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(info) = self
                .storage
                .read_json::<MessageInfo>(&key)
                .await
                .context("reading message")?
            {
                messages.push(info);
            }
        }
        Ok(messages)
    }

    pub async fn parts(&self, session_id: &str, message_id: &str) -> Result<Vec<Part>, CoreError> {
        let keys = self
            .storage
            .list(&format!("session/part/{session_id}/{message_id}"))
            .await
            .context("listing parts")?;
        let mut parts = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(part) = self
                .storage
                .read_json::<Part>(&key)
                .await
                .context("reading part")?
            {
                parts.push(part);
            }
        }
        Ok(parts)
    }

    pub async fn write_message(&self, info: &MessageInfo) -> Result<(), CoreError> {
        self.storage
            .write_json(&message_key(&info.session_id, &info.id), info)
            .await
            .context("writing message")?;
        self.bus
            .publish(Event::MessageUpdated { info: info.clone() })
            .await;
        Ok(())
    }

    pub async fn write_part(&self, part: &Part) -> Result<(), CoreError> {
        self.storage
            .write_json(
                &part_key(&part.session_id, &part.message_id, &part.id),
                part,
            )
            .await
            .context("writing part")?;
        self.bus
            .publish(Event::PartUpdated { part: part.clone() })
            .await;
        Ok(())
    }

    // ── Revert ────────────────────────────────────────────────────────────────

    /// Hide every message at or after the anchor from the model context.
    /// The messages stay in storage; `unrevert` restores them.
    pub async fn revert(
        &self,
        id: &str,
        anchor: RevertAnchor,
    ) -> Result<SessionInfo, CoreError> {
        self.update(id, |info| info.revert = Some(anchor)).await
    }

    pub async fn unrevert(&self, id: &str) -> Result<SessionInfo, CoreError> {
        self.update(id, |info| info.revert = None).await
    }

    // ── Turn lifecycle ────────────────────────────────────────────────────────

    /// Acquire the session lock and register a fresh cancellation token.
    /// Fails with [`CoreError::SessionBusy`] while another turn is active.
    pub fn begin_turn(self: &Arc<Self>, session_id: &str) -> Result<TurnGuard, CoreError> {
        let lock = self.locks.acquire(session_id)?;
        let token = CancellationToken::new();
        self.active
            .lock()
            .expect("active turn table poisoned")
            .insert(session_id.to_string(), token.clone());
        Ok(TurnGuard {
            store: Arc::clone(self),
            session_id: session_id.to_string(),
            lock: Some(lock),
            token,
        })
    }

    /// Signal the active turn of `session_id` to stop.  Returns false when
    /// no turn is active.
    pub fn cancel(&self, session_id: &str) -> bool {
        let active = self.active.lock().expect("active turn table poisoned");
        match active.get(session_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    fn end_turn(&self, session_id: &str) {
        self.active
            .lock()
            .expect("active turn table poisoned")
            .remove(session_id);
    }
}

/// Holds the session lock and cancellation token for one turn; dropping it
/// releases both.
pub struct TurnGuard {
    store: Arc<SessionStore>,
    session_id: String,
    lock: Option<SessionLock>,
    token: CancellationToken,
}

impl TurnGuard {
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }
}

impl Drop for TurnGuard {
    fn drop(&mut self) {
        self.store.end_turn(&self.session_id);
        if let Some(lock) = self.lock.take() {
            lock.release();
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
