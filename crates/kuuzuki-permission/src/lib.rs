// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Permission gate.  Tool invocations that require approval pass through
//! [`PermissionGate::ask`], which resolves against (highest priority first)
//! the `OPENCODE_PERMISSION` environment blob, the merged config, and the
//! allow-everything default.  An `ask` outcome suspends the caller on a
//! pending-prompt table until the operator answers, a 30-second timer fires,
//! or the session is cancelled.  "Always" answers are memoized per
//! `(session, pattern ?? type)` for the lifetime of the process.

mod pattern;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, info};

use kuuzuki_bus::{Bus, Event};
use kuuzuki_config::{
    PermissionConfig, PermissionDecision, PermissionRule, PermissionRuleSet,
};
use kuuzuki_id::{ascending, IdKind};
use kuuzuki_plugin::PluginHost;
use kuuzuki_types::{now_ms, PermissionInfo, PermissionReply};

pub use pattern::{best_match, glob_match};

/// Deadline for an unanswered prompt.
pub const ASK_TIMEOUT: Duration = Duration::from_secs(30);

/// What a tool invocation submits to the gate.
#[derive(Debug, Clone)]
pub struct AskRequest {
    pub session_id: String,
    pub message_id: String,
    pub call_id: Option<String>,
    /// Tool name; the permission record's `type`.
    pub kind: String,
    /// Pattern computed by the tool, e.g. the substituted shell command.
    pub pattern: Option<String>,
    pub title: String,
    pub metadata: Value,
    /// Active agent name, for `agents.<name>` config overrides.
    pub agent: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// The operator answered "reject".
    User,
    /// A `deny` rule in the environment or config.
    Config,
    /// A plugin wrote `deny` in the `permission.ask` hook.
    Plugin,
    /// The prompt expired unanswered.
    Timeout,
    /// The session was cancelled while the prompt was pending.
    SessionEnded,
}

#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct RejectedError {
    pub reason: RejectReason,
    pub message: String,
}

impl RejectedError {
    fn new(reason: RejectReason, message: impl Into<String>) -> Self {
        Self {
            reason,
            message: message.into(),
        }
    }
}

enum Outcome {
    Approved,
    Rejected(RejectReason),
}

struct Pending {
    session_id: String,
    /// Memoization key: the matched rule pattern, or the tool name.
    key: String,
    tx: oneshot::Sender<Outcome>,
}

pub struct PermissionGate {
    bus: Arc<Bus>,
    plugins: Arc<PluginHost>,
    /// `OPENCODE_PERMISSION` override; consulted before `config`.
    env_rules: Option<PermissionConfig>,
    config_rules: Option<PermissionConfig>,
    pending: Mutex<HashMap<String, Pending>>,
    approved: Mutex<HashSet<(String, String)>>,
    timeout: Duration,
}

impl PermissionGate {
    pub fn new(
        bus: Arc<Bus>,
        plugins: Arc<PluginHost>,
        env_rules: Option<PermissionConfig>,
        config_rules: Option<PermissionConfig>,
    ) -> Arc<Self> {
        Arc::new(Self {
            bus,
            plugins,
            env_rules,
            config_rules,
            pending: Mutex::new(HashMap::new()),
            approved: Mutex::new(HashSet::new()),
            timeout: ASK_TIMEOUT,
        })
    }

    /// Shrink the prompt deadline.  Test hook only; the production deadline
    /// is fixed at 30 seconds.
    pub fn with_timeout(mut self: Arc<Self>, timeout: Duration) -> Arc<Self> {
        Arc::get_mut(&mut self)
            .expect("with_timeout must be called before the gate is shared")
            .timeout = timeout;
        self
    }

    /// Resolve the request.  Returns when the invocation is allowed; rejects
    /// with [`RejectedError`] otherwise.
    pub async fn ask(&self, req: AskRequest) -> Result<(), RejectedError> {
        let (decision, matched_pattern) = self.decide(&req);

        match decision {
            PermissionDecision::Allow => return Ok(()),
            PermissionDecision::Deny => {
                return Err(RejectedError::new(
                    RejectReason::Config,
                    "Permission denied by configuration",
                ))
            }
            PermissionDecision::Ask => {}
        }

        // The memoization key is the rule pattern that triggered the ask so
        // an "always" on `git *` covers every later git command.
        let pattern = matched_pattern.or_else(|| req.pattern.clone());
        let key = pattern.clone().unwrap_or_else(|| req.kind.clone());

        if self
            .approved
            .lock()
            .expect("approved table poisoned")
            .contains(&(req.session_id.clone(), key.clone()))
        {
            debug!(session = %req.session_id, key = %key, "permission satisfied from session cache");
            return Ok(());
        }

        let info = PermissionInfo {
            id: ascending(IdKind::Permission),
            session_id: req.session_id.clone(),
            message_id: req.message_id.clone(),
            call_id: req.call_id.clone(),
            kind: req.kind.clone(),
            pattern,
            title: req.title.clone(),
            metadata: req.metadata.clone(),
            time_created: now_ms(),
        };

        // Plugins may settle the request before the operator sees it.
        let mut plugin_decision = PermissionDecision::Ask;
        self.plugins.permission_ask(&info, &mut plugin_decision).await;
        match plugin_decision {
            PermissionDecision::Allow => return Ok(()),
            PermissionDecision::Deny => {
                return Err(RejectedError::new(
                    RejectReason::Plugin,
                    "Permission denied by plugin",
                ))
            }
            PermissionDecision::Ask => {}
        }

        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .expect("pending table poisoned")
            .insert(
                info.id.clone(),
                Pending {
                    session_id: req.session_id.clone(),
                    key,
                    tx,
                },
            );
        self.bus
            .publish(Event::PermissionUpdated { info: info.clone() })
            .await;

        match tokio::time::timeout(self.timeout, rx).await {
            Err(_elapsed) => {
                self.pending
                    .lock()
                    .expect("pending table poisoned")
                    .remove(&info.id);
                Err(RejectedError::new(
                    RejectReason::Timeout,
                    "Permission request timed out",
                ))
            }
            Ok(Err(_closed)) => Err(RejectedError::new(
                RejectReason::SessionEnded,
                "Permission request abandoned",
            )),
            Ok(Ok(Outcome::Approved)) => Ok(()),
            Ok(Ok(Outcome::Rejected(reason))) => {
                let message = match reason {
                    RejectReason::SessionEnded => "Permission rejected: session ended",
                    _ => "Permission denied",
                };
                Err(RejectedError::new(reason, message))
            }
        }
    }

    /// Deliver an operator response.  Returns false when the permission id
    /// is unknown or belongs to another session (already resolved, timed
    /// out, or a stale client).
    pub async fn respond(
        &self,
        session_id: &str,
        permission_id: &str,
        reply: PermissionReply,
    ) -> bool {
        let entry = {
            let mut pending = self.pending.lock().expect("pending table poisoned");
            match pending.get(permission_id) {
                Some(e) if e.session_id == session_id => pending.remove(permission_id).unwrap(),
                _ => return false,
            }
        };

        // "Always" memoizes the key and drains every same-key prompt that is
        // pending right now — collected once, resolved without recursion.
        let mut coalesced: Vec<(String, Pending)> = Vec::new();
        if reply == PermissionReply::Always {
            self.approved
                .lock()
                .expect("approved table poisoned")
                .insert((session_id.to_string(), entry.key.clone()));
            let mut pending = self.pending.lock().expect("pending table poisoned");
            let same_key: Vec<String> = pending
                .iter()
                .filter(|(_, e)| e.session_id == session_id && e.key == entry.key)
                .map(|(id, _)| id.clone())
                .collect();
            for id in same_key {
                let e = pending.remove(&id).unwrap();
                coalesced.push((id, e));
            }
        }

        let outcome = match reply {
            PermissionReply::Once | PermissionReply::Always => Outcome::Approved,
            PermissionReply::Reject => Outcome::Rejected(RejectReason::User),
        };
        let _ = entry.tx.send(outcome);
        self.bus
            .publish(Event::PermissionReplied {
                session_id: session_id.to_string(),
                permission_id: permission_id.to_string(),
                response: reply,
            })
            .await;

        for (id, e) in coalesced {
            let _ = e.tx.send(Outcome::Approved);
            self.bus
                .publish(Event::PermissionReplied {
                    session_id: session_id.to_string(),
                    permission_id: id,
                    response: PermissionReply::Once,
                })
                .await;
        }

        true
    }

    /// Reject every pending prompt of `session_id` with a session-ended
    /// cause.  Called on session cancel.
    pub async fn cancel_session(&self, session_id: &str) {
        let drained: Vec<(String, Pending)> = {
            let mut pending = self.pending.lock().expect("pending table poisoned");
            let ids: Vec<String> = pending
                .iter()
                .filter(|(_, e)| e.session_id == session_id)
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .map(|id| {
                    let e = pending.remove(&id).unwrap();
                    (id, e)
                })
                .collect()
        };
        if !drained.is_empty() {
            info!(session = session_id, count = drained.len(), "rejecting pending permissions");
        }
        for (id, e) in drained {
            let _ = e.tx.send(Outcome::Rejected(RejectReason::SessionEnded));
            self.bus
                .publish(Event::PermissionReplied {
                    session_id: session_id.to_string(),
                    permission_id: id,
                    response: PermissionReply::Reject,
                })
                .await;
        }
    }

    /// Number of prompts currently awaiting an answer.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().expect("pending table poisoned").len()
    }

    /// Evaluate the layered policy.  Returns the decision and, when a rule
    /// pattern produced it, that pattern (the memoization key).
    fn decide(&self, req: &AskRequest) -> (PermissionDecision, Option<String>) {
        for source in [&self.env_rules, &self.config_rules] {
            if let Some(cfg) = source {
                if let Some(hit) = evaluate(cfg, req) {
                    return hit;
                }
            }
        }
        (PermissionDecision::Allow, None)
    }
}

/// Evaluate one configuration source; `None` means this source is silent on
/// the request and the next-priority source decides.
fn evaluate(
    cfg: &PermissionConfig,
    req: &AskRequest,
) -> Option<(PermissionDecision, Option<String>)> {
    match cfg {
        // List form: any matching glob means "ask".  Patterns are matched
        // against both the tool name and the tool-computed pattern.
        PermissionConfig::Patterns(patterns) => {
            for candidate in [Some(req.kind.as_str()), req.pattern.as_deref()]
                .into_iter()
                .flatten()
            {
                if let Some(i) = best_match(patterns.iter().map(String::as_str), candidate) {
                    return Some((PermissionDecision::Ask, Some(patterns[i].clone())));
                }
            }
            None
        }
        PermissionConfig::Rules(rules) => {
            if let Some(agent) = &req.agent {
                if let Some(overrides) = rules.agents.get(agent) {
                    if let Some(hit) = evaluate_rules(&overrides.rules, &overrides.tools, req) {
                        return Some(hit);
                    }
                }
            }
            evaluate_rules(&rules.rules, &rules.tools, req)
        }
    }
}

fn evaluate_rules(
    rules: &indexmap_rules::Rules,
    tools_wildcard: &indexmap_rules::Tools,
    req: &AskRequest,
) -> Option<(PermissionDecision, Option<String>)> {
    if let Some(rule) = rules.get(&req.kind) {
        match rule {
            PermissionRule::Decision(d) => return Some((*d, None)),
            PermissionRule::Patterns(map) => {
                if let Some(pattern) = &req.pattern {
                    if let Some(i) = best_match(map.keys().map(String::as_str), pattern) {
                        let (glob, decision) = map.get_index(i).unwrap();
                        return Some((*decision, Some(glob.clone())));
                    }
                }
            }
        }
    }
    if let Some(i) = best_match(tools_wildcard.keys().map(String::as_str), &req.kind) {
        let (glob, decision) = tools_wildcard.get_index(i).unwrap();
        return Some((*decision, Some(glob.clone())));
    }
    None
}

/// Type aliases keeping `evaluate_rules` signatures readable.
mod indexmap_rules {
    use indexmap::IndexMap;

    use kuuzuki_config::{PermissionDecision, PermissionRule};

    pub type Rules = IndexMap<String, PermissionRule>;
    pub type Tools = IndexMap<String, PermissionDecision>;
}

/// Build a [`PermissionRuleSet`]-backed config from JSON, for tests and
/// embedders that assemble policy programmatically.
pub fn rules_from_json(json: &str) -> anyhow::Result<PermissionConfig> {
    Ok(serde_json::from_str::<PermissionRuleSet>(json).map(PermissionConfig::Rules)?)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
