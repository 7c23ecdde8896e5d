// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A pending operator-approval request for one tool invocation.
///
/// `kind` is the tool name; `pattern` is the rule pattern that triggered the
/// prompt (for a shell tool, a command glob like `git *`) and doubles as the
/// memoization key for "always" replies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionInfo {
    pub id: String,
    pub session_id: String,
    pub message_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    pub title: String,
    pub metadata: Value,
    pub time_created: i64,
}

impl PermissionInfo {
    /// The session-scoped memoization key: `pattern ?? type`.
    pub fn memo_key(&self) -> &str {
        self.pattern.as_deref().unwrap_or(&self.kind)
    }
}

/// Operator response to a permission prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionReply {
    Once,
    Always,
    Reject,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
