// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use serde::{Deserialize, Serialize};

/// Durable per-session record, stored under `session/info/{id}`.
///
/// Sessions form a tree through `parent_id`; children share nothing with the
/// parent except the storage prefix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    pub title: String,
    pub time_created: i64,
    pub time_updated: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub share: Option<ShareInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revert: Option<RevertAnchor>,
}

impl SessionInfo {
    pub fn new(id: impl Into<String>, parent_id: Option<String>, title: impl Into<String>) -> Self {
        let now = crate::now_ms();
        Self {
            id: id.into(),
            parent_id,
            title: title.into(),
            time_created: now,
            time_updated: now,
            share: None,
            revert: None,
        }
    }
}

/// Read-only publication handle returned by the share collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShareInfo {
    pub url: String,
    pub secret: String,
}

/// Marker hiding every message at or after `message_id` from the model
/// context while leaving them in storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RevertAnchor {
    pub message_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub part_id: Option<String>,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_session_timestamps_are_consistent() {
        let s = SessionInfo::new("session_1", None, "Untitled");
        assert!(s.time_updated >= s.time_created);
        assert!(s.share.is_none());
        assert!(s.revert.is_none());
    }

    #[test]
    fn serde_roundtrip_preserves_parent() {
        let s = SessionInfo::new("session_2", Some("session_1".into()), "child");
        let json = serde_json::to_string(&s).unwrap();
        let back: SessionInfo = serde_json::from_str(&json).unwrap();
        assert_eq!(back, s);
    }

    #[test]
    fn optional_fields_are_omitted_from_json() {
        let s = SessionInfo::new("session_3", None, "t");
        let json = serde_json::to_string(&s).unwrap();
        assert!(!json.contains("parentId"));
        assert!(!json.contains("share"));
        assert!(!json.contains("revert"));
    }
}
