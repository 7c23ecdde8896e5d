// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// Token accounting for one message, accumulated across steps.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    pub input: u64,
    pub output: u64,
    #[serde(default)]
    pub cache_read: u64,
    #[serde(default)]
    pub cache_write: u64,
}

impl TokenUsage {
    pub fn add(&mut self, other: &TokenUsage) {
        self.input += other.input;
        self.output += other.output;
        self.cache_read += other.cache_read;
        self.cache_write += other.cache_write;
    }
}

/// Why a message's stream ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    /// Natural end of the assistant response.
    Stop,
    /// The model hit its output token ceiling.
    Length,
    /// The step ended because the model requested tool calls.
    ToolCalls,
    /// Cancelled by the client or the stream closed early.
    Interrupted,
    /// A non-retryable provider error ended the turn.
    Error,
}

/// Durable per-message record, stored under `session/message/{sid}/{mid}`.
///
/// Messages are append-only within a session; `id` ordering is creation
/// ordering (ids are lexicographically sortable).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageInfo {
    pub id: String,
    pub session_id: String,
    pub role: Role,
    pub time_created: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens: Option<TokenUsage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish: Option<FinishReason>,
    /// Marks a compaction summary; the latest summary message is the
    /// session's context floor.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub summary: bool,
    /// On a summary message: id of the newest message it replaces.  The
    /// model context is the summary plus everything newer than this cut.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compacted_through: Option<String>,
}

impl MessageInfo {
    pub fn new(id: impl Into<String>, session_id: impl Into<String>, role: Role) -> Self {
        Self {
            id: id.into(),
            session_id: session_id.into(),
            role,
            time_created: crate::now_ms(),
            provider_id: None,
            model_id: None,
            mode: None,
            tokens: None,
            cost: None,
            error: None,
            finish: None,
            summary: false,
            compacted_through: None,
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roles_serialize_lowercase() {
        assert_eq!(serde_json::to_string(&Role::User).unwrap(), "\"user\"");
        assert_eq!(
            serde_json::to_string(&Role::Assistant).unwrap(),
            "\"assistant\""
        );
    }

    #[test]
    fn token_usage_add_accumulates() {
        let mut a = TokenUsage {
            input: 10,
            output: 5,
            cache_read: 1,
            cache_write: 0,
        };
        a.add(&TokenUsage {
            input: 3,
            output: 7,
            cache_read: 0,
            cache_write: 2,
        });
        assert_eq!(a.input, 13);
        assert_eq!(a.output, 12);
        assert_eq!(a.cache_read, 1);
        assert_eq!(a.cache_write, 2);
    }

    #[test]
    fn summary_flag_omitted_when_false() {
        let m = MessageInfo::new("message_1", "session_1", Role::Assistant);
        let json = serde_json::to_string(&m).unwrap();
        assert!(!json.contains("summary"));
    }

    #[test]
    fn serde_roundtrip_with_finish_and_tokens() {
        let mut m = MessageInfo::new("message_2", "session_1", Role::Assistant);
        m.finish = Some(FinishReason::Interrupted);
        m.tokens = Some(TokenUsage {
            input: 100,
            output: 20,
            ..Default::default()
        });
        let back: MessageInfo =
            serde_json::from_str(&serde_json::to_string(&m).unwrap()).unwrap();
        assert_eq!(back, m);
        assert_eq!(back.finish, Some(FinishReason::Interrupted));
    }

    #[test]
    fn finish_reason_snake_case_wire_form() {
        assert_eq!(
            serde_json::to_string(&FinishReason::ToolCalls).unwrap(),
            "\"tool_calls\""
        );
    }
}
