// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::TokenUsage;

/// Millisecond interval covering a tool execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeRange {
    pub start: i64,
    pub end: i64,
}

/// Lifecycle of a tool invocation inside a message.
///
/// Transitions only move forward: `pending → running → completed | error`.
/// [`ToolState::rank`] gives the numeric ordering used to assert that.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ToolState {
    Pending,
    Running {
        input: Value,
    },
    Completed {
        input: Value,
        output: String,
        title: String,
        metadata: Value,
        time: TimeRange,
    },
    Error {
        input: Value,
        error: String,
        time: TimeRange,
    },
}

impl ToolState {
    /// Position in the forward-only lifecycle; terminal states share a rank.
    pub fn rank(&self) -> u8 {
        match self {
            ToolState::Pending => 0,
            ToolState::Running { .. } => 1,
            ToolState::Completed { .. } | ToolState::Error { .. } => 2,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.rank() == 2
    }

    /// True when moving from `self` to `next` respects the lifecycle.
    pub fn allows(&self, next: &ToolState) -> bool {
        next.rank() > self.rank()
    }
}

/// One indivisible piece of a message, stored under
/// `session/part/{sid}/{mid}/{pid}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    pub id: String,
    pub session_id: String,
    pub message_id: String,
    #[serde(flatten)]
    pub body: PartBody,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum PartBody {
    Text {
        text: String,
    },
    Reasoning {
        text: String,
    },
    File {
        mime: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        filename: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        url: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        inline_data: Option<String>,
    },
    StepStart,
    StepFinish {
        tokens: TokenUsage,
        cost: f64,
    },
    Snapshot {
        commit: String,
    },
    Tool {
        tool: String,
        call_id: String,
        state: ToolState,
    },
}

impl Part {
    pub fn new(
        id: impl Into<String>,
        session_id: impl Into<String>,
        message_id: impl Into<String>,
        body: PartBody,
    ) -> Self {
        Self {
            id: id.into(),
            session_id: session_id.into(),
            message_id: message_id.into(),
            body,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match &self.body {
            PartBody::Text { text } => Some(text),
            _ => None,
        }
    }

    pub fn tool_state(&self) -> Option<&ToolState> {
        match &self.body {
            PartBody::Tool { state, .. } => Some(state),
            _ => None,
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
