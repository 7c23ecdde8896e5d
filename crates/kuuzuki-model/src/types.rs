// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};
use serde_json::Value;

use kuuzuki_types::{FinishReason, TokenUsage};

/// Role in the provider-facing conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelRole {
    System,
    User,
    Assistant,
    Tool,
}

/// Content of one provider-facing message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ModelContent {
    Text(String),
    ToolCall {
        call_id: String,
        name: String,
        /// JSON-encoded arguments, forwarded verbatim.
        arguments: String,
    },
    ToolResult {
        call_id: String,
        content: String,
    },
}

/// One message in the context window sent to a provider adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelMessage {
    pub role: ModelRole,
    pub content: ModelContent,
}

impl ModelMessage {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: ModelRole::System,
            content: ModelContent::Text(text.into()),
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: ModelRole::User,
            content: ModelContent::Text(text.into()),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: ModelRole::Assistant,
            content: ModelContent::Text(text.into()),
        }
    }

    pub fn tool_call(
        call_id: impl Into<String>,
        name: impl Into<String>,
        arguments: impl Into<String>,
    ) -> Self {
        Self {
            role: ModelRole::Assistant,
            content: ModelContent::ToolCall {
                call_id: call_id.into(),
                name: name.into(),
                arguments: arguments.into(),
            },
        }
    }

    pub fn tool_result(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: ModelRole::Tool,
            content: ModelContent::ToolResult {
                call_id: call_id.into(),
                content: content.into(),
            },
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match &self.content {
            ModelContent::Text(t) => Some(t),
            _ => None,
        }
    }

    /// Rough token estimate (chars / 4).  Good enough for budget gating;
    /// providers report exact usage per step.
    pub fn approx_tokens(&self) -> usize {
        let chars = match &self.content {
            ModelContent::Text(t) => t.len(),
            ModelContent::ToolCall {
                name, arguments, ..
            } => name.len() + arguments.len(),
            ModelContent::ToolResult { content, .. } => content.len(),
        };
        chars / 4
    }
}

/// Tool descriptor advertised to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    /// JSON Schema for the arguments object.
    pub parameters: Value,
}

/// One streaming completion request.  The adapter is stateless: the turn
/// loop re-invokes it per step with tool results appended to `messages`.
#[derive(Debug, Clone, Default)]
pub struct CompletionRequest {
    pub messages: Vec<ModelMessage>,
    pub tools: Vec<ToolSchema>,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
}

impl CompletionRequest {
    pub fn approx_tokens(&self) -> usize {
        let message_tokens: usize = self.messages.iter().map(ModelMessage::approx_tokens).sum();
        let schema_tokens: usize = self
            .tools
            .iter()
            .map(|t| (t.name.len() + t.description.len() + t.parameters.to_string().len()) / 4)
            .sum();
        message_tokens + schema_tokens
    }
}

/// A single streamed event from the provider adapter.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// A text delta streamed from the model.
    TextDelta(String),
    /// A thinking/reasoning delta (extended thinking APIs).
    ReasoningDelta(String),
    /// The model opened a tool call.
    ToolCallStart { call_id: String, name: String },
    /// Argument fragment for an open tool call.
    ToolCallDelta { call_id: String, arguments: String },
    /// The tool call's arguments are complete; the engine must execute it
    /// before consuming further tool calls.
    ToolCallReady {
        call_id: String,
        name: String,
        arguments: String,
    },
    /// The provider began a new internal step.
    StepStart,
    /// The provider finished a step; carries usage and cost for the step.
    StepFinish { tokens: TokenUsage, cost: f64 },
    /// The stream finished.
    Finish { reason: FinishReason },
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constructors_set_roles() {
        assert_eq!(ModelMessage::system("s").role, ModelRole::System);
        assert_eq!(ModelMessage::user("u").role, ModelRole::User);
        assert_eq!(ModelMessage::assistant("a").role, ModelRole::Assistant);
        assert_eq!(ModelMessage::tool_result("c", "r").role, ModelRole::Tool);
    }

    #[test]
    fn tool_call_is_assistant_role() {
        let m = ModelMessage::tool_call("call_1", "bash", "{}");
        assert_eq!(m.role, ModelRole::Assistant);
        assert!(m.as_text().is_none());
    }

    #[test]
    fn approx_tokens_is_quarter_of_chars() {
        assert_eq!(ModelMessage::user("12345678").approx_tokens(), 2);
        assert_eq!(ModelMessage::user("abc").approx_tokens(), 0);
    }

    #[test]
    fn request_estimate_includes_tool_schemas() {
        let req = CompletionRequest {
            messages: vec![ModelMessage::user("12345678")],
            tools: vec![ToolSchema {
                name: "bash".into(),
                description: "run a command".into(),
                parameters: serde_json::json!({"type": "object"}),
            }],
            ..Default::default()
        };
        assert!(req.approx_tokens() > ModelMessage::user("12345678").approx_tokens());
    }
}
