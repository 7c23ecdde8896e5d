// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Context-window assembly: project stored messages and parts into the
//! provider-facing message list.  Two filters apply, in order: the revert
//! anchor hides everything at or after it, and the latest compaction
//! summary becomes the context floor — the model sees the summary plus
//! whatever came after it.

use kuuzuki_model::ModelMessage;
use kuuzuki_types::{MessageInfo, Part, PartBody, RevertAnchor, Role, ToolState};

pub type StoredMessage = (MessageInfo, Vec<Part>);

/// The history the model may see, in render order.
///
/// The revert anchor truncates first.  Then, if a compaction summary
/// exists, the latest one opens the context and only messages newer than
/// its recorded cut follow it — the summary stands in for everything it
/// covers, even though its storage id is newer than the tail it precedes
/// logically.
pub fn visible_history<'a>(
    history: &'a [StoredMessage],
    revert: Option<&RevertAnchor>,
) -> Vec<&'a StoredMessage> {
    let mut slice = history;
    if let Some(anchor) = revert {
        if let Some(pos) = slice
            .iter()
            .position(|(info, _)| info.id >= anchor.message_id)
        {
            slice = &slice[..pos];
        }
    }

    let Some(floor) = slice.iter().rposition(|(info, _)| info.summary) else {
        return slice.iter().collect();
    };
    let summary = &slice[floor];
    // Default cut: the summary covers everything older than itself.
    let cut = summary
        .0
        .compacted_through
        .clone()
        .unwrap_or_else(|| summary.0.id.clone());

    let mut visible = vec![summary];
    visible.extend(
        slice
            .iter()
            .filter(|(info, _)| !info.summary && info.id > cut),
    );
    visible
}

/// Build the provider message list: system prompts, then the visible
/// history rendered message by message.
pub fn build_context(
    system: &[String],
    history: &[StoredMessage],
    revert: Option<&RevertAnchor>,
) -> Vec<ModelMessage> {
    let mut out = Vec::new();
    for block in system {
        out.push(ModelMessage::system(block.clone()));
    }
    for (info, parts) in visible_history(history, revert) {
        render_message(info, parts, &mut out);
    }
    out
}

pub fn estimate_tokens(messages: &[ModelMessage]) -> usize {
    messages.iter().map(ModelMessage::approx_tokens).sum()
}

fn render_message(info: &MessageInfo, parts: &[Part], out: &mut Vec<ModelMessage>) {
    match info.role {
        Role::User => {
            let mut text = String::new();
            for part in parts {
                match &part.body {
                    PartBody::Text { text: t } => {
                        if !text.is_empty() {
                            text.push('\n');
                        }
                        text.push_str(t);
                    }
                    PartBody::File {
                        mime,
                        filename,
                        url,
                        ..
                    } => {
                        if !text.is_empty() {
                            text.push('\n');
                        }
                        let name = filename.as_deref().or(url.as_deref()).unwrap_or("attachment");
                        text.push_str(&format!("[file: {name} ({mime})]"));
                    }
                    _ => {}
                }
            }
            if !text.is_empty() {
                out.push(ModelMessage::user(text));
            }
        }
        Role::Assistant => {
            for part in parts {
                match &part.body {
                    PartBody::Text { text } => {
                        if !text.is_empty() {
                            out.push(ModelMessage::assistant(text.clone()));
                        }
                    }
                    PartBody::Tool {
                        call_id, state, ..
                    } => render_tool(call_id, state, out),
                    // Reasoning is never replayed; step markers and
                    // snapshots carry no model-facing content.
                    _ => {}
                }
            }
        }
    }
}

fn render_tool(call_id: &str, state: &ToolState, out: &mut Vec<ModelMessage>) {
    match state {
        ToolState::Completed { input, output, .. } => {
            out.push(ModelMessage::tool_call(
                call_id,
                "tool",
                input.to_string(),
            ));
            out.push(ModelMessage::tool_result(call_id, output.clone()));
        }
        ToolState::Error { input, error, .. } => {
            out.push(ModelMessage::tool_call(
                call_id,
                "tool",
                input.to_string(),
            ));
            out.push(ModelMessage::tool_result(
                call_id,
                format!("Error: {error}"),
            ));
        }
        // A pending or running call without a terminal state means the turn
        // was interrupted; there is no result to replay.
        ToolState::Pending | ToolState::Running { .. } => {}
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
