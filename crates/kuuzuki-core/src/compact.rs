// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Context compaction: when the estimated prompt would not fit the model's
//! input window (minus a headroom reserve), the older history is summarized
//! by a secondary model call and the summary becomes the session's new
//! context floor.  Compaction never touches the session title.

use std::sync::Arc;

use anyhow::Context;
use futures::StreamExt;
use tracing::debug;

use kuuzuki_config::CompactionConfig;
use kuuzuki_id::{ascending, IdKind};
use kuuzuki_model::{CompletionRequest, EventStream, ModelMessage, Provider, StreamEvent};
use kuuzuki_types::{MessageInfo, Part, PartBody, Role};

use crate::context::{visible_history, StoredMessage};
use crate::{App, CoreError};

const SUMMARIZE_PROMPT: &str = "\
You are a context compaction assistant. Summarise the conversation history \
below in a concise, information-dense way. Preserve technical details, \
decisions, file names, code snippets and tool outputs that matter for \
future work. The summary replaces the original history. \
Respond with the summary only — no preamble and no <think> blocks.";

/// Trigger check: fires when the estimate crosses the threshold share of
/// the window, less the headroom reserved for the model's own output.
pub fn needs_compaction(estimate: usize, window: usize, cfg: &CompactionConfig) -> bool {
    if window == 0 {
        return false;
    }
    let budget = window as f32 * (cfg.threshold - cfg.headroom).max(0.1);
    estimate as f32 >= budget
}

/// Summarize the session's visible history into a new summary message and
/// persist it as the context floor.
pub async fn compact(
    app: &App,
    session_id: &str,
    provider: &Arc<dyn Provider>,
) -> Result<MessageInfo, CoreError> {
    let session = app.sessions.get(session_id).await?;
    let mut history: Vec<StoredMessage> = Vec::new();
    for info in app.sessions.messages(session_id).await? {
        let parts = app.sessions.parts(session_id, &info.id).await?;
        history.push((info, parts));
    }
    let visible = visible_history(&history, session.revert.as_ref());

    // Keep the most recent messages out of the summary; they stay in the
    // window verbatim because the new floor's cut points before them.
    let keep = app.config.compaction.keep_recent.min(visible.len());
    let to_summarize = &visible[..visible.len() - keep];
    if to_summarize.is_empty() {
        return Err(CoreError::Other(anyhow::anyhow!(
            "nothing to compact in session {session_id}"
        )));
    }

    // The cut is the newest message this summary replaces.  An earlier
    // summary in the range contributes what *it* covered, not its own
    // (newer) storage id, so the kept tail stays visible.
    let cut = to_summarize
        .iter()
        .map(|(info, _)| {
            if info.summary {
                info.compacted_through.clone().unwrap_or_else(|| info.id.clone())
            } else {
                info.id.clone()
            }
        })
        .max()
        .expect("non-empty compaction range");

    let transcript = serialize_history(to_summarize);
    let request = CompletionRequest {
        messages: vec![
            ModelMessage::system(SUMMARIZE_PROMPT),
            ModelMessage::user(transcript),
        ],
        ..Default::default()
    };

    let stream = provider
        .stream(request)
        .await
        .context("opening compaction stream")?;
    let summary = strip_thinking(&collect_text(stream).await?);
    if summary.is_empty() {
        return Err(CoreError::Other(anyhow::anyhow!(
            "compaction produced an empty summary"
        )));
    }

    debug!(session = session_id, chars = summary.len(), "writing compaction summary");
    let mut message = MessageInfo::new(ascending(IdKind::Message), session_id, Role::Assistant);
    message.summary = true;
    message.compacted_through = Some(cut);
    message.provider_id = Some(provider.id().to_string());
    message.model_id = Some(provider.model().to_string());
    app.sessions.write_message(&message).await?;
    let part = Part::new(
        ascending(IdKind::Part),
        session_id,
        &message.id,
        PartBody::Text { text: summary },
    );
    app.sessions.write_part(&part).await?;

    Ok(message)
}

/// Flatten stored messages into a plain-text transcript for the summarizer.
fn serialize_history(history: &[&StoredMessage]) -> String {
    let mut out = String::new();
    for (info, parts) in history {
        let role = match info.role {
            Role::User => "user",
            Role::Assistant => "assistant",
        };
        for part in parts {
            match &part.body {
                PartBody::Text { text } if !text.is_empty() => {
                    out.push_str(&format!("[{role}] {text}\n"));
                }
                PartBody::Tool {
                    tool, state: kuuzuki_types::ToolState::Completed { output, .. }, ..
                } => {
                    out.push_str(&format!("[tool {tool}] {output}\n"));
                }
                PartBody::Tool {
                    tool, state: kuuzuki_types::ToolState::Error { error, .. }, ..
                } => {
                    out.push_str(&format!("[tool {tool} error] {error}\n"));
                }
                _ => {}
            }
        }
    }
    out
}

/// Drain a stream, concatenating text deltas until it finishes.
pub(crate) async fn collect_text(mut stream: EventStream) -> anyhow::Result<String> {
    let mut out = String::new();
    while let Some(event) = stream.next().await {
        match event? {
            StreamEvent::TextDelta(delta) => out.push_str(&delta),
            StreamEvent::Finish { .. } => break,
            _ => {}
        }
    }
    Ok(out)
}

/// Remove `<think>…</think>` spans.  Some serving layers leak the model's
/// reasoning into the text stream; summaries and titles must never carry it.
pub fn strip_thinking(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    loop {
        match rest.find("<think>") {
            None => {
                out.push_str(rest);
                break;
            }
            Some(start) => {
                out.push_str(&rest[..start]);
                let after = &rest[start + "<think>".len()..];
                match after.find("</think>") {
                    Some(end) => rest = &after[end + "</think>".len()..],
                    // Unclosed block (truncated output): drop the remainder.
                    None => break,
                }
            }
        }
    }
    out.trim().to_string()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
