// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Asynchronous session-title generation.  Dispatched once per session, on
//! its first user message; the turn never waits for it and failures are
//! swallowed.

use std::sync::Arc;

use tracing::debug;

use kuuzuki_model::{CompletionRequest, ModelMessage, Provider};

use crate::compact::{collect_text, strip_thinking};
use crate::App;

const TITLE_PROMPT: &str = "\
Generate a title for this conversation: at most 50 characters, a single \
line, no quotes, no trailing punctuation. Respond with the title only — \
no <think> blocks.";

const TITLE_MAX_CHARS: usize = 50;

/// Fire-and-forget title generation.
pub fn spawn(app: Arc<App>, session_id: String, provider: Arc<dyn Provider>, user_text: String) {
    tokio::spawn(async move {
        if let Err(e) = generate(&app, &session_id, &provider, &user_text).await {
            debug!(session = %session_id, error = %e, "title generation failed");
        }
    });
}

async fn generate(
    app: &App,
    session_id: &str,
    provider: &Arc<dyn Provider>,
    user_text: &str,
) -> anyhow::Result<()> {
    let request = CompletionRequest {
        messages: vec![
            ModelMessage::system(TITLE_PROMPT),
            ModelMessage::user(user_text.to_string()),
        ],
        ..Default::default()
    };
    let stream = provider.stream(request).await?;
    let raw = collect_text(stream).await?;
    let title = clean_title(&raw);
    if title.is_empty() {
        anyhow::bail!("empty title");
    }
    app.sessions
        .update(session_id, |info| info.title = title)
        .await?;
    Ok(())
}

/// Single line, thinking stripped, hard-capped at 50 characters.
fn clean_title(raw: &str) -> String {
    let stripped = strip_thinking(raw);
    let line = stripped.lines().next().unwrap_or("").trim();
    line.chars().take(TITLE_MAX_CHARS).collect::<String>().trim_end().to_string()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
