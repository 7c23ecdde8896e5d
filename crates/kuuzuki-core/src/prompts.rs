// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use tracing::warn;

use kuuzuki_config::Config;

/// Base system prompt used when the active mode does not override it.
const BASE_PROMPT: &str = "\
You are kuuzuki, a terminal-based coding assistant.\n\
Work directly on the user's project with the provided tools.\n\
Prefer tools over guessing: read files before editing them, run commands to\n\
verify behavior, and keep responses concise.\n\
Never invent file contents or command output.";

/// Assemble the system prompt blocks for a turn: the agent prompt, else the
/// mode prompt, else the base prompt — then any configured instruction
/// files.
pub fn system_prompts(config: &Config, agent: Option<&str>, mode: Option<&str>) -> Vec<String> {
    let mut blocks = Vec::new();

    let agent_prompt = agent
        .and_then(|name| config.agent.get(name))
        .and_then(|a| a.prompt.clone());
    let mode_prompt = mode
        .and_then(|name| config.mode.get(name))
        .and_then(|m| m.prompt.clone());
    blocks.push(
        agent_prompt
            .or(mode_prompt)
            .unwrap_or_else(|| BASE_PROMPT.to_string()),
    );

    for path in &config.instructions {
        match std::fs::read_to_string(path) {
            Ok(text) if !text.trim().is_empty() => blocks.push(text),
            Ok(_) => {}
            Err(e) => warn!(path = %path.display(), error = %e, "skipping instruction file"),
        }
    }

    blocks
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
