// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Tool-name resolution.  Models routinely invent plausible-but-wrong tool
//! names (`read_file` for `file_read`, `search` for `grep`); the resolver
//! reconciles them against the registry instead of failing the call.
//! Strategies run in a fixed order; the first hit wins, and an unresolvable
//! name falls back to a synthetic executor that reports the unknown tool and
//! suggests close matches.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::tool::{Tool, ToolContext, ToolResult};

/// Which strategy produced a resolution.  Recorded in the tool part's
/// metadata as `resolved_via`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolvedVia {
    Direct,
    Alias,
    Functional,
    Composite,
    Fallback,
}

impl ResolvedVia {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResolvedVia::Direct => "direct",
            ResolvedVia::Alias => "alias",
            ResolvedVia::Functional => "functional",
            ResolvedVia::Composite => "composite",
            ResolvedVia::Fallback => "fallback",
        }
    }
}

/// Outcome of resolving a requested name.
#[derive(Clone)]
pub struct Resolution {
    pub tool: Arc<dyn Tool>,
    pub via: ResolvedVia,
}

/// Curated alias map: names models are known to use for built-in tools.
/// External servers extend this at registration time (bare tool name →
/// namespaced name).
pub(crate) fn default_aliases() -> Vec<(&'static str, &'static str)> {
    vec![
        ("view", "file_read"),
        ("create_file", "file_write"),
        ("write_to_file", "file_write"),
        ("run_terminal_command", "bash"),
        ("shell", "bash"),
        ("todowrite", "todo_write"),
    ]
}

/// Capability map: a generic verb the model may request → the concrete tool
/// covering that capability.
pub(crate) fn default_functional() -> Vec<(&'static str, &'static str)> {
    vec![
        ("search", "grep"),
        ("find", "glob"),
        ("list", "glob"),
        ("read", "file_read"),
        ("cat", "file_read"),
        ("write", "file_write"),
        ("run", "bash"),
        ("exec", "bash"),
        ("execute", "bash"),
    ]
}

/// True when `requested` is a recombination of `registered`'s underscore
/// fragments (`read_file` ↔ `file_read`).
pub(crate) fn composite_match(requested: &str, registered: &str) -> bool {
    if requested == registered {
        return false;
    }
    let mut a: Vec<&str> = requested.split('_').filter(|s| !s.is_empty()).collect();
    let mut b: Vec<&str> = registered.split('_').filter(|s| !s.is_empty()).collect();
    if a.len() < 2 || a.len() != b.len() {
        return false;
    }
    a.sort_unstable();
    b.sort_unstable();
    a == b
}

/// Classic two-row Levenshtein distance.  Used to rank fallback suggestions.
pub fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut current = vec![0usize; b.len() + 1];

    for (i, ca) in a.iter().enumerate() {
        current[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let substitution = prev[j] + usize::from(ca != cb);
            current[j + 1] = substitution
                .min(prev[j + 1] + 1)
                .min(current[j] + 1);
        }
        std::mem::swap(&mut prev, &mut current);
    }
    prev[b.len()]
}

/// Rank registered names by edit distance to `requested` (≤ 3), then
/// lexicographically.
pub(crate) fn suggestions(requested: &str, names: &[String]) -> Vec<String> {
    let mut ranked: Vec<(usize, &String)> = names
        .iter()
        .filter_map(|name| {
            let d = levenshtein(requested, name);
            (d <= 3).then_some((d, name))
        })
        .collect();
    ranked.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(b.1)));
    ranked.into_iter().map(|(_, name)| name.clone()).collect()
}

/// Synthetic executor for an unresolvable name.  Produces a structured error
/// part explaining the unknown tool without involving the operator, so the
/// model can correct itself on the next step.
pub struct MissingTool {
    requested: String,
    suggestions: Vec<String>,
}

impl MissingTool {
    pub fn new(requested: impl Into<String>, suggestions: Vec<String>) -> Self {
        Self {
            requested: requested.into(),
            suggestions,
        }
    }
}

#[async_trait]
impl Tool for MissingTool {
    fn name(&self) -> &str {
        &self.requested
    }

    fn description(&self) -> &str {
        "synthetic executor for an unknown tool name"
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({ "type": "object" })
    }

    async fn execute(&self, _args: Value, _ctx: &ToolContext) -> anyhow::Result<ToolResult> {
        let mut message = format!("Unknown tool: {}", self.requested);
        if !self.suggestions.is_empty() {
            message.push_str("\nDid you mean: ");
            message.push_str(&self.suggestions.join(", "));
        }
        anyhow::bail!(message)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
