// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! External tool names arrive in whatever shape the server chose
//! (`kb.read`, `Search-Docs`, `fetch url`).  They are normalized to the
//! `[a-z0-9_]` alphabet and namespaced with the (equally sanitized) server
//! name so two servers can expose the same tool without colliding.

/// Lowercase, map everything outside `[a-z0-9_]` to `_`, collapse `_` runs,
/// strip leading/trailing `_`.
pub fn sanitize_name(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut last_was_underscore = false;
    for c in raw.chars() {
        let c = c.to_ascii_lowercase();
        let mapped = if c.is_ascii_lowercase() || c.is_ascii_digit() {
            Some(c)
        } else {
            Some('_')
        };
        if let Some(m) = mapped {
            if m == '_' {
                if last_was_underscore {
                    continue;
                }
                last_was_underscore = true;
            } else {
                last_was_underscore = false;
            }
            out.push(m);
        }
    }
    out.trim_matches('_').to_string()
}

/// Namespaced registry name: `<sanitized-server>_<sanitized-tool>`.
pub fn qualified_tool_name(server: &str, tool: &str) -> String {
    format!("{}_{}", sanitize_name(server), sanitize_name(tool))
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lowercases_and_replaces_punctuation() {
        assert_eq!(sanitize_name("Search-Docs"), "search_docs");
        assert_eq!(sanitize_name("kb.read"), "kb_read");
        assert_eq!(sanitize_name("fetch url"), "fetch_url");
    }

    #[test]
    fn collapses_underscore_runs() {
        assert_eq!(sanitize_name("a--b__c"), "a_b_c");
    }

    #[test]
    fn strips_leading_and_trailing_underscores() {
        assert_eq!(sanitize_name("_private_"), "private");
        assert_eq!(sanitize_name("--x--"), "x");
    }

    #[test]
    fn already_clean_names_pass_through() {
        assert_eq!(sanitize_name("kb_read"), "kb_read");
    }

    #[test]
    fn qualification_prefixes_the_server() {
        assert_eq!(qualified_tool_name("kb-mcp", "kb.read"), "kb_mcp_kb_read");
    }
}
