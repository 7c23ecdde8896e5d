// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use regex::Regex;

/// Convert a simple shell glob pattern to a [`Regex`].
/// Only `*` (match anything) and `?` (match one char) are supported.
fn glob_to_regex(pattern: &str) -> Option<Regex> {
    let mut re = String::from("^");
    for ch in pattern.chars() {
        match ch {
            '*' => re.push_str(".*"),
            '?' => re.push('.'),
            c => {
                for esc in regex::escape(&c.to_string()).chars() {
                    re.push(esc);
                }
            }
        }
    }
    re.push('$');
    Regex::new(&re).ok()
}

pub fn glob_match(pattern: &str, value: &str) -> bool {
    glob_to_regex(pattern).map(|re| re.is_match(value)).unwrap_or(false)
}

fn wildcard_count(pattern: &str) -> usize {
    pattern.chars().filter(|c| matches!(c, '*' | '?')).count()
}

fn literal_prefix_len(pattern: &str) -> usize {
    pattern
        .chars()
        .take_while(|c| !matches!(c, '*' | '?'))
        .count()
}

/// Pick the most specific matching pattern: fewer wildcards win, then a
/// longer literal prefix, then declaration order.  Returns the index of the
/// winner within `patterns`.
pub fn best_match<'a, I>(patterns: I, value: &str) -> Option<usize>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut best: Option<(usize, usize, usize)> = None; // (wildcards, -prefix, index)
    for (index, pattern) in patterns.into_iter().enumerate() {
        if !glob_match(pattern, value) {
            continue;
        }
        let rank = (
            wildcard_count(pattern),
            usize::MAX - literal_prefix_len(pattern),
            index,
        );
        if best.map(|b| rank < b).unwrap_or(true) {
            best = Some(rank);
        }
    }
    best.map(|(_, _, index)| index)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
