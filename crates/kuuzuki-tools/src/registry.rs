// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use serde_json::Value;
use tracing::debug;

use crate::resolve::{
    composite_match, default_aliases, default_functional, suggestions, MissingTool, Resolution,
    ResolvedVia,
};
use crate::validate::{default_remediations, Remediation};
use crate::Tool;

/// A tool schema as advertised to the model.
#[derive(Debug, Clone)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// Where a registration came from.  External registrations are keyed by
/// their server so a server shutdown removes exactly its tools.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolSource {
    Builtin,
    /// External tool server, by server name.
    External(String),
    Plugin,
}

struct Registered {
    tool: Arc<dyn Tool>,
    source: ToolSource,
}

/// Central registry holding built-in, external and plugin tools, plus the
/// resolution machinery of the five fallback strategies.
pub struct ToolRegistry {
    tools: RwLock<HashMap<String, Registered>>,
    aliases: RwLock<HashMap<String, String>>,
    functional: HashMap<String, String>,
    remediations: HashMap<String, Remediation>,
    /// Per-session resolution memo: (session, requested) → canonical name.
    memo: Mutex<HashMap<(String, String), (String, ResolvedVia)>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: RwLock::new(HashMap::new()),
            aliases: RwLock::new(
                default_aliases()
                    .into_iter()
                    .map(|(a, b)| (a.to_string(), b.to_string()))
                    .collect(),
            ),
            functional: default_functional()
                .into_iter()
                .map(|(a, b)| (a.to_string(), b.to_string()))
                .collect(),
            remediations: default_remediations(),
            memo: Mutex::new(HashMap::new()),
        }
    }

    pub fn register(&self, tool: Arc<dyn Tool>, source: ToolSource) {
        let name = tool.name().to_string();
        debug!(tool = %name, ?source, "registering tool");
        self.tools
            .write()
            .expect("tool table poisoned")
            .insert(name, Registered { tool, source });
    }

    /// Add an alias (`from` → `to`).  Used by external-server registration to
    /// map bare tool names onto their namespaced form.
    pub fn register_alias(&self, from: impl Into<String>, to: impl Into<String>) {
        self.aliases
            .write()
            .expect("alias table poisoned")
            .insert(from.into(), to.into());
    }

    /// Remove every tool registered by `server`, with its aliases.
    pub fn remove_external(&self, server: &str) {
        let source = ToolSource::External(server.to_string());
        let removed: Vec<String> = {
            let mut tools = self.tools.write().expect("tool table poisoned");
            let names: Vec<String> = tools
                .iter()
                .filter(|(_, r)| r.source == source)
                .map(|(n, _)| n.clone())
                .collect();
            for name in &names {
                tools.remove(name);
            }
            names
        };
        if !removed.is_empty() {
            let mut aliases = self.aliases.write().expect("alias table poisoned");
            aliases.retain(|_, target| !removed.contains(target));
            self.memo
                .lock()
                .expect("resolution memo poisoned")
                .retain(|_, (canonical, _)| !removed.contains(canonical));
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools
            .read()
            .expect("tool table poisoned")
            .get(name)
            .map(|r| Arc::clone(&r.tool))
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .tools
            .read()
            .expect("tool table poisoned")
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Schemas for every registered tool, name-sorted for deterministic
    /// request payloads.
    pub fn schemas(&self) -> Vec<ToolSchema> {
        let tools = self.tools.read().expect("tool table poisoned");
        let mut schemas: Vec<ToolSchema> = tools
            .values()
            .map(|r| ToolSchema {
                name: r.tool.name().to_string(),
                description: r.tool.description().to_string(),
                parameters: r.tool.parameters_schema(),
            })
            .collect();
        schemas.sort_by(|a, b| a.name.cmp(&b.name));
        schemas
    }

    /// Schemas filtered by a mode's tool toggles.  A `false` entry disables
    /// the tool; keys may be globs covering whole external servers.
    pub fn schemas_for(&self, toggles: &HashMap<String, bool>) -> Vec<ToolSchema> {
        self.schemas()
            .into_iter()
            .filter(|s| enabled(toggles, &s.name))
            .collect()
    }

    /// Resolve a (possibly misspelled) requested name to an executor.
    ///
    /// Strategies, first hit wins: direct, exact alias, functional
    /// (capability verb), composite (fragment recombination), graceful
    /// fallback.  Successful resolutions are memoized per session.
    pub fn resolve(&self, session_id: &str, requested: &str) -> Resolution {
        let memo_key = (session_id.to_string(), requested.to_string());
        if let Some((canonical, via)) = self
            .memo
            .lock()
            .expect("resolution memo poisoned")
            .get(&memo_key)
            .cloned()
        {
            if let Some(tool) = self.get(&canonical) {
                return Resolution { tool, via };
            }
        }

        let resolved = self.resolve_uncached(requested);
        if let Some((tool, via)) = resolved {
            self.memo
                .lock()
                .expect("resolution memo poisoned")
                .insert(memo_key, (tool.name().to_string(), via));
            return Resolution { tool, via };
        }

        let candidates = suggestions(requested, &self.names());
        debug!(requested, ?candidates, "tool resolution fell back");
        Resolution {
            tool: Arc::new(MissingTool::new(requested, candidates)),
            via: ResolvedVia::Fallback,
        }
    }

    fn resolve_uncached(&self, requested: &str) -> Option<(Arc<dyn Tool>, ResolvedVia)> {
        // 1. Direct
        if let Some(tool) = self.get(requested) {
            return Some((tool, ResolvedVia::Direct));
        }

        // 2. Exact alias
        let alias_target = self
            .aliases
            .read()
            .expect("alias table poisoned")
            .get(requested)
            .cloned();
        if let Some(target) = alias_target {
            if let Some(tool) = self.get(&target) {
                return Some((tool, ResolvedVia::Alias));
            }
        }

        // 3. Functional capability
        if let Some(target) = self.functional.get(requested) {
            if let Some(tool) = self.get(target) {
                return Some((tool, ResolvedVia::Functional));
            }
        }

        // 4. Composite fragment recombination
        let composite = {
            let tools = self.tools.read().expect("tool table poisoned");
            let mut names: Vec<&String> = tools
                .keys()
                .filter(|name| composite_match(requested, name))
                .collect();
            names.sort();
            names.first().map(|n| n.to_string())
        };
        if let Some(name) = composite {
            if let Some(tool) = self.get(&name) {
                return Some((tool, ResolvedVia::Composite));
            }
        }

        None
    }

    /// Apply the registered remediation for `tool`, if any.  Returns true
    /// when the arguments were modified.
    pub fn remediate(&self, tool: &str, args: &mut Value) -> bool {
        match self.remediations.get(tool) {
            Some(remedy) => remedy(args),
            None => false,
        }
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Mode toggle check: the most specific matching key decides; default on.
fn enabled(toggles: &HashMap<String, bool>, name: &str) -> bool {
    if let Some(v) = toggles.get(name) {
        return *v;
    }
    for (key, v) in toggles {
        if key.contains('*') && glob_match(key, name) {
            return *v;
        }
    }
    true
}

/// Minimal glob match supporting `*` spans.  Enough for tool-name toggles;
/// command-pattern matching lives in the permission gate.
fn glob_match(pattern: &str, value: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    let mut rest = value;
    for (i, part) in parts.iter().enumerate() {
        if part.is_empty() {
            continue;
        }
        match rest.find(part) {
            Some(pos) => {
                if i == 0 && pos != 0 {
                    return false;
                }
                rest = &rest[pos + part.len()..];
            }
            None => return false,
        }
    }
    if !pattern.ends_with('*') {
        if let Some(last) = parts.last() {
            if !last.is_empty() && !value.ends_with(last) {
                return false;
            }
        }
    }
    true
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
