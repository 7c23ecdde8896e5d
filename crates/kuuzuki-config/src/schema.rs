// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::path::PathBuf;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Serde default helper — returns `true`.
///
/// `#[serde(default)]` on a `bool` falls back to `false`, so fields that
/// should be enabled unless explicitly disabled need a named function.
fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Default model as `"<provider>/<model>"`.
    pub model: Option<String>,
    /// Named modes: a mode bundles a system prompt, a tool allow-list and an
    /// optional model override.
    #[serde(default)]
    pub mode: HashMap<String, ModeConfig>,
    /// Specialized sub-assistants invocable as tools.
    #[serde(default)]
    pub agent: HashMap<String, AgentConfig>,
    /// External tool servers, keyed by server name.
    #[serde(default)]
    pub mcp: HashMap<String, McpServerConfig>,
    /// Permission policy; `None` means allow everything.
    #[serde(default)]
    pub permission: Option<PermissionConfig>,
    #[serde(default)]
    pub share: ShareMode,
    /// Extra instruction files prepended to the system prompt.
    #[serde(default)]
    pub instructions: Vec<PathBuf>,
    #[serde(default)]
    pub compaction: CompactionConfig,
    #[serde(default)]
    pub turn: TurnConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModeConfig {
    pub model: Option<String>,
    pub prompt: Option<String>,
    /// Tool toggles.  A `false` entry removes the tool from the mode; keys
    /// may be globs (useful for whole external servers, e.g. `"docs_*": false`).
    #[serde(default)]
    pub tools: HashMap<String, bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default)]
    pub description: String,
    pub model: Option<String>,
    pub prompt: Option<String>,
    #[serde(default)]
    pub tools: HashMap<String, bool>,
}

/// One external tool-server entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum McpServerConfig {
    /// Child process speaking JSON-RPC on stdio.
    Local {
        command: Vec<String>,
        #[serde(default)]
        environment: HashMap<String, String>,
        #[serde(default = "default_true")]
        enabled: bool,
    },
    /// Streaming-HTTP endpoint with an SSE fallback.
    Remote {
        url: String,
        #[serde(default)]
        headers: HashMap<String, String>,
        #[serde(default = "default_true")]
        enabled: bool,
    },
}

impl McpServerConfig {
    pub fn enabled(&self) -> bool {
        match self {
            McpServerConfig::Local { enabled, .. } => *enabled,
            McpServerConfig::Remote { enabled, .. } => *enabled,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShareMode {
    #[default]
    Manual,
    Auto,
    Disabled,
}

/// Compaction tuning.  Trigger fires when the estimated prompt exceeds
/// `threshold` of the model context window; the summary call keeps
/// `headroom` of the window free for its own output.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CompactionConfig {
    #[serde(default = "CompactionConfig::default_threshold")]
    pub threshold: f32,
    #[serde(default = "CompactionConfig::default_headroom")]
    pub headroom: f32,
    /// Most recent messages always kept verbatim across a compaction.
    #[serde(default = "CompactionConfig::default_keep_recent")]
    pub keep_recent: usize,
}

impl CompactionConfig {
    fn default_threshold() -> f32 {
        0.85
    }
    fn default_headroom() -> f32 {
        0.10
    }
    fn default_keep_recent() -> usize {
        6
    }
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            threshold: Self::default_threshold(),
            headroom: Self::default_headroom(),
            keep_recent: Self::default_keep_recent(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TurnConfig {
    /// Maximum stream restarts for retryable provider errors.
    #[serde(default = "TurnConfig::default_max_retries")]
    pub max_retries: u32,
    /// Hard cap on model steps (stream calls) within one turn.
    #[serde(default = "TurnConfig::default_max_steps")]
    pub max_steps: u32,
}

impl TurnConfig {
    fn default_max_retries() -> u32 {
        3
    }
    fn default_max_steps() -> u32 {
        50
    }
}

impl Default for TurnConfig {
    fn default() -> Self {
        Self {
            max_retries: Self::default_max_retries(),
            max_steps: Self::default_max_steps(),
        }
    }
}

// ─── Permission configuration ─────────────────────────────────────────────────

/// The permission section has two top-level shapes: a bare list of glob
/// patterns (any match means "ask"), or the richer per-tool object.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum PermissionConfig {
    Patterns(Vec<String>),
    Rules(PermissionRuleSet),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionDecision {
    Ask,
    Allow,
    Deny,
}

/// A tool entry is either a flat decision or, for pattern-based tools
/// (notably the shell tool), a `{pattern → decision}` map.  Map declaration
/// order is significant: it breaks specificity ties.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum PermissionRule {
    Decision(PermissionDecision),
    Patterns(IndexMap<String, PermissionDecision>),
}

/// The object form of the permission section.
///
/// `rules` collects the per-tool entries; `tools` is an optional wildcard
/// map matched against tool names; `agents` carries per-agent overrides that
/// win over the top-level rules.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PermissionRuleSet {
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub tools: IndexMap<String, PermissionDecision>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub agents: HashMap<String, PermissionAgentOverride>,
    #[serde(flatten)]
    pub rules: IndexMap<String, PermissionRule>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PermissionAgentOverride {
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub tools: IndexMap<String, PermissionDecision>,
    #[serde(flatten)]
    pub rules: IndexMap<String, PermissionRule>,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let cfg: Config = serde_yaml::from_str("{}").unwrap();
        assert!(cfg.model.is_none());
        assert_eq!(cfg.share, ShareMode::Manual);
        assert_eq!(cfg.compaction.threshold, 0.85);
        assert_eq!(cfg.turn.max_retries, 3);
    }

    #[test]
    fn mcp_local_entry_parses() {
        let yaml = r#"
mcp:
  kb:
    type: local
    command: ["node", "kb.js"]
    environment:
      KB_ROOT: /tmp/kb
"#;
        let cfg: Config = serde_yaml::from_str(yaml).unwrap();
        match &cfg.mcp["kb"] {
            McpServerConfig::Local {
                command,
                environment,
                enabled,
            } => {
                assert_eq!(command, &["node", "kb.js"]);
                assert_eq!(environment["KB_ROOT"], "/tmp/kb");
                assert!(*enabled);
            }
            other => panic!("expected local server, got {other:?}"),
        }
    }

    #[test]
    fn mcp_remote_disabled_entry_parses() {
        let yaml = r#"
mcp:
  docs:
    type: remote
    url: https://example.com/mcp
    enabled: false
"#;
        let cfg: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(!cfg.mcp["docs"].enabled());
    }

    #[test]
    fn permission_pattern_list_form_parses() {
        let json = r#"{"permission": ["git *", "rm *"]}"#;
        let cfg: Config = serde_json::from_str(json).unwrap();
        match cfg.permission.unwrap() {
            PermissionConfig::Patterns(p) => assert_eq!(p, vec!["git *", "rm *"]),
            other => panic!("expected pattern list, got {other:?}"),
        }
    }

    #[test]
    fn permission_object_form_parses_nested_patterns() {
        let json = r#"{"permission": {"bash": {"git *": "ask", "rm *": "deny"}, "file_read": "allow"}}"#;
        let cfg: Config = serde_json::from_str(json).unwrap();
        let rules = match cfg.permission.unwrap() {
            PermissionConfig::Rules(r) => r,
            other => panic!("expected object form, got {other:?}"),
        };
        match &rules.rules["bash"] {
            PermissionRule::Patterns(map) => {
                assert_eq!(map["git *"], PermissionDecision::Ask);
                assert_eq!(map["rm *"], PermissionDecision::Deny);
                // Declaration order survives parsing.
                let keys: Vec<_> = map.keys().collect();
                assert_eq!(keys, ["git *", "rm *"]);
            }
            other => panic!("expected patterns, got {other:?}"),
        }
        assert_eq!(
            rules.rules["file_read"],
            PermissionRule::Decision(PermissionDecision::Allow)
        );
    }

    #[test]
    fn permission_tools_wildcard_and_agents_parse() {
        let json = r#"{"permission": {
            "tools": {"docs_*": "deny"},
            "agents": {"reviewer": {"bash": "deny"}}
        }}"#;
        let cfg: Config = serde_json::from_str(json).unwrap();
        let rules = match cfg.permission.unwrap() {
            PermissionConfig::Rules(r) => r,
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(rules.tools["docs_*"], PermissionDecision::Deny);
        assert_eq!(
            rules.agents["reviewer"].rules["bash"],
            PermissionRule::Decision(PermissionDecision::Deny)
        );
    }

    #[test]
    fn mode_tools_toggles_parse() {
        let yaml = r#"
mode:
  plan:
    prompt: "You are planning."
    tools:
      bash: false
      file_write: false
"#;
        let cfg: Config = serde_yaml::from_str(yaml).unwrap();
        let plan = &cfg.mode["plan"];
        assert_eq!(plan.tools["bash"], false);
        assert_eq!(plan.prompt.as_deref(), Some("You are planning."));
    }
}
