// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::{debug, warn};

use crate::{Config, PermissionConfig};

/// Environment variable holding a JSON permission override.  Takes priority
/// over the config file's `permission` section; invalid JSON is ignored with
/// a warning.
pub const PERMISSION_ENV: &str = "OPENCODE_PERMISSION";

/// Environment variable naming an alternative config file.
pub const CONFIG_ENV: &str = "KUUZUKI_CONFIG";

/// Ordered list of config file locations searched from lowest to highest
/// priority.  Later files override earlier ones.
fn config_search_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();

    // 1. System-wide default
    paths.push(PathBuf::from("/etc/kuuzuki/config.yaml"));
    paths.push(PathBuf::from("/etc/kuuzuki/config.yml"));

    // 2. XDG / home
    if let Some(home) = dirs::home_dir() {
        paths.push(home.join(".config/kuuzuki/config.yaml"));
        paths.push(home.join(".config/kuuzuki/config.yml"));
    }
    if let Some(cfg) = dirs::config_dir() {
        paths.push(cfg.join("kuuzuki/config.yaml"));
        paths.push(cfg.join("kuuzuki/config.yml"));
    }

    // 3. Workspace-local
    paths.push(PathBuf::from(".kuuzuki/config.yaml"));
    paths.push(PathBuf::from(".kuuzuki/config.yml"));
    paths.push(PathBuf::from(".kuuzuki.yaml"));
    paths.push(PathBuf::from(".kuuzuki.yml"));

    // 4. KUUZUKI_CONFIG env override
    if let Ok(p) = std::env::var(CONFIG_ENV) {
        if !p.is_empty() {
            paths.push(PathBuf::from(p));
        }
    }

    paths
}

/// Load configuration by merging all discovered YAML files.
/// The `extra` argument may provide an explicit path (e.g. `--config` CLI flag).
pub fn load(extra: Option<&Path>) -> anyhow::Result<Config> {
    let mut merged = serde_yaml::Value::Mapping(serde_yaml::Mapping::new());

    for path in config_search_paths() {
        if path.is_file() {
            debug!(path = %path.display(), "loading config layer");
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            let layer: serde_yaml::Value = serde_yaml::from_str(&text)
                .with_context(|| format!("parsing {}", path.display()))?;
            merge_yaml(&mut merged, layer);
        }
    }

    if let Some(p) = extra {
        debug!(path = %p.display(), "loading explicit config");
        let text =
            std::fs::read_to_string(p).with_context(|| format!("reading {}", p.display()))?;
        let layer: serde_yaml::Value =
            serde_yaml::from_str(&text).with_context(|| format!("parsing {}", p.display()))?;
        merge_yaml(&mut merged, layer);
    }

    // Deserialize the merged YAML value into Config, falling back to defaults
    // when the merged value is empty (no config files found).
    let config: Config = if matches!(merged, serde_yaml::Value::Mapping(ref m) if m.is_empty()) {
        Config::default()
    } else {
        match serde_yaml::from_value(merged) {
            Ok(cfg) => cfg,
            Err(e) => {
                warn!("malformed config, continuing with defaults: {e}");
                Config::default()
            }
        }
    };
    Ok(config)
}

/// Parse the `OPENCODE_PERMISSION` environment blob, if present and valid.
pub fn permission_from_env() -> Option<PermissionConfig> {
    let raw = std::env::var(PERMISSION_ENV).ok()?;
    if raw.trim().is_empty() {
        return None;
    }
    match serde_json::from_str(&raw) {
        Ok(cfg) => Some(cfg),
        Err(e) => {
            warn!("ignoring invalid {PERMISSION_ENV}: {e}");
            None
        }
    }
}

/// Deep-merge `src` into `dst`; src wins on scalar conflicts.
fn merge_yaml(dst: &mut serde_yaml::Value, src: serde_yaml::Value) {
    match (dst, src) {
        (serde_yaml::Value::Mapping(d), serde_yaml::Value::Mapping(s)) => {
            for (k, v) in s {
                let entry = d
                    .entry(k)
                    .or_insert(serde_yaml::Value::Mapping(serde_yaml::Mapping::new()));
                merge_yaml(entry, v);
            }
        }
        (dst, src) => *dst = src,
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn val(s: &str) -> serde_yaml::Value {
        serde_yaml::from_str(s).unwrap()
    }

    #[test]
    fn merge_scalar_overrides() {
        let mut base = val("model: a/b");
        merge_yaml(&mut base, val("model: c/d"));
        assert_eq!(base["model"], val("c/d"));
    }

    #[test]
    fn merge_is_deep_for_mappings() {
        let mut base = val("mode:\n  plan:\n    prompt: old");
        merge_yaml(&mut base, val("mode:\n  build:\n    prompt: new"));
        assert_eq!(base["mode"]["plan"]["prompt"], val("old"));
        assert_eq!(base["mode"]["build"]["prompt"], val("new"));
    }

    #[test]
    fn merge_replaces_sequences_wholesale() {
        let mut base = val("instructions: [a.md]");
        merge_yaml(&mut base, val("instructions: [b.md]"));
        assert_eq!(base["instructions"], val("[b.md]"));
    }

    #[test]
    fn explicit_config_file_loads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cfg.yaml");
        std::fs::write(&path, "model: mock/echo\nshare: disabled\n").unwrap();

        let cfg = load(Some(&path)).unwrap();
        assert_eq!(cfg.model.as_deref(), Some("mock/echo"));
        assert_eq!(cfg.share, crate::ShareMode::Disabled);
    }

    #[test]
    fn permission_env_parses_object_form() {
        // Env manipulation: run in one test to avoid cross-test races.
        std::env::set_var(PERMISSION_ENV, r#"{"bash": "deny"}"#);
        let parsed = permission_from_env().unwrap();
        match parsed {
            PermissionConfig::Rules(rules) => {
                assert!(rules.rules.contains_key("bash"));
            }
            other => panic!("unexpected {other:?}"),
        }

        std::env::set_var(PERMISSION_ENV, "not json");
        assert!(permission_from_env().is_none());

        std::env::remove_var(PERMISSION_ENV);
        assert!(permission_from_env().is_none());
    }
}
