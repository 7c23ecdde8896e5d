// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::path::Path;

use serde::{Deserialize, Serialize};

use kuuzuki_types::now_ms;

/// Discovery record for local UI processes, stored as `server-info` in the
/// data directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerInfo {
    pub port: u16,
    pub hostname: String,
    pub pid: u32,
    pub start_time: i64,
}

impl ServerInfo {
    pub fn current(hostname: &str, port: u16) -> Self {
        Self {
            port,
            hostname: hostname.to_string(),
            pid: std::process::id(),
            start_time: now_ms(),
        }
    }

    /// Atomic replace: write a temp sibling, then rename over the target.
    pub fn write(&self, dir: &Path) -> anyhow::Result<()> {
        let path = dir.join("server-info");
        let tmp = dir.join("server-info.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(self)?)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    pub fn read(dir: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(dir.join("server-info"))?;
        Ok(serde_json::from_str(&text)?)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
