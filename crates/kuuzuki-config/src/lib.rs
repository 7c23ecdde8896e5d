// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod loader;
mod schema;

pub use loader::{load, permission_from_env, CONFIG_ENV, PERMISSION_ENV};
pub use schema::{
    AgentConfig, CompactionConfig, Config, McpServerConfig, ModeConfig, PermissionAgentOverride,
    PermissionConfig, PermissionDecision, PermissionRule, PermissionRuleSet, ShareMode, TurnConfig,
};
