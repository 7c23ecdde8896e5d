// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! External tool-server (MCP) client manager.
//!
//! Local servers are child processes speaking newline-delimited JSON-RPC 2.0
//! on stdio; remote servers speak JSON-RPC over streaming HTTP with a
//! server-sent-events fallback.  The manager consumes exactly two methods —
//! `tools/list` and `tools/call` — plus the `initialize` handshake, and
//! surfaces each enumerated tool to the registry as a namespaced
//! [`kuuzuki_tools::Tool`] adapter.

mod adapter;
mod local;
mod manager;
mod remote;
mod sanitize;
mod wire;

pub use adapter::McpTool;
pub use manager::{McpManager, ServerHandle, START_TIMEOUT};
pub use sanitize::{qualified_tool_name, sanitize_name};
pub use wire::ToolDef;
