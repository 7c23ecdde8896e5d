// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// Another turn holds the session lock.
    #[error("session {0} is busy")]
    SessionBusy(String),

    #[error("session {0} not found")]
    SessionNotFound(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
