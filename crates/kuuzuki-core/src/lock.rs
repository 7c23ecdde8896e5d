// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Session lock files — the only cross-process coordination in the engine.
//! A lock under `session/lock/{id}` records the owning pid and its start
//! time; a pid may be recycled by the OS, so liveness requires both the
//! signal-0 probe and a matching start time.  Stale locks (owner dead) are
//! swept on store construction and broken on acquisition.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::CoreError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockFile {
    pub pid: u32,
    /// Process start time from the scheduler, when the platform exposes it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid_start: Option<u64>,
}

impl LockFile {
    fn current() -> Self {
        let pid = std::process::id();
        Self {
            pid,
            pid_start: proc_start_time(pid),
        }
    }
}

/// Held for the duration of one turn; releasing (or dropping) removes the
/// file.
#[derive(Debug)]
pub struct SessionLock {
    path: PathBuf,
    armed: bool,
}

impl SessionLock {
    pub fn release(mut self) {
        self.remove();
    }

    fn remove(&mut self) {
        if self.armed {
            self.armed = false;
            if let Err(e) = std::fs::remove_file(&self.path) {
                if e.kind() != ErrorKind::NotFound {
                    warn!(path = %self.path.display(), error = %e, "failed to remove session lock");
                }
            }
        }
    }
}

impl Drop for SessionLock {
    fn drop(&mut self) {
        self.remove();
    }
}

pub struct LockManager {
    dir: PathBuf,
}

impl LockManager {
    pub fn new(storage_root: &Path) -> anyhow::Result<Self> {
        let dir = storage_root.join("session").join("lock");
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn path_for(&self, session_id: &str) -> PathBuf {
        self.dir.join(session_id)
    }

    /// Take the lock for `session_id`.  A live owner yields `SessionBusy`;
    /// a dead owner's lock is broken and re-acquired.
    pub fn acquire(&self, session_id: &str) -> Result<SessionLock, CoreError> {
        let path = self.path_for(session_id);
        for attempt in 0..2 {
            match std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
            {
                Ok(file) => {
                    serde_json::to_writer(file, &LockFile::current())
                        .map_err(|e| CoreError::Other(e.into()))?;
                    return Ok(SessionLock {
                        path,
                        armed: true,
                    });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    let holder: Option<LockFile> = std::fs::read_to_string(&path)
                        .ok()
                        .and_then(|text| serde_json::from_str(&text).ok());
                    let alive = holder.as_ref().map(owner_alive).unwrap_or(false);
                    if alive {
                        return Err(CoreError::SessionBusy(session_id.to_string()));
                    }
                    debug!(session = session_id, "breaking stale session lock");
                    let _ = std::fs::remove_file(&path);
                    if attempt == 1 {
                        return Err(CoreError::SessionBusy(session_id.to_string()));
                    }
                }
                Err(e) => return Err(CoreError::Other(e.into())),
            }
        }
        Err(CoreError::SessionBusy(session_id.to_string()))
    }

    /// Remove every lock whose owner is dead.  Returns the number removed.
    pub fn sweep(&self) -> usize {
        let mut removed = 0;
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(e) => e,
            Err(_) => return 0,
        };
        for entry in entries.filter_map(Result::ok) {
            let path = entry.path();
            let holder: Option<LockFile> = std::fs::read_to_string(&path)
                .ok()
                .and_then(|text| serde_json::from_str(&text).ok());
            let alive = holder.as_ref().map(owner_alive).unwrap_or(false);
            if !alive && std::fs::remove_file(&path).is_ok() {
                debug!(path = %path.display(), "swept stale session lock");
                removed += 1;
            }
        }
        removed
    }
}

fn owner_alive(lock: &LockFile) -> bool {
    #[cfg(unix)]
    {
        let probe = unsafe { libc::kill(lock.pid as libc::pid_t, 0) };
        if probe != 0 {
            return false;
        }
    }
    // Guard against pid recycling when both start times are known.
    match (lock.pid_start, proc_start_time(lock.pid)) {
        (Some(recorded), Some(current)) => recorded == current,
        _ => true,
    }
}

/// Scheduler start time of `pid` in clock ticks, from `/proc/<pid>/stat`
/// field 22.  `None` on platforms without procfs.
fn proc_start_time(pid: u32) -> Option<u64> {
    let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    // The command field is parenthesized and may contain spaces; fields are
    // counted after the closing paren.
    let after = &stat[stat.rfind(')')? + 1..];
    after.split_whitespace().nth(19)?.parse().ok()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
