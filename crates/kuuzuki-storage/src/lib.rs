// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! File-backed JSON key/value store.  Keys are `/`-separated path fragments
//! mapped to `<root>/<key>.json`; writes go through a temp-file + rename so a
//! reader never observes a torn value.  Every write publishes a
//! `storage.write` event.  A migration register versions the on-disk layout;
//! opening a store written by a newer binary is a hard refusal.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info};
use walkdir::WalkDir;

use kuuzuki_bus::{Bus, Event};

/// Highest storage layout version this binary understands.
pub const STORAGE_VERSION: u32 = 1;

/// Meta file (relative to the root) recording the applied layout version.
const VERSION_KEY: &str = "migration";

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("storage layout version {found} is newer than supported version {supported}")]
    FutureVersion { found: u32, supported: u32 },
    #[error("invalid storage key: {0}")]
    InvalidKey(String),
}

/// One idempotent layout migration.  Runs at most once per data directory;
/// the register records the highest applied version.
type Migration = fn(&Path) -> anyhow::Result<()>;

/// Registered migrations, ascending by version.  Version 1 is the initial
/// layout and needs no transformation.
const MIGRATIONS: &[(u32, Migration)] = &[];

#[derive(Debug)]
pub struct Storage {
    root: PathBuf,
    bus: Arc<Bus>,
}

impl Storage {
    /// Open (and if needed create) the store at `root`, running any pending
    /// migrations.  Refuses a layout written by a newer binary.
    pub fn open(root: impl Into<PathBuf>, bus: Arc<Bus>) -> anyhow::Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)
            .with_context(|| format!("creating storage root {}", root.display()))?;

        let version_path = root.join(VERSION_KEY);
        let found: u32 = match std::fs::read_to_string(&version_path) {
            Ok(text) => text.trim().parse().unwrap_or(0),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => return Err(e).context("reading storage version"),
        };

        if found > STORAGE_VERSION {
            return Err(StorageError::FutureVersion {
                found,
                supported: STORAGE_VERSION,
            }
            .into());
        }

        for (version, migrate) in MIGRATIONS {
            if *version > found {
                info!(version, "applying storage migration");
                migrate(&root).with_context(|| format!("storage migration v{version}"))?;
            }
        }

        if found < STORAGE_VERSION {
            std::fs::write(&version_path, STORAGE_VERSION.to_string())
                .context("recording storage version")?;
        }

        Ok(Self { root, bus })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve `key` to its backing file, rejecting traversal fragments.
    fn path_for(&self, key: &str) -> Result<PathBuf, StorageError> {
        if key.is_empty() {
            return Err(StorageError::InvalidKey(key.into()));
        }
        let mut path = self.root.clone();
        for fragment in key.split('/') {
            if fragment.is_empty() || fragment == "." || fragment == ".." {
                return Err(StorageError::InvalidKey(key.into()));
            }
            path.push(fragment);
        }
        path.set_extension("json");
        Ok(path)
    }

    pub async fn read_json<T: DeserializeOwned>(&self, key: &str) -> anyhow::Result<Option<T>> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let value = serde_json::from_slice(&bytes)
                    .with_context(|| format!("parsing {}", path.display()))?;
                Ok(Some(value))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("reading {}", path.display())),
        }
    }

    /// Atomic write: serialize to a `.tmp` sibling, rename into place,
    /// publish `storage.write`.
    pub async fn write_json<T: Serialize>(&self, key: &str, value: &T) -> anyhow::Result<()> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let bytes = serde_json::to_vec_pretty(value).context("serializing value")?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &bytes)
            .await
            .with_context(|| format!("writing {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("renaming into {}", path.display()))?;
        debug!(key, "storage write");
        self.bus
            .publish(Event::StorageWrite { key: key.to_string() })
            .await;
        Ok(())
    }

    /// All keys under `prefix`, sorted.  A key's sort order equals the
    /// creation order of id-named records, so listings double as timelines.
    pub async fn list(&self, prefix: &str) -> anyhow::Result<Vec<String>> {
        let dir = self.path_for(prefix)?.with_extension("");
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let root = self.root.clone();
        let keys = tokio::task::spawn_blocking(move || {
            let mut keys = Vec::new();
            for entry in WalkDir::new(&dir).into_iter().filter_map(Result::ok) {
                if !entry.file_type().is_file() {
                    continue;
                }
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                if let Ok(rel) = path.strip_prefix(&root) {
                    let mut key = rel.to_string_lossy().replace('\\', "/");
                    key.truncate(key.len() - ".json".len());
                    keys.push(key);
                }
            }
            keys.sort();
            keys
        })
        .await
        .context("listing storage prefix")?;
        Ok(keys)
    }

    pub async fn remove(&self, key: &str) -> anyhow::Result<()> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("removing {}", path.display())),
        }
    }

    /// Remove every key under `prefix`.
    pub async fn remove_prefix(&self, prefix: &str) -> anyhow::Result<()> {
        let dir = self.path_for(prefix)?.with_extension("");
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("removing {}", dir.display())),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn store() -> (tempfile::TempDir, Storage) {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(dir.path().join("data"), Bus::new()).unwrap();
        (dir, storage)
    }

    #[tokio::test]
    async fn write_then_read_roundtrips() {
        let (_dir, s) = store();
        s.write_json("session/info/abc", &json!({"id": "abc"}))
            .await
            .unwrap();
        let v: Option<serde_json::Value> = s.read_json("session/info/abc").await.unwrap();
        assert_eq!(v.unwrap()["id"], "abc");
    }

    #[tokio::test]
    async fn read_missing_key_is_none() {
        let (_dir, s) = store();
        let v: Option<serde_json::Value> = s.read_json("nope/nothing").await.unwrap();
        assert!(v.is_none());
    }

    #[tokio::test]
    async fn overwrite_replaces_value() {
        let (_dir, s) = store();
        s.write_json("k", &json!(1)).await.unwrap();
        s.write_json("k", &json!(2)).await.unwrap();
        let v: Option<serde_json::Value> = s.read_json("k").await.unwrap();
        assert_eq!(v.unwrap(), json!(2));
    }

    #[tokio::test]
    async fn list_returns_sorted_keys_under_prefix() {
        let (_dir, s) = store();
        s.write_json("session/message/s1/m2", &json!({})).await.unwrap();
        s.write_json("session/message/s1/m1", &json!({})).await.unwrap();
        s.write_json("session/info/s1", &json!({})).await.unwrap();

        let keys = s.list("session/message/s1").await.unwrap();
        assert_eq!(
            keys,
            vec!["session/message/s1/m1", "session/message/s1/m2"]
        );
    }

    #[tokio::test]
    async fn list_unknown_prefix_is_empty() {
        let (_dir, s) = store();
        assert!(s.list("missing").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let (_dir, s) = store();
        s.write_json("a/b", &json!(true)).await.unwrap();
        s.remove("a/b").await.unwrap();
        s.remove("a/b").await.unwrap();
        let v: Option<bool> = s.read_json("a/b").await.unwrap();
        assert!(v.is_none());
    }

    #[tokio::test]
    async fn remove_prefix_deletes_subtree() {
        let (_dir, s) = store();
        s.write_json("session/part/s1/m1/p1", &json!({})).await.unwrap();
        s.write_json("session/part/s1/m1/p2", &json!({})).await.unwrap();
        s.remove_prefix("session/part/s1").await.unwrap();
        assert!(s.list("session/part/s1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn traversal_keys_are_rejected() {
        let (_dir, s) = store();
        assert!(s.write_json("../evil", &json!(1)).await.is_err());
        assert!(s.write_json("a//b", &json!(1)).await.is_err());
        assert!(s.write_json("", &json!(1)).await.is_err());
    }

    #[tokio::test]
    async fn writes_publish_storage_write_events() {
        let dir = tempfile::tempdir().unwrap();
        let bus = Bus::new();
        let mut tap = bus.tap();
        let s = Storage::open(dir.path().join("data"), Arc::clone(&bus)).unwrap();

        s.write_json("x/y", &json!(1)).await.unwrap();

        let env = tap.recv().await.unwrap();
        match env.event {
            Event::StorageWrite { key } => assert_eq!(key, "x/y"),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn future_version_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("data");
        std::fs::create_dir_all(&root).unwrap();
        std::fs::write(root.join("migration"), "999").unwrap();

        let err = Storage::open(&root, Bus::new()).unwrap_err();
        assert!(err.to_string().contains("newer than supported"));
    }

    #[test]
    fn open_records_current_version() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("data");
        Storage::open(&root, Bus::new()).unwrap();
        let recorded = std::fs::read_to_string(root.join("migration")).unwrap();
        assert_eq!(recorded.trim(), STORAGE_VERSION.to_string());
    }
}
