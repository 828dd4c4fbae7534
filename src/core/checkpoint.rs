//! Durable, append-only record of finalized rows.
//!
//! Layout inside the checkpoint directory:
//! - `checkpoint.jsonl`: one [`CheckpointEntry`] per finalized row
//! - `checkpoint.manifest.json`: shape of the source table at first run
//! - `checkpoint.lock`: held exclusively (fs2) while the store is open
//!
//! Entries are only ever appended. A torn final line left by a crash is
//! truncated on open; every complete entry survives.

use std::collections::{HashMap, HashSet};
use std::io::{Read, Seek};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::domain::{RowKey, RowOutcome, Table};

const ENTRIES_FILE: &str = "checkpoint.jsonl";
const MANIFEST_FILE: &str = "checkpoint.manifest.json";
const LOCK_FILE: &str = "checkpoint.lock";

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("Checkpoint I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Corrupt checkpoint entry at {path}:{line}: {source}")]
    Corrupt {
        path: PathBuf,
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to serialize checkpoint data: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Checkpoint at {0} is in use by another process")]
    Locked(PathBuf),

    #[error("Source table changed since checkpoint was created: {0}")]
    SourceChanged(String),
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> CheckpointError + '_ {
    move |source| CheckpointError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// One finalized row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointEntry {
    pub key: RowKey,
    pub recorded_at: DateTime<Utc>,

    /// Present when the store keeps outcomes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<RowOutcome>,
}

/// Shape of the source table the checkpoint was started against
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceManifest {
    pub row_count: usize,

    /// SHA-256 over the sorted row keys
    pub key_digest: String,
}

impl SourceManifest {
    pub fn from_table(table: &Table) -> Self {
        let mut keys: Vec<&str> = table.rows.iter().map(|r| r.key.as_str()).collect();
        keys.sort_unstable();

        let mut hasher = Sha256::new();
        for key in keys {
            hasher.update(key.as_bytes());
            hasher.update(b"\n");
        }

        Self {
            row_count: table.len(),
            key_digest: hex::encode(hasher.finalize()),
        }
    }
}

/// Result of comparing a table against the stored manifest
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceCheck {
    /// No prior manifest; one was written
    Recorded,
    Unchanged,
    /// Mismatch tolerated because enforcement is off
    Changed,
}

/// Append-only checkpoint store shared by every worker of a cycle
pub struct CheckpointStore {
    dir: PathBuf,
    entries_path: PathBuf,
    manifest_path: PathBuf,
    store_outcomes: bool,

    /// Append handle. Writers hold the write lock; loads hold the read lock.
    file: RwLock<File>,

    /// Keeps the fs2 lock alive for the store's lifetime
    _lock: std::fs::File,
}

impl CheckpointStore {
    /// Open (or create) the checkpoint in `dir`
    pub async fn open(dir: &Path, store_outcomes: bool) -> Result<Self, CheckpointError> {
        fs::create_dir_all(dir).await.map_err(io_err(dir))?;

        let lock_path = dir.join(LOCK_FILE);
        let lock = std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)
            .map_err(io_err(&lock_path))?;
        lock.try_lock_exclusive()
            .map_err(|_| CheckpointError::Locked(dir.to_path_buf()))?;

        let entries_path = dir.join(ENTRIES_FILE);
        Self::repair_torn_tail(&entries_path)?;

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&entries_path)
            .await
            .map_err(io_err(&entries_path))?;

        debug!(path = %entries_path.display(), "Checkpoint store opened");

        Ok(Self {
            dir: dir.to_path_buf(),
            manifest_path: dir.join(MANIFEST_FILE),
            entries_path,
            store_outcomes,
            file: RwLock::new(file),
            _lock: lock,
        })
    }

    /// Drop a trailing partial line left by a crash mid-append
    fn repair_torn_tail(path: &Path) -> Result<(), CheckpointError> {
        let mut file = match std::fs::OpenOptions::new().read(true).write(true).open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(io_err(path)(e)),
        };

        let mut content = Vec::new();
        file.read_to_end(&mut content).map_err(io_err(path))?;
        if content.is_empty() || content.ends_with(b"\n") {
            return Ok(());
        }

        let keep = content
            .iter()
            .rposition(|b| *b == b'\n')
            .map(|p| p + 1)
            .unwrap_or(0);
        warn!(
            path = %path.display(),
            dropped_bytes = content.len() - keep,
            "Truncating torn checkpoint entry"
        );
        file.set_len(keep as u64).map_err(io_err(path))?;
        file.rewind().map_err(io_err(path))?;
        Ok(())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn entries_path(&self) -> &Path {
        &self.entries_path
    }

    pub fn stores_outcomes(&self) -> bool {
        self.store_outcomes
    }

    /// All entries, latest entry per key winning
    pub async fn load_entries(&self) -> Result<HashMap<RowKey, CheckpointEntry>, CheckpointError> {
        let _guard = self.file.read().await;

        let content = match fs::read_to_string(&self.entries_path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(io_err(&self.entries_path)(e)),
        };

        let mut entries = HashMap::new();
        for (idx, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let entry: CheckpointEntry =
                serde_json::from_str(line).map_err(|source| CheckpointError::Corrupt {
                    path: self.entries_path.clone(),
                    line: idx + 1,
                    source,
                })?;
            entries.insert(entry.key.clone(), entry);
        }

        Ok(entries)
    }

    /// Keys of every finalized row
    pub async fn load(&self) -> Result<HashSet<RowKey>, CheckpointError> {
        Ok(self.load_entries().await?.into_keys().collect())
    }

    /// Append one finalized row. Called exactly once per row outcome.
    pub async fn record(&self, outcome: &RowOutcome) -> Result<(), CheckpointError> {
        let entry = CheckpointEntry {
            key: outcome.key.clone(),
            recorded_at: Utc::now(),
            outcome: self.store_outcomes.then(|| outcome.clone()),
        };
        let mut line = serde_json::to_string(&entry)?;
        line.push('\n');

        let mut file = self.file.write().await;
        file.write_all(line.as_bytes())
            .await
            .map_err(io_err(&self.entries_path))?;
        file.flush().await.map_err(io_err(&self.entries_path))?;
        file.sync_data().await.map_err(io_err(&self.entries_path))?;

        Ok(())
    }

    /// Forget every entry and the source manifest
    pub async fn reset(&self) -> Result<(), CheckpointError> {
        let file = self.file.write().await;
        file.set_len(0).await.map_err(io_err(&self.entries_path))?;

        match fs::remove_file(&self.manifest_path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(io_err(&self.manifest_path)(e)),
        }

        info!(path = %self.entries_path.display(), "Checkpoint reset");
        Ok(())
    }

    pub async fn read_manifest(&self) -> Result<Option<SourceManifest>, CheckpointError> {
        match fs::read_to_string(&self.manifest_path).await {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_err(&self.manifest_path)(e)),
        }
    }

    async fn write_manifest(&self, manifest: &SourceManifest) -> Result<(), CheckpointError> {
        let tmp = self.manifest_path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(manifest)?;
        fs::write(&tmp, json).await.map_err(io_err(&tmp))?;
        fs::rename(&tmp, &self.manifest_path)
            .await
            .map_err(io_err(&self.manifest_path))?;
        Ok(())
    }

    /// Compare the table against the manifest recorded on first run.
    ///
    /// With `enforce` set, a changed table is an error; otherwise it is
    /// logged and the checkpoint is trusted as-is.
    pub async fn verify_source(
        &self,
        table: &Table,
        enforce: bool,
    ) -> Result<SourceCheck, CheckpointError> {
        let current = SourceManifest::from_table(table);

        let stored = match self.read_manifest().await? {
            Some(m) => m,
            None => {
                self.write_manifest(&current).await?;
                return Ok(SourceCheck::Recorded);
            }
        };

        if stored == current {
            return Ok(SourceCheck::Unchanged);
        }

        let detail = format!(
            "row count {} -> {}, key digest {} -> {}",
            stored.row_count,
            current.row_count,
            &stored.key_digest[..stored.key_digest.len().min(12)],
            &current.key_digest[..current.key_digest.len().min(12)],
        );

        if enforce {
            return Err(CheckpointError::SourceChanged(detail));
        }

        warn!(%detail, "Source table changed since checkpoint; trusting existing entries");
        Ok(SourceCheck::Changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Map};
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    use crate::domain::Row;

    fn table(keys: &[&str]) -> Table {
        Table::new(keys.iter().map(|k| Row::new(*k, Map::new())).collect())
    }

    fn ok(key: &str) -> RowOutcome {
        RowOutcome::succeeded(RowKey::new(key), 0, 1, json!({"v": key}), BTreeMap::new())
    }

    #[tokio::test]
    async fn test_record_and_load() {
        let temp = TempDir::new().unwrap();
        let store = CheckpointStore::open(temp.path(), true).await.unwrap();

        assert!(store.load().await.unwrap().is_empty());

        store.record(&ok("a")).await.unwrap();
        store.record(&ok("b")).await.unwrap();

        let keys = store.load().await.unwrap();
        assert_eq!(keys.len(), 2);
        assert!(keys.contains(&RowKey::new("a")));

        let entries = store.load_entries().await.unwrap();
        assert_eq!(entries[&RowKey::new("b")].outcome, Some(ok("b")));
    }

    #[tokio::test]
    async fn test_outcomes_optional() {
        let temp = TempDir::new().unwrap();
        let store = CheckpointStore::open(temp.path(), false).await.unwrap();
        store.record(&ok("a")).await.unwrap();

        let entries = store.load_entries().await.unwrap();
        assert_eq!(entries[&RowKey::new("a")].outcome, None);
    }

    #[tokio::test]
    async fn test_second_open_is_locked() {
        let temp = TempDir::new().unwrap();
        let _store = CheckpointStore::open(temp.path(), true).await.unwrap();

        let second = CheckpointStore::open(temp.path(), true).await;
        assert!(matches!(second, Err(CheckpointError::Locked(_))));
    }

    #[tokio::test]
    async fn test_reopen_after_drop_keeps_entries() {
        let temp = TempDir::new().unwrap();
        {
            let store = CheckpointStore::open(temp.path(), true).await.unwrap();
            store.record(&ok("a")).await.unwrap();
        }
        let store = CheckpointStore::open(temp.path(), true).await.unwrap();
        assert_eq!(store.load().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_torn_tail_is_dropped() {
        let temp = TempDir::new().unwrap();
        {
            let store = CheckpointStore::open(temp.path(), true).await.unwrap();
            store.record(&ok("a")).await.unwrap();
        }
        // Simulate a crash mid-append
        let path = temp.path().join(ENTRIES_FILE);
        let mut content = std::fs::read_to_string(&path).unwrap();
        content.push_str("{\"key\":\"b\",\"recor");
        std::fs::write(&path, content).unwrap();

        let store = CheckpointStore::open(temp.path(), true).await.unwrap();
        store.record(&ok("c")).await.unwrap();

        let keys = store.load().await.unwrap();
        assert_eq!(keys.len(), 2);
        assert!(keys.contains(&RowKey::new("a")));
        assert!(keys.contains(&RowKey::new("c")));
    }

    #[tokio::test]
    async fn test_reset_clears_entries_and_manifest() {
        let temp = TempDir::new().unwrap();
        let store = CheckpointStore::open(temp.path(), true).await.unwrap();
        store.verify_source(&table(&["a"]), true).await.unwrap();
        store.record(&ok("a")).await.unwrap();

        store.reset().await.unwrap();
        assert!(store.load().await.unwrap().is_empty());
        assert!(store.read_manifest().await.unwrap().is_none());

        // Appends keep working after a reset
        store.record(&ok("b")).await.unwrap();
        assert_eq!(store.load().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_verify_source() {
        let temp = TempDir::new().unwrap();
        let store = CheckpointStore::open(temp.path(), true).await.unwrap();

        let t = table(&["a", "b"]);
        assert_eq!(store.verify_source(&t, true).await.unwrap(), SourceCheck::Recorded);
        assert_eq!(store.verify_source(&t, true).await.unwrap(), SourceCheck::Unchanged);

        // Key order does not matter
        let reordered = table(&["b", "a"]);
        assert_eq!(
            store.verify_source(&reordered, true).await.unwrap(),
            SourceCheck::Unchanged
        );

        let changed = table(&["a", "b", "c"]);
        assert!(matches!(
            store.verify_source(&changed, true).await,
            Err(CheckpointError::SourceChanged(_))
        ));
        assert_eq!(
            store.verify_source(&changed, false).await.unwrap(),
            SourceCheck::Changed
        );
    }
}
