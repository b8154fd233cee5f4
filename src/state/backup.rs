//! Timestamped, hash-verified backups of state snapshots.
//!
//! Each backup is `backups/<file>.<timestamp>.backup` holding `{metadata: {timestamp, hash, version}, data}`. The hash
//! is the SHA-256 of the compact JSON encoding of `data`, so a restore can detect a corrupted or hand-edited entry.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::lock::AdvisoryLock;
use super::{BACKUPS_DIR, StateError, StateResult, TRACKED_FILES, read_json, remove_if_exists, write_json_atomic};
use crate::clock;

pub const BACKUP_FORMAT_VERSION: u32 = 1;
const BACKUP_SUFFIX: &str = ".backup";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupMetadata {
    pub timestamp: u64,
    pub hash: String,
    pub version: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupEntry {
    pub metadata: BackupMetadata,
    pub data: Value,
}

/// A backup found on disk.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct BackupInfo {
    pub file: String,
    pub timestamp: u64,
    pub path: PathBuf,
}

impl BackupInfo {
    /// Parse `<file>.<timestamp>.backup`.
    fn parse(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_str()?;
        let stem = name.strip_suffix(BACKUP_SUFFIX)?;
        let (file, timestamp) = stem.rsplit_once('.')?;
        Some(Self {
            file: file.to_string(),
            timestamp: timestamp.parse().ok()?,
            path: path.to_path_buf(),
        })
    }
}

/// SHA-256 (hex) of the compact JSON encoding of `data`.
pub fn content_hash(data: &Value) -> String {
    let encoded = serde_json::to_string(data).unwrap_or_default();
    hex::encode(Sha256::digest(encoded.as_bytes()))
}

#[derive(Debug)]
pub struct BackupManager {
    state_dir: PathBuf,
    lock: AdvisoryLock,
    /// Last timestamp handed out; keeps backup names unique within one millisecond.
    last_timestamp: Mutex<u64>,
}

impl BackupManager {
    pub fn new(state_dir: impl Into<PathBuf>, lock: AdvisoryLock) -> Self {
        Self {
            state_dir: state_dir.into(),
            lock,
            last_timestamp: Mutex::new(0),
        }
    }

    pub fn backups_dir(&self) -> PathBuf {
        self.state_dir.join(BACKUPS_DIR)
    }

    fn next_timestamp(&self) -> u64 {
        let mut last = self.last_timestamp.lock().unwrap_or_else(PoisonError::into_inner);
        let now = clock::now_ms().max(*last + 1);
        *last = now;
        now
    }

    /// Store `data` as a new backup of `file`.
    pub fn backup_value(&self, file: &str, data: &Value) -> StateResult<BackupInfo> {
        let timestamp = self.next_timestamp();
        let entry = BackupEntry {
            metadata: BackupMetadata {
                timestamp,
                hash: content_hash(data),
                version: BACKUP_FORMAT_VERSION,
            },
            data: data.clone(),
        };
        let path = self.backups_dir().join(format!("{file}.{timestamp}{BACKUP_SUFFIX}"));
        write_json_atomic(&path, &entry)?;
        tracing::debug!(file, timestamp, "wrote state backup");
        Ok(BackupInfo {
            file: file.to_string(),
            timestamp,
            path,
        })
    }

    /// Back up the current contents of a tracked state file.
    ///
    /// ## Returns
    /// - `Ok(None)` when the file does not exist yet.
    /// - [`StateError::Locked`] when another writer holds the file.
    pub fn backup_file(&self, file: &str) -> StateResult<Option<BackupInfo>> {
        let _guard = self.lock.require(file)?;
        let Some(data) = read_json::<Value>(&self.state_dir.join(file))? else {
            return Ok(None);
        };
        self.backup_value(file, &data).map(Some)
    }

    /// Back up every tracked file. Locked files are skipped for this cycle.
    pub fn backup_all(&self) -> StateResult<Vec<BackupInfo>> {
        let mut written = Vec::new();
        for file in TRACKED_FILES {
            match self.backup_file(file) {
                Ok(Some(info)) => written.push(info),
                Ok(None) => {}
                Err(StateError::Locked(key)) => {
                    tracing::warn!(file = %key, "state file is locked; skipping backup this cycle");
                }
                Err(err) => return Err(err),
            }
        }
        tracing::info!(count = written.len(), "state backup complete");
        Ok(written)
    }

    /// Backups of `file` (or of every file when `None`), oldest first.
    pub fn list_backups(&self, file: Option<&str>) -> StateResult<Vec<BackupInfo>> {
        let dir = self.backups_dir();
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(StateError::io(&dir)(err)),
        };
        let mut backups: Vec<BackupInfo> = entries
            .filter_map(Result::ok)
            .filter_map(|entry| BackupInfo::parse(&entry.path()))
            .filter(|info| file.is_none_or(|f| info.file == f))
            .collect();
        backups.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.file.cmp(&b.file)));
        Ok(backups)
    }

    /// Read and verify a backup entry.
    pub fn load(&self, info: &BackupInfo) -> StateResult<BackupEntry> {
        let entry: BackupEntry = read_json(&info.path)?.ok_or_else(|| StateError::NoBackup {
            file: info.file.clone(),
            timestamp: Some(info.timestamp),
        })?;
        let actual = content_hash(&entry.data);
        if actual != entry.metadata.hash {
            return Err(StateError::HashMismatch {
                file: info.file.clone(),
                expected: entry.metadata.hash,
                actual,
            });
        }
        Ok(entry)
    }

    /// Restore `file` from the backup at `timestamp`, or from the most recent one.
    ///
    /// ## Returns
    /// - The restored data, which has also been written back to the state file.
    pub fn restore(&self, file: &str, timestamp: Option<u64>) -> StateResult<Value> {
        if !TRACKED_FILES.contains(&file) {
            return Err(StateError::Untracked(file.to_string()));
        }
        let backups = self.list_backups(Some(file))?;
        let info = match timestamp {
            Some(ts) => backups.into_iter().find(|b| b.timestamp == ts),
            None => backups.into_iter().next_back(),
        }
        .ok_or_else(|| StateError::NoBackup {
            file: file.to_string(),
            timestamp,
        })?;

        let entry = self.load(&info)?;
        let _guard = self.lock.require(file)?;
        write_json_atomic(&self.state_dir.join(file), &entry.data)?;
        tracing::info!(file, timestamp = info.timestamp, "restored state file from backup");
        Ok(entry.data)
    }

    /// Delete backups older than `max_age`; returns how many were removed.
    pub fn cleanup(&self, max_age: Duration) -> StateResult<usize> {
        let now = clock::now_ms();
        let mut removed = 0;
        for info in self.list_backups(None)? {
            if clock::is_older_than(info.timestamp, max_age, now) && remove_if_exists(&info.path)? {
                removed += 1;
            }
        }
        if removed > 0 {
            tracing::info!(removed, "pruned old state backups");
        }
        Ok(removed)
    }

    /// Back up and prune on a fixed interval until `stop` flips to `true`.
    pub fn spawn_periodic(
        self: Arc<Self>,
        interval: Duration,
        max_age: Duration,
        mut stop: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    changed = stop.changed() => {
                        if changed.is_err() || *stop.borrow() {
                            break;
                        }
                        continue;
                    }
                }
                let manager = Arc::clone(&self);
                let outcome = tokio::task::spawn_blocking(move || {
                    manager.backup_all()?;
                    manager.cleanup(max_age)
                })
                .await;
                match outcome {
                    Ok(Ok(_)) => {}
                    Ok(Err(err)) => tracing::warn!(error = %err, "periodic state backup failed"),
                    Err(err) => tracing::warn!(error = %err, "periodic state backup task failed"),
                }
            }
        })
    }
}
