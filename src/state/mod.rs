//! Run bookkeeping and durable project state.
//!
//! - [`run_state`]: in-memory record of one run (which units are running, which finished, every result).
//! - [`lock`]: cross-process advisory lock files with staleness expiry.
//! - [`manager`]: `structure.json` / `functions.json` / `history.json` snapshots under `project-state/`.
//! - [`backup`]: timestamped, hash-verified backups of those snapshots with age-based retention.
//! - [`extract`]: the line-based symbol extractor feeding `functions.json`.
//!
//! ## Notes
//!
//! - Every snapshot read-modify-write holds the advisory lock of its file key for the whole operation. Lock failures
//!   are reported as [`StateError::Locked`] immediately; callers decide whether to skip or retry.
//! - Files are written to a temporary sibling and renamed into place, so readers never observe half a document.

pub mod backup;
pub mod extract;
pub mod lock;
pub mod manager;
pub mod run_state;

pub use backup::{BackupEntry, BackupInfo, BackupManager, BackupMetadata};
pub use extract::{Symbol, SymbolKind, extract_symbols};
pub use lock::{AdvisoryLock, LockGuard, LockRecord};
pub use manager::{FileEntry, FunctionRegistry, HistoryEntry, StateManager, StructureSnapshot, is_contention};
pub use run_state::{RunState, RunStateError, RunSummary, WorkUnitKey};

use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

pub const STRUCTURE_FILE: &str = "structure.json";
pub const FUNCTIONS_FILE: &str = "functions.json";
pub const HISTORY_FILE: &str = "history.json";
pub const BACKUPS_DIR: &str = "backups";

/// Snapshot files that are backed up and restorable.
pub const TRACKED_FILES: &[&str] = &[STRUCTURE_FILE, FUNCTIONS_FILE, HISTORY_FILE];

#[derive(Debug, Error)]
pub enum StateError {
    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{}: invalid JSON: {source}", path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("state file `{0}` is locked by another writer")]
    Locked(String),

    #[error("backup of `{file}` is corrupt: hash {actual} does not match recorded {expected}")]
    HashMismatch {
        file: String,
        expected: String,
        actual: String,
    },

    #[error("no backup of `{file}`{}", timestamp.map(|t| format!(" at {t}")).unwrap_or_default())]
    NoBackup { file: String, timestamp: Option<u64> },

    #[error("`{0}` is not a tracked state file")]
    Untracked(String),

    #[error("background state task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl StateError {
    pub(crate) fn io(path: &Path) -> impl FnOnce(std::io::Error) -> StateError + '_ {
        move |source| StateError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

pub type StateResult<T> = Result<T, StateError>;

/// Read and decode a JSON file; `Ok(None)` when it does not exist.
pub(crate) fn read_json<T: DeserializeOwned>(path: &Path) -> StateResult<Option<T>> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(StateError::io(path)(err)),
    };
    serde_json::from_str(&text).map(Some).map_err(|source| StateError::Json {
        path: path.to_path_buf(),
        source,
    })
}

/// Pretty-print `value` to `path` via a temporary sibling and a rename.
pub(crate) fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> StateResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(StateError::io(parent))?;
    }
    let text = serde_json::to_string_pretty(value).map_err(|source| StateError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    let file_name = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
    let tmp = path.with_file_name(format!(".{file_name}.{}.tmp", std::process::id()));
    std::fs::write(&tmp, text).map_err(StateError::io(&tmp))?;
    std::fs::rename(&tmp, path).map_err(|err| {
        let _ = std::fs::remove_file(&tmp);
        StateError::io(path)(err)
    })
}

/// Remove a file, treating "already gone" as success.
pub(crate) fn remove_if_exists(path: &Path) -> StateResult<bool> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(StateError::io(path)(err)),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_atomic_write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/doc.json");
        write_json_atomic(&path, &serde_json::json!({"a": 1})).unwrap();
        let back: serde_json::Value = read_json(&path).unwrap().unwrap();
        assert_eq!(back["a"], 1);
        // No temporary files are left behind.
        assert_eq!(std::fs::read_dir(dir.path().join("nested")).unwrap().count(), 1);
    }

    #[test]
    fn test_missing_file_reads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let value: Option<serde_json::Value> = read_json(&dir.path().join("nope.json")).unwrap();
        assert!(value.is_none());
        assert!(!remove_if_exists(&dir.path().join("nope.json")).unwrap());
    }

    #[test]
    fn test_invalid_json_is_reported_with_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, "{nope").unwrap();
        let err = read_json::<serde_json::Value>(&path).unwrap_err();
        assert!(err.to_string().contains("bad.json"));
    }
}
