//! Persisted project state: file inventory, symbol registry and run history.
//!
//! The manager owns the `project-state/` directory. Every read and write goes through the advisory lock of its file
//! key, and a held lock is reported as [`StateError::Locked`] without waiting.
//!
//! The manager also observes the error bus: after a high or critical error it raises a backup request, which the
//! runner honours at the end of the run.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use proctor_core::CategorySeverity;
use serde::{Deserialize, Serialize};

use super::extract::{Symbol, extract_symbols};
use super::lock::AdvisoryLock;
use super::{
    FUNCTIONS_FILE, HISTORY_FILE, STRUCTURE_FILE, StateError, StateResult, read_json, remove_if_exists,
    write_json_atomic,
};
use crate::clock;
use crate::errors::{ErrorEvent, ErrorSubscriber};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileEntry {
    pub path: String,
    pub size: u64,
    pub last_modified: u64,
}

/// `structure.json`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructureSnapshot {
    pub timestamp: u64,
    pub files: Vec<FileEntry>,
    pub directories: Vec<String>,
}

/// `functions.json`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionRegistry {
    pub timestamp: u64,
    pub functions: Vec<Symbol>,
}

/// One `history.json` record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub timestamp: u64,
    pub test_id: String,
    pub duration: u64,
    /// `passed` or `failed`.
    pub result: String,
    pub memory_usage: u64,
    pub cpu_usage: f64,
}

#[derive(Debug)]
pub struct StateManager {
    dir: PathBuf,
    lock: AdvisoryLock,
    backup_requested: AtomicBool,
}

impl StateManager {
    pub fn new(dir: impl Into<PathBuf>, lock: AdvisoryLock) -> Self {
        Self {
            dir: dir.into(),
            lock,
            backup_requested: AtomicBool::new(false),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, file: &str) -> PathBuf {
        self.dir.join(file)
    }

    // ---- structure.json ----

    /// Snapshot the size and mtime of `files` (relative to `root`) plus the directory list.
    ///
    /// Files that vanished since collection are left out.
    #[tracing::instrument(skip_all, fields(files = files.len()))]
    pub fn update_structure(
        &self,
        root: &Path,
        files: &[String],
        directories: &[String],
    ) -> StateResult<StructureSnapshot> {
        let _guard = self.lock.require(STRUCTURE_FILE)?;
        let entries = files
            .iter()
            .filter_map(|file| {
                let meta = std::fs::metadata(root.join(file)).ok()?;
                Some(FileEntry {
                    path: file.clone(),
                    size: meta.len(),
                    last_modified: meta.modified().map(clock::to_ms).unwrap_or(0),
                })
            })
            .collect();
        let snapshot = StructureSnapshot {
            timestamp: clock::now_ms(),
            files: entries,
            directories: directories.to_vec(),
        };
        write_json_atomic(&self.path(STRUCTURE_FILE), &snapshot)?;
        Ok(snapshot)
    }

    pub fn read_structure(&self) -> StateResult<Option<StructureSnapshot>> {
        let _guard = self.lock.require(STRUCTURE_FILE)?;
        read_json(&self.path(STRUCTURE_FILE))
    }

    // ---- functions.json ----

    /// Extract symbols from `files` (relative to `root`). Unreadable files are skipped.
    #[tracing::instrument(skip_all, fields(files = files.len()))]
    pub fn update_functions(&self, root: &Path, files: &[String]) -> StateResult<FunctionRegistry> {
        let _guard = self.lock.require(FUNCTIONS_FILE)?;
        let mut functions = Vec::new();
        for file in files {
            match std::fs::read_to_string(root.join(file)) {
                Ok(source) => functions.extend(extract_symbols(file, &source)),
                Err(err) => tracing::debug!(%file, error = %err, "skipping unreadable file in symbol scan"),
            }
        }
        let registry = FunctionRegistry {
            timestamp: clock::now_ms(),
            functions,
        };
        write_json_atomic(&self.path(FUNCTIONS_FILE), &registry)?;
        Ok(registry)
    }

    pub fn read_functions(&self) -> StateResult<Option<FunctionRegistry>> {
        let _guard = self.lock.require(FUNCTIONS_FILE)?;
        read_json(&self.path(FUNCTIONS_FILE))
    }

    // ---- history.json ----

    /// Append `entries` to the history.
    pub fn record_history(&self, entries: &[HistoryEntry]) -> StateResult<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let _guard = self.lock.require(HISTORY_FILE)?;
        let mut history = self.load_history()?;
        history.extend_from_slice(entries);
        write_json_atomic(&self.path(HISTORY_FILE), &history)
    }

    pub fn history(&self) -> StateResult<Vec<HistoryEntry>> {
        let _guard = self.lock.require(HISTORY_FILE)?;
        self.load_history()
    }

    pub fn history_for(&self, test_id: &str) -> StateResult<Vec<HistoryEntry>> {
        Ok(self.history()?.into_iter().filter(|e| e.test_id == test_id).collect())
    }

    /// Entries with `from <= timestamp <= to`.
    pub fn history_between(&self, from: u64, to: u64) -> StateResult<Vec<HistoryEntry>> {
        Ok(self
            .history()?
            .into_iter()
            .filter(|e| (from..=to).contains(&e.timestamp))
            .collect())
    }

    pub fn clear_history(&self) -> StateResult<()> {
        let _guard = self.lock.require(HISTORY_FILE)?;
        write_json_atomic(&self.path(HISTORY_FILE), &Vec::<HistoryEntry>::new())
    }

    /// Remove every snapshot file. Backups are kept.
    pub fn clear_all(&self) -> StateResult<()> {
        for file in [STRUCTURE_FILE, FUNCTIONS_FILE, HISTORY_FILE] {
            let _guard = self.lock.require(file)?;
            remove_if_exists(&self.path(file))?;
        }
        Ok(())
    }

    /// Callers hold the history lock.
    fn load_history(&self) -> StateResult<Vec<HistoryEntry>> {
        Ok(read_json(&self.path(HISTORY_FILE))?.unwrap_or_default())
    }

    // ---- backup requests ----

    pub fn request_backup(&self) {
        self.backup_requested.store(true, Ordering::SeqCst);
    }

    /// Consume a pending backup request.
    pub fn take_backup_request(&self) -> bool {
        self.backup_requested.swap(false, Ordering::SeqCst)
    }
}

impl ErrorSubscriber for StateManager {
    fn on_error(&self, event: &ErrorEvent) {
        let severity = event.impact.as_ref().map_or(event.severity, |impact| impact.severity.max(event.severity));
        if matches!(severity, CategorySeverity::High | CategorySeverity::Critical) {
            tracing::debug!(category = %event.category, %severity, "requesting state backup after error");
            self.request_backup();
        }
    }
}

/// `true` when `err` only means another owner holds the lock.
pub fn is_contention(err: &StateError) -> bool {
    matches!(err, StateError::Locked(_))
}
