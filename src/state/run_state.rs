//! In-memory bookkeeping for one run.
//!
//! `RunState` is the single place where "unit started" and "unit finished" are recorded. It refuses transitions that
//! would break the scheduling invariants instead of silently accepting them:
//! - a unit can only start in a known group and only when it is not already running or finished,
//! - a unit can only complete after it started,
//! - results are append-only per group; nothing is ever overwritten.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::Instant;

use proctor_core::{Severity, WorkResult, codes};
use serde::Serialize;
use thiserror::Error;

use crate::clock;
use crate::collect::TestGroup;

/// Scheduling key of a work unit. Displays as `group:file`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WorkUnitKey {
    pub group: String,
    pub file: String,
}

impl WorkUnitKey {
    pub fn new(group: impl Into<String>, file: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            file: file.into(),
        }
    }
}

impl fmt::Display for WorkUnitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.group, self.file)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RunStateError {
    #[error("unknown group `{0}`")]
    UnknownGroup(String),

    #[error("test `{0}` is already running")]
    AlreadyRunning(WorkUnitKey),

    #[error("test `{0}` already has a result")]
    AlreadyCompleted(WorkUnitKey),

    #[error("test `{0}` is not running")]
    NotRunning(WorkUnitKey),
}

/// Per-file outcome counts of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub total_files: usize,
    pub passed_files: usize,
    pub failed_files: usize,
    pub duration_ms: u64,
}

impl RunSummary {
    pub fn all_passed(&self) -> bool {
        self.failed_files == 0
    }
}

#[derive(Debug)]
pub struct RunState {
    groups: BTreeMap<String, TestGroup>,
    results: BTreeMap<String, Vec<WorkResult>>,
    /// Results not attributable to a dispatched unit (collection issues).
    issues: Vec<WorkResult>,
    running: BTreeSet<WorkUnitKey>,
    completed: BTreeSet<WorkUnitKey>,
    started_at_ms: u64,
    start: Instant,
    end: Option<Instant>,
}

impl Default for RunState {
    fn default() -> Self {
        Self::new()
    }
}

impl RunState {
    pub fn new() -> Self {
        Self {
            groups: BTreeMap::new(),
            results: BTreeMap::new(),
            issues: Vec::new(),
            running: BTreeSet::new(),
            completed: BTreeSet::new(),
            started_at_ms: clock::now_ms(),
            start: Instant::now(),
            end: None,
        }
    }

    /// Register a group. Re-adding a group replaces its definition but keeps recorded results.
    pub fn add_group(&mut self, group: TestGroup) {
        self.results.entry(group.name.clone()).or_default();
        self.groups.insert(group.name.clone(), group);
    }

    pub fn group(&self, name: &str) -> Option<&TestGroup> {
        self.groups.get(name)
    }

    pub fn start_test(&mut self, group: &str, file: &str) -> Result<(), RunStateError> {
        if !self.groups.contains_key(group) {
            return Err(RunStateError::UnknownGroup(group.to_string()));
        }
        let key = WorkUnitKey::new(group, file);
        if self.running.contains(&key) {
            return Err(RunStateError::AlreadyRunning(key));
        }
        if self.completed.contains(&key) {
            return Err(RunStateError::AlreadyCompleted(key));
        }
        self.running.insert(key);
        Ok(())
    }

    pub fn complete_test(&mut self, group: &str, file: &str, result: WorkResult) -> Result<(), RunStateError> {
        let key = WorkUnitKey::new(group, file);
        if !self.running.remove(&key) {
            return Err(RunStateError::NotRunning(key));
        }
        self.results.entry(key.group.clone()).or_default().push(result);
        self.completed.insert(key);
        Ok(())
    }

    /// Forget a running unit without recording a result, so it can be dispatched again.
    pub fn abandon_test(&mut self, group: &str, file: &str) -> bool {
        self.running.remove(&WorkUnitKey::new(group, file))
    }

    pub fn record_issue(&mut self, issue: WorkResult) {
        self.issues.push(issue);
    }

    pub fn is_running(&self, group: &str, file: &str) -> bool {
        self.running.contains(&WorkUnitKey::new(group, file))
    }

    /// True iff no running key belongs to `group`.
    pub fn is_group_complete(&self, group: &str) -> bool {
        !self.running.iter().any(|key| key.group == group)
    }

    pub fn running_in(&self, group: &str) -> Vec<WorkUnitKey> {
        self.running.iter().filter(|key| key.group == group).cloned().collect()
    }

    /// Force every still-running unit of `group` to an `ERR_GROUP_TIMEOUT` result.
    ///
    /// ## Returns
    /// - The synthesized results, in key order. Empty when the group was already complete.
    pub fn expire_group(&mut self, group: &str) -> Vec<WorkResult> {
        let timeout_ms = self
            .groups
            .get(group)
            .map(|g| g.policy.timeout.as_millis())
            .unwrap_or_default();
        let mut expired = Vec::new();
        for key in self.running_in(group) {
            let result = WorkResult::error(&key.file, format!("Group {group} timed out after {timeout_ms}ms"))
                .with_code(codes::ERR_GROUP_TIMEOUT);
            self.running.remove(&key);
            self.results.entry(key.group.clone()).or_default().push(result.clone());
            self.completed.insert(key);
            expired.push(result);
        }
        if !expired.is_empty() {
            tracing::warn!(group, expired = expired.len(), "group exceeded its time budget");
        }
        expired
    }

    /// Stamp the end of the run. Later calls keep the first stamp.
    pub fn finalize(&mut self) {
        self.end.get_or_insert_with(Instant::now);
    }

    pub fn is_finalized(&self) -> bool {
        self.end.is_some()
    }

    pub fn started_at_ms(&self) -> u64 {
        self.started_at_ms
    }

    /// Elapsed run time; measured to now until [`finalize`](Self::finalize) is called.
    pub fn duration_ms(&self) -> u64 {
        let end = self.end.unwrap_or_else(Instant::now);
        u64::try_from(end.duration_since(self.start).as_millis()).unwrap_or(u64::MAX)
    }

    pub fn results_for(&self, group: &str) -> &[WorkResult] {
        self.results.get(group).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn groups(&self) -> impl Iterator<Item = &TestGroup> {
        self.groups.values()
    }

    /// Every recorded result: collection issues first, then groups in name order.
    pub fn all_results(&self) -> Vec<WorkResult> {
        self.issues
            .iter()
            .chain(self.results.values().flatten())
            .cloned()
            .collect()
    }

    pub fn completed_count(&self) -> usize {
        self.completed.len()
    }

    /// Count files; a file fails if any of its results has `severity: error`.
    pub fn summary(&self) -> RunSummary {
        let mut by_file: BTreeMap<&str, bool> = BTreeMap::new();
        for result in self.issues.iter().chain(self.results.values().flatten()) {
            let failed = by_file.entry(result.file.as_str()).or_insert(false);
            *failed |= result.severity == Severity::Error;
        }
        let failed_files = by_file.values().filter(|failed| **failed).count();
        RunSummary {
            total_files: by_file.len(),
            passed_files: by_file.len() - failed_files,
            failed_files,
            duration_ms: self.duration_ms(),
        }
    }
}
