//! Polling change detection for `--watch`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::sync::watch;

use crate::clock;
use crate::config::Config;

/// Default time between two scans.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Modification time (ms) of every file and directory under the watched roots.
type Fingerprint = BTreeMap<PathBuf, u64>;

#[derive(Debug)]
pub struct ChangeWatcher {
    roots: Vec<PathBuf>,
    exclude: Vec<String>,
    interval: Duration,
    last: Fingerprint,
}

impl ChangeWatcher {
    /// Watch `roots`, taking the initial fingerprint immediately.
    pub fn new(roots: Vec<PathBuf>, exclude: Vec<String>) -> Self {
        let mut watcher = Self {
            roots,
            exclude,
            interval: DEFAULT_POLL_INTERVAL,
            last: Fingerprint::new(),
        };
        watcher.last = watcher.scan();
        watcher
    }

    /// Watch the directories a run would collect from.
    pub fn from_config(config: &Config, scope: Option<&Path>) -> Self {
        let roots = match scope {
            Some(scope) => vec![config.root_dir.join(scope)],
            None => config.target_dirs.iter().map(|dir| config.root_dir.join(dir)).collect(),
        };
        Self::new(roots, config.exclude.clone())
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    fn scan(&self) -> Fingerprint {
        let mut fingerprint = Fingerprint::new();
        let mut stack: Vec<PathBuf> = self.roots.clone();
        while let Some(dir) = stack.pop() {
            let Ok(entries) = std::fs::read_dir(&dir) else {
                continue;
            };
            if let Ok(meta) = std::fs::metadata(&dir) {
                fingerprint.insert(dir.clone(), meta.modified().map(clock::to_ms).unwrap_or(0));
            }
            for entry in entries.flatten() {
                let name = entry.file_name().to_string_lossy().into_owned();
                let Ok(kind) = entry.file_type() else { continue };
                if kind.is_dir() {
                    if !name.starts_with('.') && !self.exclude.contains(&name) {
                        stack.push(entry.path());
                    }
                } else if let Ok(meta) = entry.metadata() {
                    fingerprint.insert(entry.path(), meta.modified().map(clock::to_ms).unwrap_or(0));
                }
            }
        }
        fingerprint
    }

    /// Rescan once. `true` when anything was added, removed or modified since the previous scan.
    pub fn poll(&mut self) -> bool {
        let current = self.scan();
        let changed = current != self.last;
        self.last = current;
        changed
    }

    /// Wait until something changes. Returns `false` if `stop` fires first.
    pub async fn wait_for_change(&mut self, stop: &mut watch::Receiver<bool>) -> bool {
        loop {
            if *stop.borrow() {
                return false;
            }
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {
                    if self.poll() {
                        tracing::info!("change detected, re-running");
                        return true;
                    }
                }
                changed = stop.changed() => {
                    if changed.is_err() {
                        return false;
                    }
                }
            }
        }
    }
}
