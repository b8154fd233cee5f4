//! Cross-process advisory locks.
//!
//! A lock is a file `<dir>/<key>.lock` containing `{file, pid, timestamp}`, created with `O_EXCL` semantics so only
//! one process can win the race. Locks are cooperative: nothing stops a writer that ignores them. A lock whose
//! timestamp is older than the staleness window is considered abandoned and may be reclaimed by anyone.
//!
//! ## Notes
//!
//! - Acquisition never blocks or retries in a loop. A live lock makes `acquire` return `false` right away.
//! - A lock file that cannot be parsed may be mid-write by its owner; it is only reclaimed once its mtime is stale.
//! - Removal (reclaim or release) first renames the lock file to a unique tombstone, then checks the tombstone's
//!   contents. A lock re-created by someone else after we looked at it is put back, never deleted.

use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{StateError, StateResult, remove_if_exists};
use crate::clock;

static NEXT_TOMBSTONE: AtomicU64 = AtomicU64::new(0);

/// Contents of a lock file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub file: String,
    pub pid: u32,
    pub timestamp: u64,
}

#[derive(Debug, Clone)]
pub struct AdvisoryLock {
    dir: PathBuf,
    stale_after: Duration,
    pid: u32,
}

impl AdvisoryLock {
    pub fn new(dir: impl Into<PathBuf>, stale_after: Duration) -> Self {
        Self {
            dir: dir.into(),
            stale_after,
            pid: std::process::id(),
        }
    }

    /// Act on behalf of another owner pid. Lets a single process model two competing runs.
    pub fn with_owner_pid(mut self, pid: u32) -> Self {
        self.pid = pid;
        self
    }

    pub fn owner_pid(&self) -> u32 {
        self.pid
    }

    pub fn path_for(&self, key: &str) -> PathBuf {
        let safe: String = key
            .chars()
            .map(|c| if c == '/' || c == '\\' { '_' } else { c })
            .collect();
        self.dir.join(format!("{safe}.lock"))
    }

    /// Try to take the lock for `key`.
    ///
    /// ## Returns
    /// - `Ok(true)` when the lock is now ours.
    /// - `Ok(false)` when a live lock is held (by anyone, including ourselves).
    pub fn acquire(&self, key: &str) -> StateResult<bool> {
        std::fs::create_dir_all(&self.dir).map_err(StateError::io(&self.dir))?;
        let path = self.path_for(key);

        // One reclaim attempt: if a stale lock is removed and someone else wins the re-create, we lose.
        for _ in 0..2 {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    let record = LockRecord {
                        file: key.to_string(),
                        pid: self.pid,
                        timestamp: clock::now_ms(),
                    };
                    let text = serde_json::to_string(&record).map_err(|source| StateError::Json {
                        path: path.clone(),
                        source,
                    })?;
                    file.write_all(text.as_bytes()).map_err(StateError::io(&path))?;
                    tracing::trace!(key, pid = self.pid, "acquired state lock");
                    return Ok(true);
                }
                Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                    let observed = match std::fs::read(&path) {
                        Ok(bytes) => bytes,
                        Err(err) if err.kind() == ErrorKind::NotFound => continue,
                        Err(err) => return Err(StateError::io(&path)(err)),
                    };
                    if !self.is_stale(&path, &observed) {
                        tracing::debug!(key, "state lock is held");
                        return Ok(false);
                    }
                    tracing::info!(key, "reclaiming stale state lock");
                    if self.remove_matching(&path, |taken| taken == observed.as_slice())? == Removal::Replaced {
                        tracing::debug!(key, "stale state lock was replaced before it could be reclaimed");
                        return Ok(false);
                    }
                }
                Err(err) => return Err(StateError::io(&path)(err)),
            }
        }
        Ok(false)
    }

    /// Release the lock for `key` if we own it.
    ///
    /// ## Returns
    /// - `Ok(true)` when our lock was removed; `Ok(false)` when there was no lock or it belongs to someone else.
    pub fn release(&self, key: &str) -> StateResult<bool> {
        let path = self.path_for(key);
        match read_record(&path)? {
            Some(record) if record.pid == self.pid => {
                let ours = |taken: &[u8]| {
                    serde_json::from_slice::<LockRecord>(taken).is_ok_and(|record| record.pid == self.pid)
                };
                Ok(self.remove_matching(&path, ours)? == Removal::Removed)
            }
            _ => Ok(false),
        }
    }

    /// Current holder of `key`, if any.
    pub fn holder(&self, key: &str) -> StateResult<Option<LockRecord>> {
        read_record(&self.path_for(key))
    }

    /// Acquire `key` and release it when the guard drops.
    pub fn guard(&self, key: &str) -> StateResult<Option<LockGuard>> {
        Ok(self.acquire(key)?.then(|| LockGuard {
            lock: self.clone(),
            key: key.to_string(),
        }))
    }

    /// Acquire `key` or fail with [`StateError::Locked`].
    pub fn require(&self, key: &str) -> StateResult<LockGuard> {
        self.guard(key)?.ok_or_else(|| StateError::Locked(key.to_string()))
    }

    fn is_stale(&self, path: &Path, contents: &[u8]) -> bool {
        let now = clock::now_ms();
        match serde_json::from_slice::<LockRecord>(contents) {
            Ok(record) => clock::is_older_than(record.timestamp, self.stale_after, now),
            Err(_) => {
                let modified = std::fs::metadata(path)
                    .and_then(|meta| meta.modified())
                    .map(clock::to_ms)
                    .unwrap_or(0);
                clock::is_older_than(modified, self.stale_after, now)
            }
        }
    }

    /// Delete the lock file at `path` only if its contents satisfy `matches`.
    fn remove_matching(&self, path: &Path, matches: impl Fn(&[u8]) -> bool) -> StateResult<Removal> {
        let seq = NEXT_TOMBSTONE.fetch_add(1, Ordering::Relaxed);
        let tombstone = path.with_extension(format!("{}-{seq}.stale", std::process::id()));
        match std::fs::rename(path, &tombstone) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Removal::Missing),
            Err(err) => return Err(StateError::io(path)(err)),
        }

        let taken = std::fs::read(&tombstone).unwrap_or_default();
        if matches(&taken) {
            remove_if_exists(&tombstone)?;
            return Ok(Removal::Removed);
        }

        // Not the file we meant to remove. A hard link puts it back without clobbering a lock created meanwhile.
        let restored = match std::fs::hard_link(&tombstone, path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                tracing::warn!(path = %path.display(), pid = self.pid, "lock was superseded while being restored");
                Ok(())
            }
            Err(err) => Err(StateError::io(path)(err)),
        };
        remove_if_exists(&tombstone)?;
        restored.map(|()| Removal::Replaced)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Removal {
    Removed,
    Missing,
    Replaced,
}

fn read_record(path: &Path) -> StateResult<Option<LockRecord>> {
    super::read_json(path)
}

/// Holds a lock until dropped.
#[derive(Debug)]
pub struct LockGuard {
    lock: AdvisoryLock,
    key: String,
}

impl LockGuard {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(err) = self.lock.release(&self.key) {
            tracing::warn!(key = %self.key, error = %err, "failed to release state lock");
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_is_exclusive_until_release() {
        let dir = tempfile::tempdir().unwrap();
        let lock = AdvisoryLock::new(dir.path(), Duration::from_secs(30));
        assert!(lock.acquire("state").unwrap());
        assert!(!lock.acquire("state").unwrap());
        assert!(lock.path_for("state").ends_with("state.lock"));
        assert!(lock.release("state").unwrap());
        assert!(lock.acquire("state").unwrap());
    }

    #[test]
    fn test_release_leaves_foreign_locks_alone() {
        let dir = tempfile::tempdir().unwrap();
        let ours = AdvisoryLock::new(dir.path(), Duration::from_secs(30));
        let theirs = ours.clone().with_owner_pid(ours.owner_pid().wrapping_add(1));
        assert!(theirs.acquire("structure.json").unwrap());
        assert!(!ours.release("structure.json").unwrap());
        assert_eq!(ours.holder("structure.json").unwrap().unwrap().pid, theirs.owner_pid());
    }

    #[test]
    fn test_guard_releases_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let lock = AdvisoryLock::new(dir.path(), Duration::from_secs(30));
        {
            let guard = lock.require("history.json").unwrap();
            assert_eq!(guard.key(), "history.json");
            assert!(matches!(lock.require("history.json"), Err(StateError::Locked(_))));
        }
        assert!(lock.holder("history.json").unwrap().is_none());
    }

    #[test]
    fn test_stale_lock_is_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        let lock = AdvisoryLock::new(dir.path(), Duration::from_millis(50));
        let record = LockRecord {
            file: "state".to_string(),
            pid: 1,
            timestamp: clock::now_ms() - 1_000,
        };
        std::fs::write(lock.path_for("state"), serde_json::to_string(&record).unwrap()).unwrap();
        assert!(lock.acquire("state").unwrap());
        assert_eq!(lock.holder("state").unwrap().unwrap().pid, std::process::id());
    }

    fn write_stale_record(lock: &AdvisoryLock, key: &str) -> Vec<u8> {
        let record = LockRecord {
            file: key.to_string(),
            pid: 1,
            timestamp: clock::now_ms() - 1_000,
        };
        let bytes = serde_json::to_vec(&record).unwrap();
        std::fs::write(lock.path_for(key), &bytes).unwrap();
        bytes
    }

    #[test]
    fn test_late_reclaim_leaves_new_owner_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let first = AdvisoryLock::new(dir.path(), Duration::from_millis(50)).with_owner_pid(100);
        let second = first.clone().with_owner_pid(200);
        let stale = write_stale_record(&first, "state");

        // Both saw the stale record; the first reclaims and re-creates before the second acts on it.
        assert!(first.acquire("state").unwrap());
        let path = second.path_for("state");
        let removal = second.remove_matching(&path, |taken| taken == stale.as_slice()).unwrap();

        assert_eq!(removal, Removal::Replaced);
        assert_eq!(first.holder("state").unwrap().unwrap().pid, 100);
        assert!(!second.acquire("state").unwrap());
        let leftovers: Vec<_> = std::fs::read_dir(dir.path()).unwrap().map(|e| e.unwrap().file_name()).collect();
        assert_eq!(leftovers, vec![std::ffi::OsString::from("state.lock")]);
    }

    #[test]
    fn test_concurrent_reclaim_has_one_winner() {
        for _ in 0..20 {
            let dir = tempfile::tempdir().unwrap();
            let base = AdvisoryLock::new(dir.path(), Duration::from_millis(50));
            write_stale_record(&base, "state");

            let barrier = std::sync::Arc::new(std::sync::Barrier::new(2));
            let racers: Vec<_> = [100u32, 200]
                .into_iter()
                .map(|pid| {
                    let lock = base.clone().with_owner_pid(pid);
                    let barrier = std::sync::Arc::clone(&barrier);
                    std::thread::spawn(move || {
                        barrier.wait();
                        (pid, lock.acquire("state").unwrap())
                    })
                })
                .collect();
            let winners: Vec<u32> = racers
                .into_iter()
                .map(|racer| racer.join().unwrap())
                .filter_map(|(pid, won)| won.then_some(pid))
                .collect();

            assert_eq!(winners.len(), 1, "winners: {winners:?}");
            assert_eq!(base.holder("state").unwrap().unwrap().pid, winners[0]);
        }
    }

    #[test]
    fn test_release_does_not_remove_a_successor() {
        let dir = tempfile::tempdir().unwrap();
        let old = AdvisoryLock::new(dir.path(), Duration::from_millis(50)).with_owner_pid(100);
        let new = old.clone().with_owner_pid(200);
        assert!(old.acquire("state").unwrap());
        std::thread::sleep(Duration::from_millis(80));
        assert!(new.acquire("state").unwrap());

        assert!(!old.release("state").unwrap());
        assert_eq!(new.holder("state").unwrap().unwrap().pid, 200);
    }

    #[test]
    fn test_fresh_garbage_lock_is_respected() {
        let dir = tempfile::tempdir().unwrap();
        let lock = AdvisoryLock::new(dir.path(), Duration::from_secs(30));
        std::fs::write(lock.path_for("state"), "").unwrap();
        assert!(!lock.acquire("state").unwrap());
    }

    #[test]
    fn test_keys_with_separators_stay_in_the_lock_dir() {
        let lock = AdvisoryLock::new("/tmp/x", Duration::from_secs(1));
        assert_eq!(lock.path_for("a/b.json"), PathBuf::from("/tmp/x/a_b.json.lock"));
    }
}
