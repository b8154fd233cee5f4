//! Discover test files under the configured target directories.
//!
//! The walk is breadth-first over a [`JoinSet`] of directory reads, with a [`Semaphore`] capping how many reads are
//! in flight at once so large trees cannot exhaust file descriptors.
//!
//! ## Notes
//!
//! - Traversal fails soft: a directory that cannot be read becomes an issue (a `structure` [`WorkResult`]) and its
//!   siblings are still walked.
//! - Dot-directories and excluded names are skipped before they are read.
//! - Returned paths are relative to the project root, use `/` separators, and are deduplicated and sorted.

pub mod group;

pub use group::{GroupPolicy, Grouper, TestFile, TestGroup};

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use proctor_core::{ResultKind, Severity, TestType, WorkResult};
use regex::Regex;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::config::{Config, ConfigError};

/// Upper bound on concurrent directory reads.
pub const MAX_CONCURRENT_READS: usize = 50;

#[derive(Debug, Error)]
pub enum CollectError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to read directory {}: {source}", path.display())]
    ReadDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("directory walk task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl CollectError {
    /// Render as a `structure` issue attributed to `file`.
    pub fn to_issue(&self, file: &str) -> WorkResult {
        WorkResult::new(
            file,
            ResultKind::Structure,
            Severity::Error,
            format!("Error reading directory: {self}"),
        )
    }
}

/// Output of one collection pass.
#[derive(Debug, Default, Clone)]
pub struct Collection {
    /// Matching test files, root-relative.
    pub files: Vec<String>,
    /// Every directory that was read successfully, root-relative.
    pub directories: Vec<String>,
    /// Soft failures encountered during the walk.
    pub issues: Vec<WorkResult>,
}

impl Collection {
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct FileCollector {
    root: PathBuf,
    target_dirs: Vec<String>,
    exclude: Vec<String>,
    pattern: Regex,
    test_type: TestType,
    max_concurrent_reads: usize,
}

/// Result of reading one directory.
struct DirListing {
    dir: PathBuf,
    files: Vec<PathBuf>,
    subdirs: Vec<PathBuf>,
}

impl FileCollector {
    pub fn from_config(config: &Config) -> Result<Self, CollectError> {
        Ok(Self {
            root: config.root_dir.clone(),
            target_dirs: config.target_dirs.clone(),
            exclude: config.exclude.clone(),
            pattern: config.test_regex()?,
            test_type: config.test_type,
            max_concurrent_reads: MAX_CONCURRENT_READS,
        })
    }

    /// Restrict the walk to a single directory (the CLI `--path` flag). Relative paths are taken from the root.
    pub fn with_scope(mut self, path: &Path) -> Self {
        let scoped = if path.is_absolute() {
            path.strip_prefix(&self.root).unwrap_or(path).to_path_buf()
        } else {
            path.to_path_buf()
        };
        self.target_dirs = vec![to_slash(&scoped)];
        self
    }

    pub fn with_max_concurrent_reads(mut self, limit: usize) -> Self {
        self.max_concurrent_reads = limit.max(1);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Whether a directory entry name should be skipped without reading it.
    pub fn should_skip_dir(&self, name: &str) -> bool {
        name.starts_with('.') || self.exclude.iter().any(|e| e == name)
    }

    /// Whether a root-relative file path is a test file selected by this collector.
    pub fn accepts(&self, relative: &str) -> bool {
        let name = relative.rsplit('/').next().unwrap_or(relative);
        self.pattern.is_match(name) && self.test_type.selects(relative)
    }

    /// Walk every target directory and return matching files.
    #[tracing::instrument(skip(self), fields(root = %self.root.display()))]
    pub async fn collect(&self) -> Collection {
        let permits = Arc::new(Semaphore::new(self.max_concurrent_reads));
        let mut walk: JoinSet<Result<DirListing, CollectError>> = JoinSet::new();

        for target in &self.target_dirs {
            spawn_read(&mut walk, &permits, self.root.join(target));
        }

        let mut files = BTreeSet::new();
        let mut directories = BTreeSet::new();
        let mut issues = Vec::new();

        while let Some(joined) = walk.join_next().await {
            let listing = match joined.map_err(CollectError::from).and_then(|r| r) {
                Ok(listing) => listing,
                Err(err) => {
                    let file = match &err {
                        CollectError::ReadDir { path, .. } => self.relativize(path),
                        _ => "file-collector".to_string(),
                    };
                    tracing::warn!(%file, error = %err, "skipping unreadable directory");
                    issues.push(err.to_issue(&file));
                    continue;
                }
            };

            directories.insert(self.relativize(&listing.dir));
            for subdir in listing.subdirs {
                let skip = subdir
                    .file_name()
                    .and_then(|n| n.to_str())
                    .is_none_or(|name| self.should_skip_dir(name));
                if !skip {
                    spawn_read(&mut walk, &permits, subdir);
                }
            }
            for file in listing.files {
                let relative = self.relativize(&file);
                if self.accepts(&relative) {
                    files.insert(relative);
                }
            }
        }

        tracing::debug!(files = files.len(), dirs = directories.len(), issues = issues.len(), "collection complete");
        Collection {
            files: files.into_iter().collect(),
            directories: directories.into_iter().collect(),
            issues,
        }
    }

    fn relativize(&self, path: &Path) -> String {
        let relative = path.strip_prefix(&self.root).unwrap_or(path);
        let rendered = to_slash(relative);
        rendered.strip_prefix("./").map(str::to_string).unwrap_or(rendered)
    }
}

fn spawn_read(walk: &mut JoinSet<Result<DirListing, CollectError>>, permits: &Arc<Semaphore>, dir: PathBuf) {
    let permits = Arc::clone(permits);
    walk.spawn(async move {
        // The semaphore is never closed, so acquisition only fails if that invariant breaks.
        let _permit = permits.acquire_owned().await.map_err(|_| CollectError::ReadDir {
            path: dir.clone(),
            source: std::io::Error::other("directory read limiter closed"),
        })?;
        read_dir(dir).await
    });
}

async fn read_dir(dir: PathBuf) -> Result<DirListing, CollectError> {
    let wrap = |source: std::io::Error| CollectError::ReadDir {
        path: dir.clone(),
        source,
    };
    let mut entries = tokio::fs::read_dir(&dir).await.map_err(wrap)?;
    let mut files = Vec::new();
    let mut subdirs = Vec::new();
    while let Some(entry) = entries.next_entry().await.map_err(wrap)? {
        let file_type = entry.file_type().await.map_err(wrap)?;
        if file_type.is_dir() {
            subdirs.push(entry.path());
        } else if file_type.is_file() {
            files.push(entry.path());
        }
    }
    Ok(DirListing { dir, files, subdirs })
}

fn to_slash(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn touch(root: &Path, rel: &str) {
        let path = root.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, "").unwrap();
    }

    fn collector(root: &Path) -> FileCollector {
        FileCollector::from_config(&Config::default().with_root_dir(root)).unwrap()
    }

    #[tokio::test]
    async fn test_collects_matching_files_sorted() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "tests/core/b.test.ts");
        touch(dir.path(), "tests/core/a.test.ts");
        touch(dir.path(), "tests/core/helper.ts");
        touch(dir.path(), "tests/ui/button.spec.tsx");

        let collection = collector(dir.path()).collect().await;
        assert_eq!(
            collection.files,
            vec!["tests/core/a.test.ts", "tests/core/b.test.ts", "tests/ui/button.spec.tsx"]
        );
        assert!(collection.issues.is_empty());
        assert!(collection.directories.contains(&"tests/core".to_string()));
    }

    #[tokio::test]
    async fn test_skips_dot_and_excluded_directories() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "tests/.cache/a.test.ts");
        touch(dir.path(), "tests/node_modules/pkg/a.test.ts");
        touch(dir.path(), "tests/real.test.js");

        let collection = collector(dir.path()).collect().await;
        assert_eq!(collection.files, vec!["tests/real.test.js"]);
    }

    #[tokio::test]
    async fn test_missing_target_becomes_issue() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "tests/a.test.ts");
        let config = Config::default()
            .with_root_dir(dir.path())
            .with_target_dirs(vec!["tests".into(), "missing".into()]);

        let collection = FileCollector::from_config(&config).unwrap().collect().await;
        assert_eq!(collection.files, vec!["tests/a.test.ts"]);
        assert_eq!(collection.issues.len(), 1);
        assert_eq!(collection.issues[0].file, "missing");
        assert_eq!(collection.issues[0].kind, ResultKind::Structure);
    }

    #[tokio::test]
    async fn test_overlapping_targets_are_deduplicated() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "tests/unit/a.test.ts");
        let config = Config::default()
            .with_root_dir(dir.path())
            .with_target_dirs(vec!["tests".into(), "tests/unit".into()]);

        let collection = FileCollector::from_config(&config).unwrap().collect().await;
        assert_eq!(collection.files, vec!["tests/unit/a.test.ts"]);
    }

    #[tokio::test]
    async fn test_test_type_filter() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "tests/a.frontend.test.tsx");
        touch(dir.path(), "tests/b.backend.test.ts");
        touch(dir.path(), "tests/c.test.ts");
        let config = Config::default()
            .with_root_dir(dir.path())
            .with_test_type(TestType::SelfTests);

        let collection = FileCollector::from_config(&config).unwrap().collect().await;
        assert_eq!(collection.files, vec!["tests/c.test.ts"]);
    }

    #[tokio::test]
    async fn test_scope_restricts_walk() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "tests/core/a.test.ts");
        touch(dir.path(), "tests/ui/b.test.ts");

        let collection = collector(dir.path()).with_scope(Path::new("tests/ui")).collect().await;
        assert_eq!(collection.files, vec!["tests/ui/b.test.ts"]);
    }

    #[tokio::test]
    async fn test_single_read_permit_still_walks_every_directory() {
        let dir = tempfile::tempdir().unwrap();
        for sub in ["a", "a/b", "a/b/c", "d", "e/f"] {
            touch(dir.path(), &format!("tests/{sub}/x.test.ts"));
        }

        let collection = collector(dir.path()).with_max_concurrent_reads(0).collect().await;
        assert_eq!(collection.files.len(), 5);
        assert!(collection.issues.is_empty());
        assert!(collection.directories.contains(&"tests/a/b/c".to_string()));
    }
}
