//! Partition collected files into test groups.
//!
//! A group is the set of test files sharing an owning directory. Group order is part of the output contract:
//! shallower directories come first, then lexicographic order, so two runs over the same tree schedule identically.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use proctor_core::TestCategory;

use crate::config::{Config, GroupOverride};

/// Name used for files that sit directly in the project root.
pub const ROOT_GROUP: &str = ".";

/// One collected test file.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TestFile {
    pub path: String,
    pub category: TestCategory,
}

impl TestFile {
    pub fn new(path: impl Into<String>) -> Self {
        let path = path.into();
        let category = TestCategory::infer(&path);
        Self { path, category }
    }
}

/// Concurrency and time budget of a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupPolicy {
    pub parallel: bool,
    pub max_parallel: usize,
    pub timeout: Duration,
}

impl GroupPolicy {
    /// Effective batch size: `max_parallel` when parallel, otherwise one.
    pub fn batch_size(&self) -> usize {
        if self.parallel { self.max_parallel.max(1) } else { 1 }
    }

    fn apply(self, over: Option<&GroupOverride>) -> Self {
        let Some(over) = over else { return self };
        Self {
            parallel: over.parallel.unwrap_or(self.parallel),
            max_parallel: over.max_parallel.unwrap_or(self.max_parallel),
            timeout: over.timeout_ms.map(Duration::from_millis).unwrap_or(self.timeout),
        }
    }
}

/// A batch of test files sharing a concurrency/timeout policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestGroup {
    pub name: String,
    pub files: Vec<TestFile>,
    pub policy: GroupPolicy,
}

impl TestGroup {
    pub fn new(name: impl Into<String>, files: impl IntoIterator<Item = impl Into<String>>, policy: GroupPolicy) -> Self {
        Self {
            name: name.into(),
            files: files.into_iter().map(|f| TestFile::new(f)).collect(),
            policy,
        }
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.files.iter().map(|f| f.path.as_str())
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct Grouper {
    defaults: GroupPolicy,
    overrides: BTreeMap<String, GroupOverride>,
}

impl Grouper {
    pub fn new(defaults: GroupPolicy) -> Self {
        Self {
            defaults,
            overrides: BTreeMap::new(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self {
            defaults: GroupPolicy {
                parallel: config.parallelization.enabled,
                max_parallel: config.parallelization.max_workers,
                timeout: config.group_timeout(),
            },
            overrides: config.groups.clone(),
        }
    }

    pub fn with_override(mut self, group: impl Into<String>, over: GroupOverride) -> Self {
        self.overrides.insert(group.into(), over);
        self
    }

    /// Policy for a group name. An override keyed by the full name wins over one keyed by its last segment.
    pub fn policy_for(&self, name: &str) -> GroupPolicy {
        let last_segment = name.rsplit('/').next().unwrap_or(name);
        let over = self
            .overrides
            .get(name)
            .or_else(|| self.overrides.get(last_segment));
        self.defaults.apply(over)
    }

    /// Group root-relative paths by owning directory.
    pub fn group<S: AsRef<str>>(&self, files: &[S]) -> Vec<TestGroup> {
        let mut by_dir: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for file in files {
            let file = file.as_ref();
            by_dir.entry(owning_dir(file)).or_default().insert(file.to_string());
        }

        let mut groups: Vec<TestGroup> = by_dir
            .into_iter()
            .map(|(name, files)| {
                let policy = self.policy_for(&name);
                TestGroup::new(name, files, policy)
            })
            .collect();
        groups.sort_by(|a, b| depth(&a.name).cmp(&depth(&b.name)).then_with(|| a.name.cmp(&b.name)));
        groups
    }
}

fn owning_dir(file: &str) -> String {
    match file.rsplit_once('/') {
        Some((dir, _)) if !dir.is_empty() => dir.to_string(),
        _ => ROOT_GROUP.to_string(),
    }
}

fn depth(name: &str) -> usize {
    if name == ROOT_GROUP { 0 } else { name.split('/').count() }
}
