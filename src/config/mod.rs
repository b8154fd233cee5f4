//! Runner configuration.
//!
//! A [`Config`] is assembled in three layers:
//! 1. [`Config::default`] provides every value,
//! 2. the first existing of `.proctorrc.json` / `proctor.config.json` in the project root overrides any subset of
//!    keys (camelCase, every key optional), and
//! 3. CLI flags override the result through the `with_*` builder methods.
//!
//! ## Notes
//!
//! - Validation is separate from loading: [`Config::validate`] compiles the test pattern and rejects zero-sized
//!   budgets, so the CLI can report every problem through the same `miette` rendering.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use miette::{Diagnostic, NamedSource, SourceSpan};
use proctor_core::TestType;
use proctor_core::conventions::DEFAULT_TEST_PATTERN;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Config file names looked up in the project root, in priority order.
pub const CONFIG_FILE_NAMES: &[&str] = &[".proctorrc.json", "proctor.config.json"];

const MIB: u64 = 1024 * 1024;
const DAY_MS: u64 = 24 * 60 * 60 * 1000;

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error, Diagnostic)]
pub enum ConfigError {
    #[error("failed to read config file {}", path.display())]
    #[diagnostic(code(proctor::config::read))]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config file {}", path.display())]
    #[diagnostic(
        code(proctor::config::parse),
        help("config keys are camelCase and every key is optional; see `proctor --help` for the flag equivalents")
    )]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
        #[source_code]
        src: NamedSource<String>,
        #[label("parse error here")]
        span: SourceSpan,
    },

    #[error("invalid test pattern `{pattern}`")]
    #[diagnostic(
        code(proctor::config::test_pattern),
        help("testPattern is a regular expression matched against file names, e.g. `\\.(test|spec)\\.ts$`")
    )]
    Pattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("`{field}` must be greater than zero")]
    #[diagnostic(code(proctor::config::zero_budget))]
    ZeroBudget { field: &'static str },
}

// ============================================================================
// Config sections
// ============================================================================

/// How work units are batched and how long they may run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ParallelConfig {
    /// When false every batch has size one.
    pub enabled: bool,
    pub max_workers: usize,
    pub group_timeout_ms: u64,
    pub test_timeout_ms: u64,
}

impl Default for ParallelConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_workers: default_max_workers(),
            group_timeout_ms: 60_000,
            test_timeout_ms: 30_000,
        }
    }
}

/// Half the available cores, at least one.
pub fn default_max_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get() / 2)
        .unwrap_or(1)
        .max(1)
}

/// Health-check policy for running workers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HealthConfig {
    pub interval_ms: u64,
    pub memory_limit_bytes: u64,
    /// Re-dispatch a unit whose worker breached a budget instead of failing it.
    pub requeue_on_breach: bool,
    /// Re-dispatch cap per unit when `requeue_on_breach` is set.
    pub max_restarts: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_ms: 5_000,
            memory_limit_bytes: 512 * MIB,
            requeue_on_breach: false,
            max_restarts: 1,
        }
    }
}

/// Which isolation primitive runs each unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    #[default]
    Process,
    Thread,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExecutorConfig {
    pub backend: Backend,
    /// Worker program for the process backend. Defaults to `proctor-worker` next to the running executable.
    pub program: Option<PathBuf>,
    pub args: Vec<String>,
    /// Command run for each test file; `{file}` is replaced with the path. Empty runs the file itself.
    pub test_command: Vec<String>,
    pub termination_grace_ms: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            backend: Backend::Process,
            program: None,
            args: Vec::new(),
            test_command: Vec::new(),
            termination_grace_ms: 1_000,
        }
    }
}

impl ExecutorConfig {
    /// Resolve the worker program for the process backend.
    pub fn resolve_program(&self) -> PathBuf {
        if let Some(program) = &self.program {
            return program.clone();
        }
        let name = format!("proctor-worker{}", std::env::consts::EXE_SUFFIX);
        std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(|dir| dir.join(&name)))
            .filter(|candidate| candidate.exists())
            .unwrap_or_else(|| PathBuf::from(name))
    }

    pub fn termination_grace(&self) -> Duration {
        Duration::from_millis(self.termination_grace_ms)
    }
}

/// Persisted state location and maintenance timers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StateConfig {
    pub dir: PathBuf,
    pub backup_interval_ms: u64,
    pub backup_max_age_ms: u64,
    pub lock_stale_ms: u64,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("project-state"),
            backup_interval_ms: 300_000,
            backup_max_age_ms: 7 * DAY_MS,
            lock_stale_ms: 30_000,
        }
    }
}

/// Per-group overrides keyed by group name.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GroupOverride {
    pub parallel: Option<bool>,
    pub max_parallel: Option<usize>,
    pub timeout_ms: Option<u64>,
}

// ============================================================================
// Config
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub root_dir: PathBuf,
    pub target_dirs: Vec<String>,
    pub test_pattern: String,
    pub exclude: Vec<String>,
    pub test_type: TestType,
    pub watch_mode: bool,
    pub parallelization: ParallelConfig,
    pub health: HealthConfig,
    pub executor: ExecutorConfig,
    pub state: StateConfig,
    pub groups: BTreeMap<String, GroupOverride>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from("."),
            target_dirs: vec!["tests".to_string()],
            test_pattern: DEFAULT_TEST_PATTERN.to_string(),
            exclude: ["node_modules", "dist", "coverage", "target"]
                .into_iter()
                .map(String::from)
                .collect(),
            test_type: TestType::All,
            watch_mode: false,
            parallelization: ParallelConfig::default(),
            health: HealthConfig::default(),
            executor: ExecutorConfig::default(),
            state: StateConfig::default(),
            groups: BTreeMap::new(),
        }
    }
}

impl Config {
    /// Load the config for a project root, falling back to defaults when no config file exists.
    ///
    /// A relative `rootDir` in the file is resolved against `root`.
    pub fn load(root: &Path) -> Result<Self, ConfigError> {
        let found = CONFIG_FILE_NAMES
            .iter()
            .map(|name| root.join(name))
            .find(|candidate| candidate.is_file());

        let mut config = match found {
            Some(path) => {
                tracing::debug!(path = %path.display(), "loading config file");
                Self::from_file(&path)?
            }
            None => Self::default(),
        };
        config.root_dir = if config.root_dir.is_absolute() {
            config.root_dir
        } else {
            root.join(&config.root_dir)
        };
        Ok(config)
    }

    /// Parse one config file. Unset keys keep their defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(path, text)
    }

    fn from_json(path: &Path, text: String) -> Result<Self, ConfigError> {
        serde_json::from_str(&text).map_err(|source| {
            let offset = byte_offset(&text, source.line(), source.column());
            ConfigError::Parse {
                path: path.to_path_buf(),
                span: SourceSpan::from((offset, 1)),
                src: NamedSource::new(path.display().to_string(), text),
                source,
            }
        })
    }

    /// Check budgets and compile the test pattern.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.parallelization.max_workers == 0 {
            return Err(ConfigError::ZeroBudget {
                field: "parallelization.maxWorkers",
            });
        }
        if self.parallelization.test_timeout_ms == 0 {
            return Err(ConfigError::ZeroBudget {
                field: "parallelization.testTimeoutMs",
            });
        }
        if self.parallelization.group_timeout_ms == 0 {
            return Err(ConfigError::ZeroBudget {
                field: "parallelization.groupTimeoutMs",
            });
        }
        if self.health.interval_ms == 0 {
            return Err(ConfigError::ZeroBudget {
                field: "health.intervalMs",
            });
        }
        self.test_regex().map(|_| ())
    }

    pub fn test_regex(&self) -> Result<Regex, ConfigError> {
        Regex::new(&self.test_pattern).map_err(|source| ConfigError::Pattern {
            pattern: self.test_pattern.clone(),
            source,
        })
    }

    /// Absolute (or root-relative) state directory.
    pub fn state_dir(&self) -> PathBuf {
        if self.state.dir.is_absolute() {
            self.state.dir.clone()
        } else {
            self.root_dir.join(&self.state.dir)
        }
    }

    pub fn test_timeout(&self) -> Duration {
        Duration::from_millis(self.parallelization.test_timeout_ms)
    }

    pub fn group_timeout(&self) -> Duration {
        Duration::from_millis(self.parallelization.group_timeout_ms)
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_millis(self.health.interval_ms)
    }

    // ---- builder overrides (CLI layer) ----

    pub fn with_root_dir(mut self, root: impl Into<PathBuf>) -> Self {
        self.root_dir = root.into();
        self
    }

    pub fn with_target_dirs(mut self, dirs: Vec<String>) -> Self {
        self.target_dirs = dirs;
        self
    }

    pub fn with_test_type(mut self, test_type: TestType) -> Self {
        self.test_type = test_type;
        self
    }

    pub fn with_watch_mode(mut self, watch: bool) -> Self {
        self.watch_mode = watch;
        self
    }

    pub fn with_max_workers(mut self, workers: usize) -> Self {
        self.parallelization.max_workers = workers;
        self
    }

    pub fn with_test_timeout_ms(mut self, ms: u64) -> Self {
        self.parallelization.test_timeout_ms = ms;
        self
    }

    pub fn with_group_timeout_ms(mut self, ms: u64) -> Self {
        self.parallelization.group_timeout_ms = ms;
        self
    }

    pub fn with_backend(mut self, backend: Backend) -> Self {
        self.executor.backend = backend;
        self
    }

    pub fn with_test_command(mut self, command: Vec<String>) -> Self {
        self.executor.test_command = command;
        self
    }

    pub fn with_state_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.state.dir = dir.into();
        self
    }

    pub fn with_requeue_on_breach(mut self, requeue: bool) -> Self {
        self.health.requeue_on_breach = requeue;
        self
    }
}

/// Convert a 1-based line/column pair from `serde_json` into a byte offset, clamped to the text.
fn byte_offset(text: &str, line: usize, column: usize) -> usize {
    let line_start: usize = text
        .split_inclusive('\n')
        .take(line.saturating_sub(1))
        .map(str::len)
        .sum();
    (line_start + column.saturating_sub(1)).min(text.len().saturating_sub(1))
}
