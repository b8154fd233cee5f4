#![deny(unsafe_code)]
//! Proctor: a self-hosted test-execution orchestrator
//!
//! Proctor discovers test files, groups them by directory, runs each one in an isolated executor (a child process or
//! an OS thread) under time and memory budgets, and persists derived project state with advisory locking and
//! hash-verified backups.
//!
//! ## Layout
//!
//! - [`config`]: layered configuration (defaults, config file, CLI flags).
//! - [`collect`]: bounded-concurrency file discovery and grouping.
//! - [`workers`]: the executor seam, both backends, the per-unit lifecycle and the batching pool.
//! - [`state`]: run bookkeeping, snapshots, locks and backups.
//! - [`errors`]: the categorized error bus and impact analysis.
//! - [`runner`]: the composition root and one end-to-end run.
//! - [`cli`]: argument parsing, console reporting and watch mode.
//!
//! ## Panic Policy
//!
//! This codebase follows explicit error handling:
//!
//! - **Production code**: Use `Result` or `Option` with `?` / `ok_or` / `map_err`. The `cli` module enforces
//!   `#![deny(clippy::unwrap_used)]`.
//!
//! - **Test code**: `.unwrap()` and `.expect()` are acceptable in tests.
//!
//! - **True invariants**: If a panic represents a logic error (e.g. a regex literal that must compile), use
//!   `.expect("INVARIANT: reason")` with a clear explanation.
//!
//! - **Unsafe**: denied crate-wide; the one exception is the `kill(2)` call that delivers SIGTERM to a worker.

pub mod cli;
pub mod clock;
pub mod collect;
pub mod config;
pub mod errors;
pub mod runner;
pub mod state;
pub mod version;
pub mod workers;

pub use collect::{FileCollector, Grouper, TestFile, TestGroup};
pub use config::Config;
pub use errors::{ErrorBus, ImpactAnalyzer};
pub use runner::{RunReport, Services, TestReporter, TestRunner};
pub use state::{RunState, StateManager};
pub use workers::{IsolatedExecutor, WorkerPool};

pub use proctor_core::{ErrorCategory, ResultKind, Severity, WorkResult};
