//! CLI module for the proctor test orchestrator
//!
//! ## Commands
//!
//! - `proctor [--frontend|--backend|--self|--all] [--watch] [--path DIR]` - Run the test suite
//! - `backup` - Back up the state snapshots now
//! - `restore <FILE> [--timestamp MS]` - Restore a state snapshot from a backup
//! - `backups [FILE]` - List backups
//! - `cleanup-backups [--max-age-ms MS]` - Prune old backups
//! - `history [--test ID] [--from MS --to MS] [--clear]` - Query the run history
//! - `clear-state` - Remove every state snapshot
//!
//! ## Modules
//!
//! - `commands` - Command implementations
//! - `reporter` - Console progress, failure blocks and the summary line
//! - `watch` - Polling change detection for `--watch`
//!
//! ## Design
//!
//! The CLI uses clap for argument parsing with derive macros.
//! Command functions return `CliResult<T>` instead of calling `process::exit`.
//! Only the top-level `run()` function handles errors and exits.
//!
//! Exit codes: `0` when every file passed, `1` on any failing result or runner error, `130`/`143` after
//! SIGINT/SIGTERM.

// Enforce explicit error handling - no panicking in production code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

pub mod commands;
pub mod reporter;
pub mod watch;

use std::fmt;
use std::path::PathBuf;
use std::process;

use clap::{Args, Parser, Subcommand, ValueEnum};
use proctor_core::TestType;

use crate::config::{Backend, Config, ConfigError};
use crate::version::PROCTOR_VERSION;

// ============================================================================
// CLI Error handling
// ============================================================================

/// Exit code for CLI operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitCode(pub i32);

impl ExitCode {
    pub const SUCCESS: ExitCode = ExitCode(0);
    pub const FAILURE: ExitCode = ExitCode(1);
}

/// Error type for CLI operations.
///
/// Contains a user-facing message and an exit code. The CLI entry point
/// catches these errors, prints the message, and exits with the code.
#[derive(Debug)]
pub struct CliError {
    /// User-facing error message (already formatted for display)
    pub message: String,
    /// Exit code to return to the shell
    pub exit_code: ExitCode,
}

impl CliError {
    pub fn new(message: impl Into<String>, exit_code: ExitCode) -> Self {
        Self {
            message: message.into(),
            exit_code,
        }
    }

    /// Create a failure error (exit code 1).
    pub fn failure(message: impl Into<String>) -> Self {
        Self::new(message, ExitCode::FAILURE)
    }

    pub fn with_code(message: impl Into<String>, code: i32) -> Self {
        Self::new(message, ExitCode(code))
    }

    /// Render a config problem with its miette diagnostic (code, source snippet, help).
    pub fn config(err: ConfigError) -> Self {
        Self::failure(format!("{:?}", miette::Report::new(err)))
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for CliError {}

/// Result type for CLI operations.
pub type CliResult<T> = Result<T, CliError>;

// ============================================================================
// Clap CLI definition
// ============================================================================

/// Self-hosted test orchestrator
#[derive(Parser, Debug)]
#[command(name = "proctor")]
#[command(version = PROCTOR_VERSION)]
#[command(about = "Run test files in isolated workers and keep durable project state", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    #[command(flatten)]
    pub selection: Selection,

    /// Re-run when test files change
    #[arg(long)]
    pub watch: bool,

    /// Only collect tests under this directory
    #[arg(long, value_name = "DIR")]
    pub path: Option<PathBuf>,

    /// Project root (config files and state live here)
    #[arg(long, value_name = "DIR", default_value = ".", global = true)]
    pub root: PathBuf,

    /// Explicit config file instead of probing the project root
    #[arg(long, value_name = "FILE", global = true)]
    pub config: Option<PathBuf>,

    /// Maximum concurrent workers per batch
    #[arg(long, value_name = "N")]
    pub workers: Option<usize>,

    /// Per-test timeout in milliseconds
    #[arg(long, value_name = "MS")]
    pub timeout_ms: Option<u64>,

    /// How each test file is isolated
    #[arg(long, value_enum, value_name = "KIND")]
    pub executor: Option<ExecutorKind>,

    /// Print one line per test file
    #[arg(short, long)]
    pub verbose: bool,
}

/// Test-type selection flags; at most one may be given.
#[derive(Args, Debug, Clone, Copy, Default)]
#[group(multiple = false)]
pub struct Selection {
    /// Only `*.frontend.test.*` files
    #[arg(long)]
    pub frontend: bool,
    /// Only `*.backend.test.*` files
    #[arg(long)]
    pub backend: bool,
    /// Only files that are neither frontend nor backend
    #[arg(long = "self")]
    pub self_tests: bool,
    /// Every test file (default)
    #[arg(long)]
    pub all: bool,
}

impl Selection {
    /// The selected test type, if a flag was given.
    pub fn test_type(self) -> Option<TestType> {
        if self.frontend {
            Some(TestType::Frontend)
        } else if self.backend {
            Some(TestType::Backend)
        } else if self.self_tests {
            Some(TestType::SelfTests)
        } else if self.all {
            Some(TestType::All)
        } else {
            None
        }
    }
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorKind {
    /// One child process per test file
    Process,
    /// One OS thread per test file
    Thread,
}

impl From<ExecutorKind> for Backend {
    fn from(kind: ExecutorKind) -> Self {
        match kind {
            ExecutorKind::Process => Backend::Process,
            ExecutorKind::Thread => Backend::Thread,
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Back up every state snapshot now
    Backup,

    /// Restore a state snapshot from a backup
    Restore {
        /// State file name, e.g. structure.json
        #[arg(value_name = "FILE")]
        file: String,
        /// Backup timestamp (ms); the latest backup when omitted
        #[arg(long, value_name = "MS")]
        timestamp: Option<u64>,
    },

    /// List backups
    Backups {
        /// Only backups of this state file
        #[arg(value_name = "FILE")]
        file: Option<String>,
    },

    /// Delete backups older than the retention window
    CleanupBackups {
        /// Override the configured maximum age
        #[arg(long, value_name = "MS")]
        max_age_ms: Option<u64>,
    },

    /// Show or clear the run history
    History {
        /// Only entries for this test file
        #[arg(long = "test", value_name = "ID")]
        test_id: Option<String>,
        /// Earliest timestamp (ms)
        #[arg(long, value_name = "MS", requires = "to")]
        from: Option<u64>,
        /// Latest timestamp (ms)
        #[arg(long, value_name = "MS", requires = "from")]
        to: Option<u64>,
        /// Delete the history instead of printing it
        #[arg(long, conflicts_with_all = ["test_id", "from", "to"])]
        clear: bool,
    },

    /// Remove every state snapshot (backups are kept)
    ClearState,
}

// ============================================================================
// CLI entry point
// ============================================================================

/// Main CLI entry point.
///
/// This is the only place where `process::exit` is called. All command
/// implementations return `CliResult` and errors are handled here.
pub fn run() {
    let cli = Cli::parse();

    match execute(cli) {
        Ok(exit_code) => {
            if exit_code.0 != 0 {
                process::exit(exit_code.0);
            }
        }
        Err(e) => {
            if !e.message.is_empty() {
                eprintln!("{}", e.message);
            }
            process::exit(e.exit_code.0);
        }
    }
}

/// Execute the CLI command and return result.
fn execute(cli: Cli) -> CliResult<ExitCode> {
    let config = load_config(&cli)?;

    match cli.command {
        Some(Command::Backup) => commands::backup(&config),
        Some(Command::Restore { file, timestamp }) => commands::restore(&config, &file, timestamp),
        Some(Command::Backups { file }) => commands::list_backups(&config, file.as_deref()),
        Some(Command::CleanupBackups { max_age_ms }) => commands::cleanup_backups(&config, max_age_ms),
        Some(Command::History {
            test_id,
            from,
            to,
            clear,
        }) => commands::history(&config, test_id.as_deref(), from.zip(to), clear),
        Some(Command::ClearState) => commands::clear_state(&config),
        None => commands::run_tests(
            config,
            commands::RunOptions {
                scope: cli.path,
                verbose: cli.verbose,
            },
        ),
    }
}

/// Defaults, then the config file, then flags.
pub fn load_config(cli: &Cli) -> CliResult<Config> {
    let root = if cli.root.is_absolute() {
        cli.root.clone()
    } else {
        std::env::current_dir()
            .map_err(|e| CliError::failure(format!("Error: cannot determine working directory: {e}")))?
            .join(&cli.root)
    };

    let mut config = match &cli.config {
        Some(file) => {
            let config = Config::from_file(file).map_err(CliError::config)?;
            if config.root_dir.is_absolute() {
                config
            } else {
                let root_dir = root.join(&config.root_dir);
                config.with_root_dir(root_dir)
            }
        }
        None => Config::load(&root).map_err(CliError::config)?,
    };

    if let Some(test_type) = cli.selection.test_type() {
        config = config.with_test_type(test_type);
    }
    if cli.watch {
        config = config.with_watch_mode(true);
    }
    if let Some(workers) = cli.workers {
        config = config.with_max_workers(workers);
    }
    if let Some(ms) = cli.timeout_ms {
        config = config.with_test_timeout_ms(ms);
    }
    if let Some(kind) = cli.executor {
        config = config.with_backend(kind.into());
    }

    config.validate().map_err(CliError::config)?;
    Ok(config)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parse_default_run() {
        let cli = Cli::try_parse_from(["proctor"]).unwrap();
        assert!(cli.command.is_none());
        assert_eq!(cli.selection.test_type(), None);
        assert!(!cli.watch);
    }

    #[test]
    fn test_cli_parse_selection_flags() {
        let cli = Cli::try_parse_from(["proctor", "--frontend"]).unwrap();
        assert_eq!(cli.selection.test_type(), Some(TestType::Frontend));

        let cli = Cli::try_parse_from(["proctor", "--self", "--watch", "--path", "tests/api"]).unwrap();
        assert_eq!(cli.selection.test_type(), Some(TestType::SelfTests));
        assert!(cli.watch);
        assert_eq!(cli.path, Some(PathBuf::from("tests/api")));
    }

    #[test]
    fn test_cli_selection_flags_are_exclusive() {
        assert!(Cli::try_parse_from(["proctor", "--frontend", "--backend"]).is_err());
    }

    #[test]
    fn test_cli_parse_restore() {
        let cli = Cli::try_parse_from(["proctor", "restore", "structure.json", "--timestamp", "42"]).unwrap();
        if let Some(Command::Restore { file, timestamp }) = cli.command {
            assert_eq!(file, "structure.json");
            assert_eq!(timestamp, Some(42));
        } else {
            panic!("Expected Restore command");
        }
    }

    #[test]
    fn test_cli_parse_history_range_requires_both_ends() {
        assert!(Cli::try_parse_from(["proctor", "history", "--from", "1"]).is_err());
        let cli = Cli::try_parse_from(["proctor", "history", "--from", "1", "--to", "2"]).unwrap();
        assert!(matches!(cli.command, Some(Command::History { from: Some(1), to: Some(2), .. })));
        assert!(Cli::try_parse_from(["proctor", "history", "--clear", "--test", "a"]).is_err());
    }

    #[test]
    fn test_flags_override_config_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(".proctorrc.json"),
            r#"{"parallelization": {"maxWorkers": 8}, "testType": "backend"}"#,
        )
        .unwrap();
        let root = dir.path().to_str().unwrap();

        let cli = Cli::try_parse_from(["proctor", "--root", root]).unwrap();
        let config = load_config(&cli).unwrap();
        assert_eq!(config.parallelization.max_workers, 8);
        assert_eq!(config.test_type, TestType::Backend);

        let cli = Cli::try_parse_from(["proctor", "--root", root, "--workers", "2", "--frontend", "--executor", "thread"])
            .unwrap();
        let config = load_config(&cli).unwrap();
        assert_eq!(config.parallelization.max_workers, 2);
        assert_eq!(config.test_type, TestType::Frontend);
        assert_eq!(config.executor.backend, Backend::Thread);
    }

    #[test]
    fn test_invalid_config_renders_diagnostic() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(".proctorrc.json"), r#"{"testPattern": "("}"#).unwrap();
        let cli = Cli::try_parse_from(["proctor", "--root", dir.path().to_str().unwrap()]).unwrap();
        let err = load_config(&cli).unwrap_err();
        assert_eq!(err.exit_code, ExitCode::FAILURE);
        assert!(err.message.contains("proctor::config::test_pattern"));
    }

    #[test]
    fn test_zero_workers_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let cli = Cli::try_parse_from(["proctor", "--root", dir.path().to_str().unwrap(), "--workers", "0"]).unwrap();
        assert!(load_config(&cli).unwrap_err().message.contains("maxWorkers"));
    }
}
