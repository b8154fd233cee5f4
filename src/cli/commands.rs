//! CLI command implementations
//!
//! All command functions return `CliResult<ExitCode>` instead of calling
//! `process::exit`. Error handling and exits happen in the top-level `run()`.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::Duration;

use crate::config::Config;
use crate::runner::{Services, TestRunner};
use crate::state::{StateError, TRACKED_FILES};
use crate::workers::StopHandle;

use super::reporter::ConsoleReporter;
use super::watch::ChangeWatcher;
use super::{CliError, CliResult, ExitCode};

/// Exit code after SIGINT.
pub const EXIT_SIGINT: i32 = 130;
/// Exit code after SIGTERM.
pub const EXIT_SIGTERM: i32 = 143;

fn state_error(err: StateError) -> CliError {
    CliError::failure(format!("Error: {err}"))
}

fn runtime() -> CliResult<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| CliError::failure(format!("Error starting async runtime: {e}")))
}

// ============================================================================
// Test runs
// ============================================================================

/// Options for `proctor` without a subcommand.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub scope: Option<PathBuf>,
    pub verbose: bool,
}

/// Run the test suite once, or repeatedly in watch mode.
pub fn run_tests(config: Config, options: RunOptions) -> CliResult<ExitCode> {
    runtime()?.block_on(run_tests_async(config, options))
}

async fn run_tests_async(config: Config, options: RunOptions) -> CliResult<ExitCode> {
    let services = Services::new(&config);
    let stop = StopHandle::new();
    let signal_code = Arc::new(AtomicI32::new(0));
    let signals = tokio::spawn(forward_signals(stop.clone(), Arc::clone(&signal_code)));
    let periodic = Arc::clone(&services.backups).spawn_periodic(
        Duration::from_millis(config.state.backup_interval_ms),
        Duration::from_millis(config.state.backup_max_age_ms),
        stop.subscribe(),
    );

    let mut watcher = config
        .watch_mode
        .then(|| ChangeWatcher::from_config(&config, options.scope.as_deref()));
    let exit = loop {
        let runner = TestRunner::new(config.clone(), services.clone())
            .with_stop_handle(stop.clone())
            .with_scope(options.scope.clone());
        let mut reporter = ConsoleReporter::new(options.verbose);
        let exit = match runner.run(&mut reporter).await {
            Ok(report) if report.passed() => ExitCode::SUCCESS,
            Ok(_) => ExitCode::FAILURE,
            Err(err) => {
                eprintln!("Error: {err}");
                ExitCode::FAILURE
            }
        };

        let Some(watcher) = watcher.as_mut() else { break exit };
        if stop.is_stopped() {
            break exit;
        }
        eprintln!("\nWatching for changes...");
        if !watcher.wait_for_change(&mut stop.subscribe()).await {
            break exit;
        }
    };

    stop.stop();
    signals.abort();
    if let Err(err) = periodic.await {
        tracing::debug!(error = %err, "periodic backup task ended abnormally");
    }

    match signal_code.load(Ordering::SeqCst) {
        0 => Ok(exit),
        code => Ok(ExitCode(code)),
    }
}

/// Stop the run on SIGINT/SIGTERM and remember which one arrived.
async fn forward_signals(stop: StopHandle, code: Arc<AtomicI32>) {
    let received = wait_for_signal().await;
    code.store(received, Ordering::SeqCst);
    tracing::warn!(exit_code = received, "termination signal received, stopping workers");
    stop.stop();
}

#[cfg(unix)]
async fn wait_for_signal() -> i32 {
    use tokio::signal::unix::{SignalKind, signal};

    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(err) => {
            tracing::warn!(error = %err, "cannot listen for SIGTERM");
            return match tokio::signal::ctrl_c().await {
                Ok(()) => EXIT_SIGINT,
                Err(_) => std::future::pending().await,
            };
        }
    };
    tokio::select! {
        result = tokio::signal::ctrl_c() => match result {
            Ok(()) => EXIT_SIGINT,
            Err(_) => {
                term.recv().await;
                EXIT_SIGTERM
            }
        },
        _ = term.recv() => EXIT_SIGTERM,
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> i32 {
    match tokio::signal::ctrl_c().await {
        Ok(()) => EXIT_SIGINT,
        Err(_) => std::future::pending().await,
    }
}

// ============================================================================
// State commands
// ============================================================================

/// Back up every tracked state file now.
pub fn backup(config: &Config) -> CliResult<ExitCode> {
    let services = Services::new(config);
    let written = services.backups.backup_all().map_err(state_error)?;
    if written.is_empty() {
        println!("No state files to back up in {}", config.state_dir().display());
    }
    for info in written {
        println!("Backed up {} ({})", info.file, info.path.display());
    }
    Ok(ExitCode::SUCCESS)
}

/// Restore `file` from its latest backup, or the one taken at `timestamp`.
pub fn restore(config: &Config, file: &str, timestamp: Option<u64>) -> CliResult<ExitCode> {
    if !TRACKED_FILES.contains(&file) {
        return Err(CliError::failure(format!(
            "Error: `{file}` is not a state file (expected one of: {})",
            TRACKED_FILES.join(", ")
        )));
    }
    let services = Services::new(config);
    services.backups.restore(file, timestamp).map_err(state_error)?;
    match timestamp {
        Some(ts) => println!("Restored {file} from backup {ts}"),
        None => println!("Restored {file} from latest backup"),
    }
    Ok(ExitCode::SUCCESS)
}

/// List backups, optionally for one file.
pub fn list_backups(config: &Config, file: Option<&str>) -> CliResult<ExitCode> {
    let services = Services::new(config);
    let backups = services.backups.list_backups(file).map_err(state_error)?;
    if backups.is_empty() {
        println!("No backups found");
    }
    for info in backups {
        println!("{}\t{}\t{}", info.file, info.timestamp, info.path.display());
    }
    Ok(ExitCode::SUCCESS)
}

/// Delete backups older than `max_age_ms` (default: the configured retention).
pub fn cleanup_backups(config: &Config, max_age_ms: Option<u64>) -> CliResult<ExitCode> {
    let services = Services::new(config);
    let max_age = Duration::from_millis(max_age_ms.unwrap_or(config.state.backup_max_age_ms));
    let removed = services.backups.cleanup(max_age).map_err(state_error)?;
    println!("Removed {removed} backup(s)");
    Ok(ExitCode::SUCCESS)
}

/// Query or clear the run history.
pub fn history(
    config: &Config,
    test_id: Option<&str>,
    range: Option<(u64, u64)>,
    clear: bool,
) -> CliResult<ExitCode> {
    let services = Services::new(config);
    if clear {
        services.state.clear_history().map_err(state_error)?;
        println!("History cleared");
        return Ok(ExitCode::SUCCESS);
    }
    let mut entries = match (test_id, range) {
        (Some(id), _) => services.state.history_for(id),
        (None, Some((from, to))) => services.state.history_between(from, to),
        (None, None) => services.state.history(),
    }
    .map_err(state_error)?;
    if let (Some(_), Some((from, to))) = (test_id, range) {
        entries.retain(|e| (from..=to).contains(&e.timestamp));
    }
    let json = serde_json::to_string_pretty(&entries)
        .map_err(|e| CliError::failure(format!("Error encoding history: {e}")))?;
    println!("{json}");
    Ok(ExitCode::SUCCESS)
}

/// Remove every state snapshot (backups are kept).
pub fn clear_state(config: &Config) -> CliResult<ExitCode> {
    Services::new(config).state.clear_all().map_err(state_error)?;
    println!("Cleared state in {}", config.state_dir().display());
    Ok(ExitCode::SUCCESS)
}
