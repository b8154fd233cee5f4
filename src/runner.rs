//! One test run, end to end.
//!
//! [`Services`] is the composition root: it builds the process-wide error bus, impact analyzer, state manager and
//! backup manager once and wires their subscriptions. [`TestRunner`] drives a run through them:
//!
//! ```text
//! FileCollector -> Grouper -> WorkerPool (per group) -> RunState -> StateManager -> BackupManager
//! ```
//!
//! ## Notes
//!
//! - Collection issues and persistence failures are recoverable: they are published to the bus and the run goes on.
//! - An error escaping the run loop itself is fatal. It is published as `uncaught` before being returned.
//! - State contention (another run holding a state lock) only skips that write.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use proctor_core::{ErrorCategory, WorkResult};
use thiserror::Error;

use crate::clock;
use crate::collect::{CollectError, Collection, FileCollector, Grouper, TestGroup};
use crate::config::Config;
use crate::errors::{ErrorBus, ErrorReport, ImpactAnalyzer};
use crate::state::{
    AdvisoryLock, BackupManager, HistoryEntry, RunState, RunSummary, StateError, StateManager, WorkUnitKey,
    is_contention,
};
use crate::workers::{IsolatedExecutor, PoolError, PoolMetrics, PoolOptions, StopHandle, WorkerPool, executor_for};

// ============================================================================
// Services
// ============================================================================

/// The long-lived services of one process.
#[derive(Debug, Clone)]
pub struct Services {
    pub bus: Arc<ErrorBus>,
    pub impact: Arc<ImpactAnalyzer>,
    pub state: Arc<StateManager>,
    pub backups: Arc<BackupManager>,
}

impl Services {
    pub fn new(config: &Config) -> Self {
        let dir = config.state_dir();
        let lock = AdvisoryLock::new(&dir, Duration::from_millis(config.state.lock_stale_ms));

        let bus = Arc::new(ErrorBus::new());
        let impact = Arc::new(ImpactAnalyzer::new());
        let state = Arc::new(StateManager::new(&dir, lock.clone()));
        let backups = Arc::new(BackupManager::new(&dir, lock));

        bus.add_enricher(impact.clone());
        bus.subscribe(state.clone());

        Self {
            bus,
            impact,
            state,
            backups,
        }
    }
}

// ============================================================================
// Reporting
// ============================================================================

/// Progress callbacks for a run.
pub trait TestReporter: Send {
    /// Called once after collection and grouping.
    fn on_collection_complete(&mut self, file_count: usize, group_count: usize);

    fn on_group_start(&mut self, _group: &TestGroup) {}

    /// Called once per result, including collection issues.
    fn on_test_complete(&mut self, result: &WorkResult);

    fn on_run_complete(&mut self, report: &RunReport);
}

/// Reporter that ignores everything.
#[derive(Debug, Default)]
pub struct SilentReporter;

impl TestReporter for SilentReporter {
    fn on_collection_complete(&mut self, _file_count: usize, _group_count: usize) {}
    fn on_test_complete(&mut self, _result: &WorkResult) {}
    fn on_run_complete(&mut self, _report: &RunReport) {}
}

/// What a finished run hands back to its caller.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub summary: RunSummary,
    /// Every result, collection issues first, then groups in name order.
    pub results: Vec<WorkResult>,
    pub metrics: PoolMetrics,
    /// The run was stopped before every unit could execute.
    pub cancelled: bool,
}

impl RunReport {
    pub fn failures(&self) -> impl Iterator<Item = &WorkResult> {
        self.results.iter().filter(|r| r.is_failure())
    }

    pub fn passed(&self) -> bool {
        self.summary.all_passed()
    }
}

// ============================================================================
// Runner
// ============================================================================

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error(transparent)]
    Collect(#[from] CollectError),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error("state task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

pub struct TestRunner {
    config: Config,
    services: Services,
    executor: Arc<dyn IsolatedExecutor>,
    stop: StopHandle,
    scope: Option<PathBuf>,
}

impl std::fmt::Debug for TestRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestRunner")
            .field("root", &self.config.root_dir)
            .field("backend", &self.executor.backend())
            .field("scope", &self.scope)
            .finish_non_exhaustive()
    }
}

impl TestRunner {
    pub fn new(config: Config, services: Services) -> Self {
        let executor = executor_for(&config);
        Self {
            config,
            services,
            executor,
            stop: StopHandle::new(),
            scope: None,
        }
    }

    pub fn with_executor(mut self, executor: Arc<dyn IsolatedExecutor>) -> Self {
        self.executor = executor;
        self
    }

    pub fn with_stop_handle(mut self, stop: StopHandle) -> Self {
        self.stop = stop;
        self
    }

    /// Only collect under `path` (the `--path` flag).
    pub fn with_scope(mut self, path: Option<PathBuf>) -> Self {
        self.scope = path;
        self
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    /// Collect, run and persist.
    #[tracing::instrument(skip_all, fields(root = %self.config.root_dir.display(), test_type = %self.config.test_type))]
    pub async fn run(&self, reporter: &mut dyn TestReporter) -> Result<RunReport, RunnerError> {
        match self.run_inner(reporter).await {
            Ok(report) => Ok(report),
            Err(err) => {
                self.services.bus.track_error(ErrorCategory::Uncaught, ErrorReport::from_error(&err));
                Err(err)
            }
        }
    }

    async fn run_inner(&self, reporter: &mut dyn TestReporter) -> Result<RunReport, RunnerError> {
        let mut collector = FileCollector::from_config(&self.config)?;
        if let Some(scope) = &self.scope {
            collector = collector.with_scope(scope);
        }
        let collection = collector.collect().await;

        let mut state = RunState::new();
        for issue in &collection.issues {
            self.services.bus.track_error(ErrorCategory::System, ErrorReport::from_result(issue));
            state.record_issue(issue.clone());
        }

        let groups = Grouper::from_config(&self.config).group(&collection.files);
        reporter.on_collection_complete(collection.files.len(), groups.len());
        for issue in &collection.issues {
            reporter.on_test_complete(issue);
        }
        for group in &groups {
            self.services.impact.register_component(group.name.clone(), group.paths());
        }

        let pool = WorkerPool::new(Arc::clone(&self.executor), PoolOptions::from_config(&self.config))
            .with_bus(Arc::clone(&self.services.bus))
            .with_stop_handle(self.stop.clone());

        let mut history = Vec::new();
        for group in &groups {
            reporter.on_group_start(group);
            let results = pool.run_group(group, &mut state).await?;
            for result in &results {
                reporter.on_test_complete(result);
                history.push(history_entry(&pool, &group.name, result));
            }
        }
        state.finalize();

        self.persist(&collection, history).await?;
        if self.services.state.take_backup_request() {
            self.backup_now().await?;
        }

        let summary = state.summary();
        tracing::info!(
            total = summary.total_files,
            passed = summary.passed_files,
            failed = summary.failed_files,
            duration_ms = summary.duration_ms,
            "run complete"
        );
        let report = RunReport {
            summary,
            results: state.all_results(),
            metrics: pool.get_metrics(),
            cancelled: self.stop.is_stopped(),
        };
        reporter.on_run_complete(&report);
        Ok(report)
    }

    /// Write the structure snapshot, the symbol registry and the new history entries.
    async fn persist(&self, collection: &Collection, history: Vec<HistoryEntry>) -> Result<(), RunnerError> {
        let manager = Arc::clone(&self.services.state);
        let bus = Arc::clone(&self.services.bus);
        let root = self.config.root_dir.clone();
        let files = collection.files.clone();
        let directories = collection.directories.clone();

        tokio::task::spawn_blocking(move || {
            let outcomes = [
                ("structure", manager.update_structure(&root, &files, &directories).map(drop)),
                ("functions", manager.update_functions(&root, &files).map(drop)),
                ("history", manager.record_history(&history)),
            ];
            for (what, outcome) in outcomes {
                match outcome {
                    Ok(()) => {}
                    Err(err) if is_contention(&err) => {
                        tracing::warn!(snapshot = what, error = %err, "skipping state update held by another writer");
                    }
                    Err(err) => {
                        tracing::warn!(snapshot = what, error = %err, "failed to persist state");
                        bus.track_error(
                            ErrorCategory::System,
                            ErrorReport::from_error(&err).with_component(format!("state:{what}")),
                        );
                    }
                }
            }
        })
        .await?;
        Ok(())
    }

    /// Back up every tracked snapshot now (after a high-severity error).
    async fn backup_now(&self) -> Result<(), RunnerError> {
        let backups = Arc::clone(&self.services.backups);
        match tokio::task::spawn_blocking(move || backups.backup_all()).await? {
            Ok(written) => tracing::info!(count = written.len(), "wrote state backups after high-severity error"),
            Err(err) => tracing::warn!(error = %err, "state backup failed"),
        }
        Ok(())
    }
}

fn history_entry(pool: &WorkerPool, group: &str, result: &WorkResult) -> HistoryEntry {
    let worker = pool.worker(&WorkUnitKey::new(group, result.file.clone()));
    HistoryEntry {
        timestamp: clock::now_ms(),
        test_id: result.file.clone(),
        duration: result.duration_ms.unwrap_or(0),
        result: if result.is_failure() { "failed" } else { "passed" }.to_string(),
        memory_usage: worker.as_ref().map_or(0, |w| w.memory),
        cpu_usage: worker.as_ref().map_or(0.0, |w| w.cpu),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::config::Backend;
    use crate::workers::{ThreadExecutor, WorkUnit};
    use proctor_core::codes;
    use std::path::Path;

    fn project(files: &[&str]) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for file in files {
            let path = dir.path().join(file);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(&path, "export function check() {}\n").unwrap();
        }
        dir
    }

    fn config(root: &Path) -> Config {
        Config::default()
            .with_root_dir(root)
            .with_backend(Backend::Thread)
            .with_test_timeout_ms(2_000)
    }

    fn runner(config: Config, fail: &'static str) -> TestRunner {
        let services = Services::new(&config);
        let executor = ThreadExecutor::new(Arc::new(move |unit: &WorkUnit| {
            if unit.file.ends_with(fail) {
                WorkResult::error(&unit.file, "AssertionError: expected 1 to equal 2").with_code(codes::ERR_TEST_FAILED)
            } else {
                WorkResult::passed(&unit.file, "ok")
            }
        }));
        TestRunner::new(config, services).with_executor(Arc::new(executor))
    }

    #[tokio::test]
    async fn test_run_collects_executes_and_persists() {
        let dir = project(&["tests/a.test.ts", "tests/api/b.test.ts", "tests/api/c.test.ts"]);
        let runner = runner(config(dir.path()), "c.test.ts");

        let report = runner.run(&mut SilentReporter).await.unwrap();
        assert_eq!(report.summary.total_files, 3);
        assert_eq!(report.summary.failed_files, 1);
        assert!(!report.passed());
        assert_eq!(report.failures().count(), 1);
        assert!(!report.cancelled);

        let state = &runner.services().state;
        assert_eq!(state.read_structure().unwrap().unwrap().files.len(), 3);
        assert_eq!(state.read_functions().unwrap().unwrap().functions.len(), 3);
        let history = state.history().unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history.iter().filter(|e| e.result == "failed").count(), 1);
    }

    #[tokio::test]
    async fn test_scope_limits_collection() {
        let dir = project(&["tests/a.test.ts", "tests/api/b.test.ts"]);
        let runner = runner(config(dir.path()), "none").with_scope(Some(PathBuf::from("tests/api")));
        let report = runner.run(&mut SilentReporter).await.unwrap();
        assert_eq!(report.summary.total_files, 1);
        assert!(report.passed());
    }

    #[tokio::test]
    async fn test_stopped_runner_cancels_every_unit() {
        let dir = project(&["tests/a.test.ts", "tests/b.test.ts"]);
        let runner = runner(config(dir.path()), "none");
        runner.stop_handle().stop();
        let report = runner.run(&mut SilentReporter).await.unwrap();
        assert!(report.cancelled);
        assert!(report.results.iter().all(|r| r.code.as_deref() == Some(codes::ERR_CANCELLED)));
    }

    #[tokio::test]
    async fn test_invalid_pattern_is_published_as_uncaught() {
        let dir = project(&[]);
        let mut config = config(dir.path());
        config.test_pattern = "(".to_string();
        let runner = runner(config, "none");
        assert!(runner.run(&mut SilentReporter).await.is_err());
        assert_eq!(runner.services().bus.by_category(ErrorCategory::Uncaught).len(), 1);
    }

    #[tokio::test]
    async fn test_reporter_sees_every_result() {
        #[derive(Default)]
        struct Counting {
            files: usize,
            completed: usize,
            finished: bool,
        }
        impl TestReporter for Counting {
            fn on_collection_complete(&mut self, file_count: usize, _group_count: usize) {
                self.files = file_count;
            }
            fn on_test_complete(&mut self, _result: &WorkResult) {
                self.completed += 1;
            }
            fn on_run_complete(&mut self, _report: &RunReport) {
                self.finished = true;
            }
        }

        let dir = project(&["tests/a.test.ts", "tests/b.test.ts"]);
        let mut reporter = Counting::default();
        runner(config(dir.path()), "none").run(&mut reporter).await.unwrap();
        assert_eq!((reporter.files, reporter.completed, reporter.finished), (2, 2, true));
    }
}
