//! End-to-end worker pool scenarios against real executors.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use proctor::collect::{GroupPolicy, TestGroup};
use proctor::state::RunState;
use proctor::workers::pool::duplicate_results;
use proctor::workers::{IsolatedExecutor, PoolOptions, ThreadExecutor, WorkUnit, WorkerPool};
use proctor_core::{Severity, WorkResult, codes};

fn options(test_timeout: Duration) -> PoolOptions {
    PoolOptions {
        max_workers: 4,
        test_timeout,
        group_timeout: Duration::from_secs(30),
        health_interval: Duration::from_secs(5),
        termination_grace: Duration::from_millis(200),
        ..PoolOptions::default()
    }
}

fn group(name: &str, files: &[&str], max_parallel: usize) -> TestGroup {
    let policy = GroupPolicy {
        parallel: true,
        max_parallel,
        timeout: Duration::from_secs(30),
    };
    TestGroup::new(name, files.iter().copied(), policy)
}

#[cfg(unix)]
mod process {
    use super::*;
    use proctor::workers::ProcessExecutor;

    fn sh(script: &str) -> Arc<dyn IsolatedExecutor> {
        Arc::new(ProcessExecutor::new("sh").with_args(["-c", script]))
    }

    const PASS: &str =
        r#"read f; printf '{"file":"%s","type":"runtime","severity":"info","message":"ok"}\n' "$f""#;

    #[tokio::test]
    async fn passing_worker_reports_its_result() {
        let pool = WorkerPool::new(sh(PASS), options(Duration::from_secs(5)));
        let state = pool.start(&["a.test.ts", "b.test.ts"]).await.unwrap();
        let results = state.all_results();
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.severity == Severity::Info));
        assert!(state.summary().all_passed());
    }

    #[tokio::test]
    async fn hanging_worker_times_out_on_budget() {
        let pool = WorkerPool::new(sh("read f; exec sleep 5"), options(Duration::from_millis(1000)));
        let started = Instant::now();
        let state = pool.start(&["hanging.test.ts"]).await.unwrap();
        let elapsed = started.elapsed();

        let results = state.all_results();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].severity, Severity::Error);
        assert_eq!(results[0].code.as_deref(), Some(codes::ERR_TIMEOUT));
        assert!(elapsed >= Duration::from_millis(1000), "finished early: {elapsed:?}");
        assert!(elapsed < Duration::from_millis(3000), "timeout not enforced: {elapsed:?}");
    }

    #[tokio::test]
    async fn crashing_worker_is_reported_once() {
        let pool = WorkerPool::new(sh("read f; echo dying >&2; exit 3"), options(Duration::from_secs(5)));
        let state = pool.start(&["crash.test.ts"]).await.unwrap();
        let results = state.all_results();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].code.as_deref(), Some(codes::ERR_WORKER_EXIT));
        assert_eq!(results[0].console_output, Some(vec!["dying".to_string()]));
    }

    #[tokio::test]
    async fn sequential_group_runs_one_at_a_time() {
        let script = format!("sleep 0.3; {PASS}");
        let pool = WorkerPool::new(sh(&script), options(Duration::from_secs(5)));
        let mut state = RunState::new();
        let started = Instant::now();
        let results = pool
            .run_group(&group("core", &["a.test.ts", "b.test.ts"], 1), &mut state)
            .await
            .unwrap();
        assert_eq!(results.len(), 2);
        assert!(started.elapsed() >= Duration::from_millis(600));
        assert!(state.is_group_complete("core"));
    }

    /// The real `proctor-worker` binary, running each file with `sh` inside `dir`.
    fn worker(dir: &std::path::Path) -> Arc<dyn IsolatedExecutor> {
        Arc::new(
            ProcessExecutor::new(env!("CARGO_BIN_EXE_proctor-worker"))
                .with_cwd(dir)
                .with_test_command(vec!["sh".to_string(), "{file}".to_string()]),
        )
    }

    #[tokio::test]
    async fn timed_out_test_leaves_no_processes_behind() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("hang.test.sh"), "(sleep 2; touch survived) &\nwait\n").unwrap();

        let pool = WorkerPool::new(worker(dir.path()), options(Duration::from_millis(300)));
        let state = pool.start(&["hang.test.sh"]).await.unwrap();
        let results = state.all_results();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].code.as_deref(), Some(codes::ERR_TIMEOUT));

        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert!(!dir.path().join("survived").exists(), "test process outlived its timeout");
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn memory_ceiling_covers_the_test_process() {
        let dir = tempfile::tempdir().unwrap();
        // `tail -c` buffers its input until EOF, which never comes.
        std::fs::write(dir.path().join("hog.test.sh"), "cat /dev/zero | tail -c 200000000\n").unwrap();

        let options = PoolOptions {
            memory_limit: 20 * 1024 * 1024,
            health_interval: Duration::from_millis(50),
            ..options(Duration::from_secs(10))
        };
        let pool = WorkerPool::new(worker(dir.path()), options);
        let started = Instant::now();
        let state = pool.start(&["hog.test.sh"]).await.unwrap();

        let results = state.all_results();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].code.as_deref(), Some(codes::ERR_MEMORY_LIMIT));
        assert!(started.elapsed() < Duration::from_secs(10), "breach not detected before the timeout");
    }

    #[tokio::test]
    async fn worker_binary_runs_a_passing_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("ok.test.sh"), "echo fine\n").unwrap();

        let pool = WorkerPool::new(worker(dir.path()), options(Duration::from_secs(5)));
        let state = pool.start(&["ok.test.sh"]).await.unwrap();
        let results = state.all_results();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].severity, Severity::Info);
        assert_eq!(results[0].console_output, Some(vec!["fine".to_string()]));
    }

    #[tokio::test]
    async fn missing_worker_program_fails_each_unit() {
        let executor: Arc<dyn IsolatedExecutor> = Arc::new(ProcessExecutor::new("/no/such/worker"));
        let pool = WorkerPool::new(executor, options(Duration::from_secs(5)));
        let state = pool.start(&["a.test.ts"]).await.unwrap();
        let results = state.all_results();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].code.as_deref(), Some(codes::ERR_WORKER));
    }
}

/// Thread executor that records the highest number of concurrently running units.
fn counting_executor(running: Arc<AtomicUsize>, peak: Arc<AtomicUsize>) -> Arc<dyn IsolatedExecutor> {
    Arc::new(ThreadExecutor::new(Arc::new(move |unit: &WorkUnit| {
        let now = running.fetch_add(1, Ordering::SeqCst) + 1;
        peak.fetch_max(now, Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(50));
        running.fetch_sub(1, Ordering::SeqCst);
        WorkResult::passed(&unit.file, "ok")
    })))
}

#[tokio::test]
async fn concurrency_never_exceeds_max_parallel() {
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let pool = WorkerPool::new(counting_executor(running, Arc::clone(&peak)), options(Duration::from_secs(5)));

    let files: Vec<String> = (0..8).map(|i| format!("t{i}.test.ts")).collect();
    let refs: Vec<&str> = files.iter().map(String::as_str).collect();
    let mut state = RunState::new();
    let results = pool.run_group(&group("wide", &refs, 3), &mut state).await.unwrap();

    assert_eq!(results.len(), 8);
    assert!(duplicate_results(&results).is_empty());
    let peak = peak.load(Ordering::SeqCst);
    assert!(peak <= 3, "peak concurrency {peak}");
    assert!(peak >= 1);
}

#[tokio::test]
async fn every_unit_gets_exactly_one_result() {
    let pool = WorkerPool::new(
        Arc::new(ThreadExecutor::new(Arc::new(|unit: &WorkUnit| {
            if unit.file.contains("panic") {
                panic!("test code blew up");
            }
            WorkResult::passed(&unit.file, "ok")
        }))),
        options(Duration::from_secs(5)),
    );
    let files = ["a.test.ts", "panic.test.ts", "b.test.ts"];
    let state = pool.start(&files).await.unwrap();
    let results = state.all_results();
    assert_eq!(results.len(), files.len());
    assert!(duplicate_results(&results).is_empty());
    assert_eq!(results.iter().filter(|r| r.is_failure()).count(), 1);
    assert_eq!(state.completed_count(), files.len());
}

#[tokio::test]
async fn stop_is_idempotent_and_cancels_pending_work() {
    let pool = WorkerPool::new(
        counting_executor(Arc::new(AtomicUsize::new(0)), Arc::new(AtomicUsize::new(0))),
        options(Duration::from_secs(5)),
    );
    pool.stop();
    pool.stop();
    let state = pool.start(&["a.test.ts", "b.test.ts"]).await.unwrap();
    assert!(state.all_results().iter().all(|r| r.code.as_deref() == Some(codes::ERR_CANCELLED)));
    assert_eq!(pool.get_metrics().total_memory, 0);
}
