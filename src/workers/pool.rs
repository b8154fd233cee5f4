//! The bounded worker pool.
//!
//! A group's files are dispatched in batches of at most `min(group batch size, maxWorkers)` lifecycles. A batch runs
//! to completion before the next one starts, so concurrency never exceeds the batch size. While a batch runs, the
//! pool:
//! - records executor ids and metrics samples reported by its lifecycles,
//! - runs a health check every `health.intervalMs` that interrupts workers over the memory ceiling or idle for
//!   longer than the test timeout, and
//! - interrupts everything still running when the group's time budget runs out.
//!
//! ## Notes
//!
//! - With `health.requeueOnBreach`, a breached unit is abandoned in the run state and put back at the front of the
//!   queue (up to `health.maxRestarts` times). Its old executor is fully torn down before the lifecycle returns, so
//!   the replacement never overlaps it.
//! - Stopping is cooperative: [`StopHandle::stop`] flips a watch channel every lifecycle listens to. Running
//!   executors are terminated, then killed after the grace period. Units not yet dispatched finish as
//!   `ERR_CANCELLED`.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use proctor_core::{ErrorCategory, LifecycleState, WorkResult, codes};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::Instant;

use super::executor::{IsolatedExecutor, WorkUnit};
use super::lifecycle::{BreachKind, Interrupt, LifecycleContext, LifecycleEvent, Outcome, run_lifecycle};
use super::metrics::{PoolMetrics, WorkerHandle, WorkerMetricsManager, sample_tree_rss};
use crate::clock;
use crate::collect::{GroupPolicy, TestGroup};
use crate::config::Config;
use crate::errors::{ErrorBus, ErrorReport};
use crate::state::{RunState, RunStateError, WorkUnitKey};

/// Name of the ad-hoc group used by [`WorkerPool::start`].
pub const POOL_GROUP: &str = "pool";

#[derive(Debug, Error)]
pub enum PoolError {
    #[error(transparent)]
    RunState(#[from] RunStateError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolOptions {
    pub max_workers: usize,
    pub test_timeout: Duration,
    pub group_timeout: Duration,
    pub health_interval: Duration,
    pub memory_limit: u64,
    pub requeue_on_breach: bool,
    pub max_restarts: u32,
    pub termination_grace: Duration,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl PoolOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_workers: config.parallelization.max_workers.max(1),
            test_timeout: config.test_timeout(),
            group_timeout: config.group_timeout(),
            health_interval: config.health_interval(),
            memory_limit: config.health.memory_limit_bytes,
            requeue_on_breach: config.health.requeue_on_breach,
            max_restarts: config.health.max_restarts,
            termination_grace: config.executor.termination_grace(),
        }
    }
}

/// Cloneable, idempotent stop switch shared by the pool and signal handlers.
#[derive(Debug, Clone)]
pub struct StopHandle {
    stopped: Arc<AtomicBool>,
    tx: Arc<watch::Sender<bool>>,
}

impl Default for StopHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl StopHandle {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self {
            stopped: Arc::new(AtomicBool::new(false)),
            tx: Arc::new(tx),
        }
    }

    /// Request a stop. Returns `true` for the call that actually flipped the switch.
    pub fn stop(&self) -> bool {
        let first = !self.stopped.swap(true, Ordering::SeqCst);
        if first {
            self.tx.send_replace(true);
        }
        first
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

pub struct WorkerPool {
    executor: Arc<dyn IsolatedExecutor>,
    options: PoolOptions,
    metrics: Mutex<WorkerMetricsManager>,
    bus: Option<Arc<ErrorBus>>,
    stop: StopHandle,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("backend", &self.executor.backend())
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl WorkerPool {
    pub fn new(executor: Arc<dyn IsolatedExecutor>, options: PoolOptions) -> Self {
        Self {
            executor,
            options,
            metrics: Mutex::new(WorkerMetricsManager::new()),
            bus: None,
            stop: StopHandle::new(),
        }
    }

    pub fn with_bus(mut self, bus: Arc<ErrorBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Share a stop switch created elsewhere (e.g. by the signal handler).
    pub fn with_stop_handle(mut self, stop: StopHandle) -> Self {
        self.stop = stop;
        self
    }

    pub fn options(&self) -> &PoolOptions {
        &self.options
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Stop accepting work and tear down running executors. Safe to call repeatedly and from signal handlers.
    pub fn stop(&self) {
        if self.stop.stop() {
            tracing::info!("worker pool stopping");
        }
    }

    pub fn get_metrics(&self) -> PoolMetrics {
        self.metrics().aggregate()
    }

    /// Last known handle of the worker that ran `key`.
    pub fn worker(&self, key: &WorkUnitKey) -> Option<WorkerHandle> {
        self.metrics().get(key).cloned()
    }

    fn metrics(&self) -> MutexGuard<'_, WorkerMetricsManager> {
        self.metrics.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `files` as one ad-hoc group with the pool's own limits.
    pub async fn start<S: AsRef<str>>(&self, files: &[S]) -> Result<RunState, PoolError> {
        let policy = GroupPolicy {
            parallel: true,
            max_parallel: self.options.max_workers,
            timeout: self.options.group_timeout,
        };
        let group = TestGroup::new(POOL_GROUP, files.iter().map(|f| f.as_ref().to_string()), policy);
        let mut state = RunState::new();
        self.run_group(&group, &mut state).await?;
        state.finalize();
        Ok(state)
    }

    /// Run every file of `group`, recording each start and result in `state`.
    ///
    /// ## Returns
    /// - The group's results in completion order, one per file.
    #[tracing::instrument(skip_all, fields(group = %group.name, files = group.len()))]
    pub async fn run_group(&self, group: &TestGroup, state: &mut RunState) -> Result<Vec<WorkResult>, PoolError> {
        if state.group(&group.name).is_none() {
            state.add_group(group.clone());
        }
        let batch_size = group.policy.batch_size().min(self.options.max_workers.max(1));
        let deadline = Instant::now() + group.policy.timeout;
        let mut pending: VecDeque<String> = group.paths().map(str::to_string).collect();
        let mut restarts: HashMap<String, u32> = HashMap::new();
        let mut results = Vec::with_capacity(pending.len());

        while !pending.is_empty() {
            if self.stop.is_stopped() || Instant::now() >= deadline {
                let stopped = self.stop.is_stopped();
                for file in pending.drain(..) {
                    let result = if stopped {
                        WorkResult::error(&file, "Run cancelled before the test started").with_code(codes::ERR_CANCELLED)
                    } else {
                        WorkResult::error(
                            &file,
                            format!("Group {} timed out after {}ms", group.name, group.policy.timeout.as_millis()),
                        )
                        .with_code(codes::ERR_GROUP_TIMEOUT)
                    };
                    state.start_test(&group.name, &file)?;
                    state.complete_test(&group.name, &file, result.clone())?;
                    results.push(result);
                }
                break;
            }

            let take = batch_size.min(pending.len());
            let batch: Vec<String> = pending.drain(..take).collect();
            for file in &batch {
                state.start_test(&group.name, file)?;
            }
            tracing::debug!(size = batch.len(), remaining = pending.len(), "dispatching batch");

            let mut requeue = Vec::new();
            for outcome in self.run_batch(group, batch, deadline).await {
                let file = outcome.unit.file.clone();
                let restarted = restarts.get(&file).copied().unwrap_or(0);
                if outcome.breach.is_some() && self.options.requeue_on_breach && restarted < self.options.max_restarts {
                    tracing::warn!(%file, attempt = restarted + 1, "re-queuing unit after resource breach");
                    self.track_outcome(&group.name, &outcome);
                    state.abandon_test(&group.name, &file);
                    restarts.insert(file.clone(), restarted + 1);
                    requeue.push(file);
                    continue;
                }
                self.track_outcome(&group.name, &outcome);
                state.complete_test(&group.name, &file, outcome.result.clone())?;
                results.push(outcome.result);
            }
            for file in requeue.into_iter().rev() {
                pending.push_front(file);
            }
        }

        let expired = state.expire_group(&group.name);
        results.extend(expired);
        if self.stop.is_stopped() {
            self.metrics().clear();
        }
        Ok(results)
    }

    /// Run one batch to completion. Outcomes come back in the batch's file order.
    async fn run_batch(&self, group: &TestGroup, files: Vec<String>, deadline: Instant) -> Vec<Outcome> {
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let mut interrupts: HashMap<WorkUnitKey, mpsc::Sender<Interrupt>> = HashMap::new();
        let mut units = Vec::with_capacity(files.len());
        let mut tasks = JoinSet::new();

        for file in files {
            let unit = WorkUnit::new(&group.name, file, self.options.test_timeout);
            let (interrupt_tx, interrupt_rx) = mpsc::channel(1);
            self.metrics().register(unit.key());
            interrupts.insert(unit.key(), interrupt_tx);
            let ctx = LifecycleContext {
                events: event_tx.clone(),
                interrupts: interrupt_rx,
                shutdown: self.stop.subscribe(),
                grace: self.options.termination_grace,
            };
            let executor = Arc::clone(&self.executor);
            let task_unit = unit.clone();
            tasks.spawn(async move { run_lifecycle(executor.as_ref(), task_unit, ctx).await });
            units.push(unit);
        }
        drop(event_tx);

        let period = self.options.health_interval.max(Duration::from_millis(10));
        let mut health = tokio::time::interval_at(Instant::now() + period, period);
        health.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let group_deadline = tokio::time::sleep_until(deadline);
        tokio::pin!(group_deadline);
        let mut deadline_fired = false;
        let mut finished: HashMap<String, Outcome> = HashMap::new();

        loop {
            tokio::select! {
                joined = tasks.join_next() => match joined {
                    None => break,
                    Some(Ok(outcome)) => {
                        let key = outcome.unit.key();
                        self.metrics().finish(&key, outcome.state.worker_status());
                        interrupts.remove(&key);
                        tracing::debug!(file = %outcome.unit.file, state = ?outcome.state, "unit finished");
                        finished.insert(outcome.unit.file.clone(), outcome);
                    }
                    Some(Err(err)) => tracing::error!(error = %err, "lifecycle task failed"),
                },
                Some(event) = event_rx.recv() => self.on_event(event),
                _ = health.tick() => self.health_check(&interrupts),
                _ = &mut group_deadline, if !deadline_fired => {
                    deadline_fired = true;
                    tracing::warn!(group = %group.name, running = interrupts.len(), "group deadline reached");
                    for tx in interrupts.values() {
                        let _ = tx.try_send(Interrupt::GroupDeadline {
                            group: group.name.clone(),
                            budget: group.policy.timeout,
                        });
                    }
                }
            }
        }
        while let Ok(event) = event_rx.try_recv() {
            self.on_event(event);
        }

        units
            .into_iter()
            .map(|unit| match finished.remove(&unit.file) {
                Some(outcome) => outcome,
                None => {
                    self.metrics().finish(&unit.key(), LifecycleState::Failed.worker_status());
                    lost_outcome(unit)
                }
            })
            .collect()
    }

    fn on_event(&self, event: LifecycleEvent) {
        let mut metrics = self.metrics();
        match event {
            LifecycleEvent::Spawned { key, id } => metrics.mark_running(&key, id),
            LifecycleEvent::Metrics { key, memory, cpu } => metrics.update(&key, memory, Some(cpu), true),
            LifecycleEvent::Activity { key } => metrics.touch(&key),
        }
    }

    /// Interrupt workers that are over the memory ceiling or have gone quiet for longer than the test timeout.
    fn health_check(&self, interrupts: &HashMap<WorkUnitKey, mpsc::Sender<Interrupt>>) {
        let now = clock::now_ms();
        let mut breaches = Vec::new();
        {
            let mut metrics = self.metrics();
            let samples: Vec<(WorkUnitKey, u64)> = metrics
                .active()
                .filter_map(|(key, worker)| Some((key.clone(), sample_tree_rss(worker.id?.pid()?)?)))
                .collect();
            for (key, rss) in samples {
                metrics.update(&key, rss, None, false);
            }
            for (key, worker) in metrics.active() {
                if worker.memory > self.options.memory_limit {
                    breaches.push((
                        key.clone(),
                        BreachKind::Memory {
                            observed: worker.memory,
                            limit: self.options.memory_limit,
                        },
                    ));
                } else if clock::is_older_than(worker.last_activity, self.options.test_timeout, now) {
                    breaches.push((
                        key.clone(),
                        BreachKind::Inactivity {
                            idle: Duration::from_millis(now.saturating_sub(worker.last_activity)),
                        },
                    ));
                }
            }
        }
        for (key, breach) in breaches {
            tracing::warn!(unit = %key, ?breach, "worker breached its budget");
            if let Some(tx) = interrupts.get(&key) {
                let _ = tx.try_send(Interrupt::Breach(breach));
            }
        }
    }

    /// Publish non-passing outcomes to the error bus.
    fn track_outcome(&self, group: &str, outcome: &Outcome) {
        let Some(bus) = &self.bus else { return };
        let category = match outcome.state {
            LifecycleState::Completed if outcome.result.is_failure() => ErrorCategory::Assertion,
            LifecycleState::Completed | LifecycleState::Starting | LifecycleState::Running => return,
            LifecycleState::TimedOut => ErrorCategory::Timeout,
            LifecycleState::Crashed => ErrorCategory::Process,
            LifecycleState::Failed => match outcome.result.code.as_deref() {
                Some(codes::ERR_MEMORY_LIMIT) => ErrorCategory::Memory,
                Some(codes::ERR_TIMEOUT | codes::ERR_GROUP_TIMEOUT) => ErrorCategory::Timeout,
                Some(codes::ERR_CANCELLED) => ErrorCategory::System,
                _ => ErrorCategory::Process,
            },
        };
        bus.track_error(
            category,
            ErrorReport::from_result(&outcome.result).with_context("group", group),
        );
    }
}

/// Result for a unit whose lifecycle task died without reporting.
fn lost_outcome(unit: WorkUnit) -> Outcome {
    let result = WorkResult::error(&unit.file, "Worker lifecycle task failed").with_code(codes::ERR_WORKER);
    Outcome {
        unit,
        state: LifecycleState::Failed,
        result,
        breach: None,
        suppressed: 0,
        executor: None,
    }
}

/// Files that produced more than one result in `results`. Empty when every unit resolved exactly once.
pub fn duplicate_results(results: &[WorkResult]) -> Vec<String> {
    let mut seen = HashSet::new();
    results
        .iter()
        .filter(|r| !seen.insert(r.file.as_str()))
        .map(|r| r.file.clone())
        .collect()
}
